pub mod config;
pub mod downstream;
pub mod error;
pub mod identity;
pub mod model;
pub mod state;
pub mod store;
