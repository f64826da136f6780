use std::sync::Arc;

use poll_core::{SubscriptionBroker, VoteCoordinator};
use tokio::sync::broadcast;

use crate::poll_logic::config::Config;
use crate::poll_logic::store::AnyStore;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<VoteCoordinator<AnyStore>>,
    // Tells open WebSocket sessions to wind down
    shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(store: AnyStore, config: &Config, shutdown_tx: broadcast::Sender<()>) -> Self {
        let store = Arc::new(store);
        let broker = Arc::new(SubscriptionBroker::new(
            Arc::clone(&store),
            &config.broker_config(),
        ));
        let coordinator = Arc::new(VoteCoordinator::new(
            store,
            broker,
            config.coordinator_config(),
        ));
        Self {
            coordinator,
            shutdown_tx,
        }
    }

    pub fn broker(&self) -> &Arc<SubscriptionBroker<AnyStore>> {
        self.coordinator.broker()
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
