use clap::Parser;
use poll_core::{BrokerConfig, CoordinatorConfig, StoreConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "server_polls.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Live poll voting server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "POLLS_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "POLLS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "POLLS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "POLLS_LOG_LEVEL", help = "Logging level or filter directive (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "POLLS_REDIS_URL", help = "Redis URL of the poll store. In-memory store when unset.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "POLLS_MAX_ATTEMPTS", help = "Transactions attempted per vote before reporting contention.")]
    pub max_attempts: Option<u32>,

    #[clap(long, env = "POLLS_BACKOFF_BASE_MS", help = "Base of the jittered backoff after a lost commit race.")]
    pub backoff_base_ms: Option<u64>,

    #[clap(long, env = "POLLS_BACKOFF_MAX_MS", help = "Upper bound of a single backoff pause.")]
    pub backoff_max_ms: Option<u64>,

    #[clap(long, env = "POLLS_RETRY_BUDGET_MS", help = "Wall-clock budget for all attempts of one vote.")]
    pub retry_budget_ms: Option<u64>,

    #[clap(long, env = "POLLS_STORE_TIMEOUT_MS", help = "Timeout of a single store transaction.")]
    pub store_timeout_ms: Option<u64>,

    #[clap(long, env = "POLLS_LINGER_SECS", help = "Seconds a poll's live channel outlives its last viewer.")]
    pub linger_secs: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            redis_url: other.redis_url.or(self.redis_url),
            max_attempts: other.max_attempts.or(self.max_attempts),
            backoff_base_ms: other.backoff_base_ms.or(self.backoff_base_ms),
            backoff_max_ms: other.backoff_max_ms.or(self.backoff_max_ms),
            retry_budget_ms: other.retry_budget_ms.or(self.retry_budget_ms),
            store_timeout_ms: other.store_timeout_ms.or(self.store_timeout_ms),
            linger_secs: other.linger_secs.or(self.linger_secs),
        }
    }

    fn defaults() -> Config {
        let coordinator = CoordinatorConfig::default();
        Config {
            port: Some(9010),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            max_attempts: Some(coordinator.max_attempts),
            backoff_base_ms: Some(coordinator.backoff_base_ms),
            backoff_max_ms: Some(coordinator.backoff_max_ms),
            retry_budget_ms: Some(coordinator.retry_budget_ms),
            store_timeout_ms: Some(coordinator.store_timeout_ms),
            linger_secs: Some(BrokerConfig::default().linger_secs),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(9010)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            redis_url: self.redis_url.clone(),
            ..StoreConfig::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        let defaults = CoordinatorConfig::default();
        CoordinatorConfig {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            backoff_base_ms: self.backoff_base_ms.unwrap_or(defaults.backoff_base_ms),
            backoff_max_ms: self.backoff_max_ms.unwrap_or(defaults.backoff_max_ms),
            retry_budget_ms: self.retry_budget_ms.unwrap_or(defaults.retry_budget_ms),
            store_timeout_ms: self.store_timeout_ms.unwrap_or(defaults.store_timeout_ms),
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            linger_secs: self
                .linger_secs
                .unwrap_or(BrokerConfig::default().linger_secs),
        }
    }
}

/// Resolves the configuration: defaults, then the JSON config file, then
/// environment variables and CLI arguments.
pub fn load_config() -> Config {
    resolve(Config::parse())
}

fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

// Logging is not up yet when this runs, so problems go to stderr.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        return None;
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            eprintln!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&contents) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}
