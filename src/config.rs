use crate::types::Epoch;
use serde::{Deserialize, Serialize};
use std::fs::File;

pub const fn log_level() -> LogLevel {
    LogLevel::Info
}

pub const fn slots_per_epoch() -> u64 {
    32
}

pub const fn seconds_per_slot() -> u64 {
    12
}

// Mainnet Altair activation.
pub const fn altair_fork_epoch() -> Epoch {
    Epoch::new(74_240)
}

pub const fn in_memory_epochs() -> u64 {
    3
}

pub const fn cache_persistence_delay() -> u64 {
    4
}

pub const fn sync_epoch_cooldown_secs() -> u64 {
    2
}

pub const fn max_parallel_validator_set_requests() -> usize {
    2
}

pub const fn duty_call_timeout_secs() -> u64 {
    30
}

pub const fn validator_set_call_timeout_secs() -> u64 {
    120
}

fn database_file() -> String {
    "beacon_watch.sqlite".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "log_level")]
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: log_level() }
    }
}

/// Static parameters of the chain being indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "slots_per_epoch")]
    pub slots_per_epoch: u64,
    #[serde(default = "seconds_per_slot")]
    pub seconds_per_slot: u64,
    #[serde(default)]
    pub genesis_time: u64,
    #[serde(default = "altair_fork_epoch")]
    pub altair_fork_epoch: Epoch,
    /// Once this fork activates, proposer assignments can no longer be derived ahead of time and
    /// the unknown-proposer sentinel is recorded instead.
    #[serde(default)]
    pub whisk_fork_epoch: Option<Epoch>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            slots_per_epoch: slots_per_epoch(),
            seconds_per_slot: seconds_per_slot(),
            genesis_time: 0,
            altair_fork_epoch: altair_fork_epoch(),
            whisk_fork_epoch: None,
        }
    }
}

impl ChainConfig {
    pub fn whisk_active_at(&self, epoch: Epoch) -> bool {
        self.whisk_fork_epoch
            .map_or(false, |fork_epoch| epoch >= fork_epoch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub skip_validators: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconApiConfig {
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default = "duty_call_timeout_secs")]
    pub duty_call_timeout_secs: u64,
    #[serde(default = "validator_set_call_timeout_secs")]
    pub validator_set_call_timeout_secs: u64,
}

impl Default for BeaconApiConfig {
    fn default() -> Self {
        BeaconApiConfig {
            endpoints: Vec::new(),
            duty_call_timeout_secs: duty_call_timeout_secs(),
            validator_set_call_timeout_secs: validator_set_call_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Number of epochs kept in memory past finalization.
    #[serde(default = "in_memory_epochs")]
    pub in_memory_epochs: u64,
    /// Number of epochs an already persisted epoch lingers in memory before pruning.
    #[serde(default = "cache_persistence_delay")]
    pub cache_persistence_delay: u64,
    #[serde(default)]
    pub disable_index_writer: bool,
    #[serde(default)]
    pub disable_synchronizer: bool,
    #[serde(default = "sync_epoch_cooldown_secs")]
    pub sync_epoch_cooldown_secs: u64,
    #[serde(default = "max_parallel_validator_set_requests")]
    pub max_parallel_validator_set_requests: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            in_memory_epochs: in_memory_epochs(),
            cache_persistence_delay: cache_persistence_delay(),
            disable_index_writer: false,
            disable_synchronizer: false,
            sync_epoch_cooldown_secs: sync_epoch_cooldown_secs(),
            max_parallel_validator_set_requests: max_parallel_validator_set_requests(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "database_file")]
    pub file: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            file: database_file(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorNamesConfig {
    #[serde(default)]
    pub yaml: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub beacon_api: BeaconApiConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub validator_names: ValidatorNamesConfig,
}

impl Config {
    pub fn load_from_file(path_to_file: String) -> Result<Config, String> {
        let file =
            File::open(path_to_file).map_err(|e| format!("Error reading config file: {:?}", e))?;
        let config: Config =
            serde_yaml::from_reader(file).map_err(|e| format!("Error parsing config: {:?}", e))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.chain.slots_per_epoch, 32);
        assert_eq!(config.indexer.in_memory_epochs, 3);
        assert!(!config.chain.whisk_active_at(Epoch::new(u64::MAX - 1)));
    }

    #[test]
    fn parse_minimal_yaml() {
        let yaml = r#"
chain:
  slots_per_epoch: 32
  altair_fork_epoch: 2
  whisk_fork_epoch: 10
beacon_api:
  endpoints:
    - url: "http://localhost:5052"
      name: "local"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.chain.altair_fork_epoch, Epoch::new(2));
        assert!(config.chain.whisk_active_at(Epoch::new(10)));
        assert!(!config.chain.whisk_active_at(Epoch::new(9)));
        assert_eq!(config.beacon_api.endpoints.len(), 1);
        assert!(!config.beacon_api.endpoints[0].skip_validators);
    }
}
