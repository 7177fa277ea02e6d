use std::sync::OnceLock;

use serde::Deserialize;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_slots_size() -> usize {
    262144
}

fn default_op_win_pool_size() -> usize {
    256
}

fn default_op_global_pool_size() -> usize {
    16384
}

fn default_target_win_pool_size() -> usize {
    256
}

fn default_target_global_pool_size() -> usize {
    16384
}

fn default_piggyback_lock_data_size() -> usize {
    65536
}

fn default_stream_unit_size() -> usize {
    262144
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Seconds a synchronization call may wait before a potential deadlock is reported, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// Upper bound on the number of target directory slots per window, default: 262144
    #[serde(default = "default_slots_size")]
    pub slots_size: usize,

    /// Number of operation records each window preallocates, default: 256
    #[serde(default = "default_op_win_pool_size")]
    pub op_win_pool_size: usize,

    /// Number of operation records shared by all windows, default: 16384
    #[serde(default = "default_op_global_pool_size")]
    pub op_global_pool_size: usize,

    #[serde(default = "default_target_win_pool_size")]
    pub target_win_pool_size: usize,

    #[serde(default = "default_target_global_pool_size")]
    pub target_global_pool_size: usize,

    /// Largest payload (in bytes) that may carry a piggybacked lock request, 0 disables piggybacking, default: 65536
    #[serde(default = "default_piggyback_lock_data_size")]
    pub piggyback_lock_data_size: usize,

    /// Size in bytes of one streamed accumulate unit, default: 262144
    #[serde(default = "default_stream_unit_size")]
    pub stream_unit_size: usize,

    /// Keep operations pending until a synchronization call so locks and sync directives can ride on them, default: false
    #[serde(default)]
    pub delay_issuing_for_piggybacking: bool,

    /// flag used to print warnings when a synchronization call exceeds the deadlock timeout. Default: true
    pub sync_timeout_warning: Option<bool>,

    /// flag used to print warnings when a synchronization handle is dropped before completing. Default: true
    pub dropped_handle_warning: Option<bool>,
}

impl Config {
    /// Read the configuration from `RMA_`-prefixed environment variables
    pub fn from_env() -> Result<Config, envy::Error> {
        envy::prefixed("RMA_").from_env::<Config>()
    }
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match Config::from_env() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
