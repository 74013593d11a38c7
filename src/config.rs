use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding the Sled database (journal, entities, watermarks).
    pub data_dir: String,
    /// Sync server address, e.g. `127.0.0.1:7000`.
    pub server: String,
    pub initial_batch_size: usize,
    /// Pause after each wake-up so bursts of local writes share a round trip.
    pub burst_delay_ms: u64,
    /// Period of the background refresh tick; `None` disables it.
    pub background_sync_secs: Option<u64>,
    /// Pause before a crashed worker is restarted.
    pub restart_delay_ms: u64,
    /// Whether the sync feature is rolled out for this install.
    pub sync_enabled: bool,
    pub waiting_pool: WaitingPoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitingPoolConfig {
    pub settle_ms: u64,
    pub max_hold_secs: u64,
}

impl Default for WaitingPoolConfig {
    fn default() -> Self {
        Self {
            settle_ms: 1000,
            max_hold_secs: 15,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            server: "127.0.0.1:7000".to_string(),
            initial_batch_size: 4,
            burst_delay_ms: 500,
            background_sync_secs: Some(900),
            restart_delay_ms: 1000,
            sync_enabled: true,
            waiting_pool: WaitingPoolConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Read a JSON config file; missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply `TASKSYNC_*` environment overrides on top of the current values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("TASKSYNC_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Ok(server) = std::env::var("TASKSYNC_SERVER") {
            self.server = server;
        }
        if let Some(size) = env_parse::<usize>("TASKSYNC_BATCH_SIZE").filter(|&n| n > 0) {
            self.initial_batch_size = size;
        }
        if let Some(ms) = env_parse::<u64>("TASKSYNC_BURST_DELAY_MS") {
            self.burst_delay_ms = ms;
        }
        if let Some(secs) = env_parse::<u64>("TASKSYNC_BACKGROUND_SYNC_SECS") {
            self.background_sync_secs = (secs > 0).then_some(secs);
        }
        if let Some(enabled) = env_parse::<bool>("TASKSYNC_SYNC_ENABLED") {
            self.sync_enabled = enabled;
        }
        self
    }

    pub fn burst_delay(&self) -> Duration {
        Duration::from_millis(self.burst_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn background_interval(&self) -> Option<Duration> {
        self.background_sync_secs.map(Duration::from_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}
