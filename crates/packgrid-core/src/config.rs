//! packgrid.toml configuration parser.
//!
//! Every section is optional; an empty file yields the defaults the
//! daemon ships with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    /// Root directory holding one sub-directory per collection.
    pub data_dir: PathBuf,
    /// Where SSH private keys referenced by engines live.
    pub ssh_keys_dir: Option<PathBuf>,
    pub queues: QueueLimits,
    pub timers: TimerConfig,
    pub engine: EngineSettings,
    pub scheduler: SchedulerSettings,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./database"),
            ssh_keys_dir: None,
            queues: QueueLimits::default(),
            timers: TimerConfig::default(),
            engine: EngineSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn ssh_keys_dir(&self) -> PathBuf {
        self.ssh_keys_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sshKeys"))
    }

    pub fn perf_logs_dir(&self) -> PathBuf {
        self.data_dir.join("perfLogs")
    }
}

/// Concurrency ceiling per operation category, per engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueLimits {
    pub other: usize,
    pub packs: usize,
    pub containers: usize,
    pub images: usize,
    pub prune: usize,
    pub data_collection: usize,
    pub container_data: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            other: 10,
            packs: 100,
            containers: 100,
            images: 1,
            prune: 1,
            data_collection: 1,
            container_data: 1,
        }
    }
}

/// Periodic reconciliation intervals, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimerConfig {
    pub state_refresh_secs: u64,
    pub state_refresh_first_secs: u64,
    pub auto_delete_check_secs: u64,
    pub auto_delete_timeout_secs: u64,
    pub ping_check_secs: u64,
    pub dumps_check_secs: u64,
    pub perf_collection_secs: u64,
    pub perf_collection_min_secs: u64,
    pub image_prune_secs: u64,
    pub image_prune_min_secs: u64,
    /// Age filter handed to the daemon's image prune.
    pub image_prune_until: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            state_refresh_secs: 60,
            state_refresh_first_secs: 5,
            auto_delete_check_secs: 60,
            auto_delete_timeout_secs: 5 * 60,
            ping_check_secs: 60,
            dumps_check_secs: 5 * 60,
            perf_collection_secs: 300,
            perf_collection_min_secs: 60,
            image_prune_secs: 3 * 86_400,
            image_prune_min_secs: 30 * 60,
            image_prune_until: "72h".to_string(),
        }
    }
}

/// Connection and retry policy for engine controllers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    pub retry_start_secs: u64,
    pub retry_step_secs: u64,
    pub retry_max_secs: u64,
    pub ping_attempts: u32,
    pub ping_retry_delay_ms: u64,
    pub tunnel_close_wait_secs: u64,
    pub exec_timeout_secs: u64,
    /// Remote daemon socket the SSH tunnel forwards to.
    pub remote_socket: String,
    /// First local port probed for tunnel endpoints.
    pub tunnel_port_base: u16,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_start_secs: 10,
            retry_step_secs: 10,
            retry_max_secs: 300,
            ping_attempts: 3,
            ping_retry_delay_ms: 1000,
            tunnel_close_wait_secs: 10,
            exec_timeout_secs: 60,
            remote_socket: "/var/run/docker.sock".to_string(),
            tunnel_port_base: 2222,
        }
    }
}

impl EngineSettings {
    /// Backoff after `failures` consecutive failures (0 → start value).
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let secs = self
            .retry_start_secs
            .saturating_add(self.retry_step_secs.saturating_mul(u64::from(failures)))
            .min(self.retry_max_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub build_retry_secs: u64,
    /// Periodic deploy re-match; `0` leaves matching purely event driven.
    pub rematch_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            build_retry_secs: 60,
            rematch_secs: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config: GridConfig = toml::from_str("").unwrap();
        assert_eq!(config, GridConfig::default());
        assert_eq!(config.queues.images, 1);
        assert_eq!(config.ssh_keys_dir(), PathBuf::from("./database/sshKeys"));
    }

    #[test]
    fn test_parse_partial_sections() {
        let toml_str = r#"
data_dir = "/var/lib/packgrid"

[queues]
containers = 8

[scheduler]
rematch_secs = 0
"#;
        let config: GridConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/packgrid"));
        assert_eq!(config.queues.containers, 8);
        assert_eq!(config.queues.other, 10);
        assert_eq!(config.scheduler.rematch_secs, 0);
        assert_eq!(config.scheduler.build_retry_secs, 60);
        assert_eq!(config.perf_logs_dir(), PathBuf::from("/var/lib/packgrid/perfLogs"));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let engine = EngineSettings::default();
        assert_eq!(engine.retry_delay(0), Duration::from_secs(10));
        assert_eq!(engine.retry_delay(3), Duration::from_secs(40));
        assert_eq!(engine.retry_delay(1000), Duration::from_secs(300));
    }

    #[test]
    fn test_round_trip_toml() {
        let config = GridConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("[timers]"));
        let back: GridConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
