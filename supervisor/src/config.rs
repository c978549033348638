use crate::engine::{CapacityConfig, CapacityMode};
use crate::error::{Result, SupervisorError};
use crate::traffic::QuotaPolicy;
use common::units;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_CLIENTS_LIMIT: u32 = 1000;
pub const UNLIMITED_BANDWIDTH: f64 = -1.0;

// Quota floors protect the relay's reputation with the broker.
pub const MIN_TRAFFIC_LIMIT_GB: f64 = 100.0;
pub const MIN_TRAFFIC_PERIOD_DAYS: u32 = 7;
pub const MIN_THRESHOLD_PERCENT: u8 = 60;
pub const MAX_THRESHOLD_PERCENT: u8 = 90;

pub const TRAFFIC_STATE_FILE: &str = "traffic_state.json";
pub const ENGINE_CONFIG_FILE: &str = "engine_config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// 0 = normal, 1+ = forward engine diagnostics to the log
    #[serde(default)]
    pub verbosity: u8,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log directory for file-based logging, stdout when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default = "default_log_file")]
    pub log_file: String,

    #[serde(default)]
    pub console_port: Option<u16>,

    /// Prometheus listen address, exporter disabled when unset
    #[serde(default)]
    pub metrics_addr: Option<String>,

    /// Stats JSON dump, relative paths resolve under `data_dir`
    #[serde(default)]
    pub stats_file: Option<String>,

    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub capacity: CapacityLimits,

    #[serde(default)]
    pub quota: Option<QuotaConfig>,

    #[serde(default)]
    pub restart: RestartConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_command")]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Network config merged underneath the generated capacity keys
    #[serde(default)]
    pub base_config_path: Option<String>,

    /// Extra engine config keys passed through verbatim
    #[serde(default)]
    pub set_overrides: serde_json::Map<String, serde_json::Value>,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityLimits {
    #[serde(default = "default_max_common_clients")]
    pub max_common_clients: u32,

    #[serde(default)]
    pub max_personal_clients: u32,

    /// Per-direction cap in Mbps, -1 for unlimited
    #[serde(default = "default_bandwidth_mbps")]
    pub bandwidth_mbps: f64,

    /// Stable proxy identity key handed to every engine instance
    #[serde(default)]
    pub proxy_key: String,

    #[serde(default)]
    pub compartment_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub traffic_limit_gb: f64,
    pub traffic_period_days: u32,

    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: u8,

    /// Total max clients while throttled
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Bandwidth in Mbps while throttled
    #[serde(default = "default_min_bandwidth_mbps")]
    pub min_bandwidth_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Uptime after which an engine counts as healthy and the backoff resets
    #[serde(default = "default_stable_secs")]
    pub stable_secs: u64,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "supervisor.log".to_string()
}

fn default_stats_log_interval_secs() -> u64 {
    60
}

fn default_engine_command() -> String {
    "mock-relay".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_max_common_clients() -> u32 {
    50
}

fn default_bandwidth_mbps() -> f64 {
    40.0
}

fn default_threshold_percent() -> u8 {
    80
}

fn default_min_connections() -> u32 {
    10
}

fn default_min_bandwidth_mbps() -> f64 {
    10.0
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_stable_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: Vec::new(),
            base_config_path: None,
            set_overrides: serde_json::Map::new(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self {
            max_common_clients: default_max_common_clients(),
            max_personal_clients: 0,
            bandwidth_mbps: default_bandwidth_mbps(),
            proxy_key: String::new(),
            compartment_id: None,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            stable_secs: default_stable_secs(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            verbosity: 0,
            log_level: default_log_level(),
            log_dir: None,
            log_file: default_log_file(),
            console_port: None,
            metrics_addr: None,
            stats_file: None,
            stats_log_interval_secs: default_stats_log_interval_secs(),
            engine: EngineConfig::default(),
            capacity: CapacityLimits::default(),
            quota: None,
            restart: RestartConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: SupervisorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let capacity = &self.capacity;
        let max_clients = self.max_clients();
        if max_clients < 1 || max_clients > MAX_CLIENTS_LIMIT {
            return Err(invalid(format!(
                "max clients (common + personal) must be between 1 and {}",
                MAX_CLIENTS_LIMIT
            )));
        }
        if capacity.bandwidth_mbps != UNLIMITED_BANDWIDTH && capacity.bandwidth_mbps < 1.0 {
            return Err(invalid(
                "bandwidth must be at least 1 Mbps (or -1 for unlimited)".to_string(),
            ));
        }
        if self.restart.poll_interval_secs == 0 {
            return Err(invalid("poll_interval_secs must be positive".to_string()));
        }

        let Some(quota) = &self.quota else {
            return Ok(());
        };

        if quota.traffic_limit_gb < MIN_TRAFFIC_LIMIT_GB {
            return Err(invalid(format!(
                "traffic_limit_gb must be at least {} GB",
                MIN_TRAFFIC_LIMIT_GB
            )));
        }
        if quota.traffic_period_days < MIN_TRAFFIC_PERIOD_DAYS {
            return Err(invalid(format!(
                "traffic_period_days must be at least {} days",
                MIN_TRAFFIC_PERIOD_DAYS
            )));
        }
        if !(MIN_THRESHOLD_PERCENT..=MAX_THRESHOLD_PERCENT).contains(&quota.threshold_percent) {
            return Err(invalid(format!(
                "threshold_percent must be between {}-{}%",
                MIN_THRESHOLD_PERCENT, MAX_THRESHOLD_PERCENT
            )));
        }
        if quota.min_connections == 0 {
            return Err(invalid("min_connections must be positive".to_string()));
        }
        if quota.min_connections >= max_clients {
            return Err(invalid(format!(
                "min_connections ({}) must be less than max clients ({})",
                quota.min_connections, max_clients
            )));
        }
        if quota.min_bandwidth_mbps <= 0.0 {
            return Err(invalid("min_bandwidth_mbps must be positive".to_string()));
        }
        let normal_bandwidth = self.normal_bandwidth_bytes_per_sec();
        if normal_bandwidth > 0 {
            let normal_mbps = units::bytes_per_sec_to_mbps(normal_bandwidth);
            if quota.min_bandwidth_mbps >= normal_mbps {
                return Err(invalid(format!(
                    "min_bandwidth_mbps ({:.1}) must be less than normal bandwidth ({:.1})",
                    quota.min_bandwidth_mbps, normal_mbps
                )));
            }
        }
        Ok(())
    }

    pub fn max_clients(&self) -> u32 {
        self.capacity
            .max_common_clients
            .saturating_add(self.capacity.max_personal_clients)
    }

    fn normal_bandwidth_bytes_per_sec(&self) -> u64 {
        if self.capacity.bandwidth_mbps == UNLIMITED_BANDWIDTH {
            0
        } else {
            units::mbps_to_bytes_per_sec(self.capacity.bandwidth_mbps)
        }
    }

    pub fn normal_capacity(&self) -> CapacityConfig {
        CapacityConfig {
            mode: CapacityMode::Normal,
            max_common_clients: self.capacity.max_common_clients,
            max_personal_clients: self.capacity.max_personal_clients,
            bandwidth_bytes_per_second: self.normal_bandwidth_bytes_per_sec(),
            proxy_key: self.capacity.proxy_key.clone(),
            compartment_id: self.capacity.compartment_id.clone(),
            emit_activity: true,
        }
    }

    /// Floor capacity applied once the quota threshold is crossed. The
    /// throttled client budget is split between common and personal clients
    /// in the same proportion as the normal limits.
    pub fn throttled_capacity(&self) -> CapacityConfig {
        let normal = self.normal_capacity();
        let Some(quota) = &self.quota else {
            return normal;
        };

        let total = u64::from(self.max_clients().max(1));
        let min = u64::from(quota.min_connections);
        let personal = (min * u64::from(self.capacity.max_personal_clients) / total) as u32;
        let common = quota.min_connections - personal;

        CapacityConfig {
            mode: CapacityMode::Throttled,
            max_common_clients: common,
            max_personal_clients: personal,
            bandwidth_bytes_per_second: units::mbps_to_bytes_per_sec(quota.min_bandwidth_mbps),
            ..normal
        }
    }

    pub fn quota_policy(&self) -> Option<QuotaPolicy> {
        self.quota.as_ref().map(|quota| {
            QuotaPolicy::new(
                units::gib_to_bytes(quota.traffic_limit_gb),
                units::days(quota.traffic_period_days),
                quota.threshold_percent,
            )
        })
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn traffic_state_path(&self) -> PathBuf {
        self.data_dir().join(TRAFFIC_STATE_FILE)
    }

    pub fn engine_config_path(&self) -> PathBuf {
        self.data_dir().join(ENGINE_CONFIG_FILE)
    }

    pub fn stats_file_path(&self) -> Option<PathBuf> {
        self.stats_file.as_ref().map(|file| {
            let path = PathBuf::from(file);
            if path.is_absolute() {
                path
            } else {
                self.data_dir().join(path)
            }
        })
    }

    pub fn stats_log_interval(&self) -> Duration {
        Duration::from_secs(self.stats_log_interval_secs)
    }
}

fn invalid(message: String) -> SupervisorError {
    SupervisorError::Configuration(message)
}
