use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::hal::ChipSettings;

use super::downlink::DownlinkPolicy;

const PLATFORM_DEFINITION_MAX: usize = 24;
const PLATFORM_EMAIL_MAX: usize = 40;
const PLATFORM_DESCRIPTION_MAX: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no enabled server in configuration")]
    NoServer,
}

/// One network-side collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConf {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_receive_timeout_ms() -> u32 {
    200
}

impl ServerConf {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
            enabled: true,
            receive_timeout_ms: default_receive_timeout_ms(),
        }
    }
}

impl std::fmt::Display for ServerConf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/**
@struct PlatformConfig
@brief Whole gateway configuration: radio, location, metadata, servers and tunables
*/
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(flatten)]
    pub chip: ChipSettings,

    #[serde(default)]
    pub latitude: f32,
    #[serde(default, alias = "longtitude")]
    pub longitude: f32,
    #[serde(default)]
    pub altitude_meters: i32,

    #[serde(default)]
    pub platform_definition: String,
    #[serde(default)]
    pub platform_email: String,
    #[serde(default)]
    pub platform_description: String,

    #[serde(default)]
    pub servers: Vec<ServerConf>,

    #[serde(default = "default_com_path")]
    pub com_path: String,
    #[serde(default = "default_stat_interval_s")]
    pub stat_interval_s: u64,
    #[serde(default = "default_pull_interval_ms")]
    pub pull_interval_ms: u64,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_downlink_too_late_ms")]
    pub downlink_too_late_ms: u64,
    #[serde(default = "default_downlink_send_ahead_ms")]
    pub downlink_send_ahead_ms: u64,
    #[serde(default = "default_heartbeat_tolerance_s")]
    pub heartbeat_tolerance_s: u64,
}

fn default_com_path() -> String {
    String::from("/dev/ttyACM0")
}

fn default_stat_interval_s() -> u64 {
    80
}

fn default_pull_interval_ms() -> u64 {
    5000
}

fn default_max_send_attempts() -> u32 {
    5
}

fn default_downlink_too_late_ms() -> u64 {
    2000
}

fn default_downlink_send_ahead_ms() -> u64 {
    300
}

fn default_heartbeat_tolerance_s() -> u64 {
    60
}

fn truncate(value: &mut String, max_chars: usize) {
    if let Some((idx, _)) = value.char_indices().nth(max_chars) {
        value.truncate(idx);
    }
}

impl PlatformConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: PlatformConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the fallbacks and limits of the file format.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !(5..=8).contains(&self.chip.coding_rate) {
            warn!("WARNING: coding rate 4/{} out of range, using 4/5", self.chip.coding_rate);
            self.chip.coding_rate = 5;
        }

        truncate(&mut self.platform_definition, PLATFORM_DEFINITION_MAX);
        truncate(&mut self.platform_email, PLATFORM_EMAIL_MAX);
        truncate(&mut self.platform_description, PLATFORM_DESCRIPTION_MAX);

        self.servers.retain(|s| s.enabled);
        if self.servers.is_empty() {
            return Err(ConfigError::NoServer);
        }
        Ok(())
    }

    pub fn shared_servers(&self) -> Vec<Arc<ServerConf>> {
        self.servers.iter().cloned().map(Arc::new).collect()
    }

    pub fn downlink_policy(&self) -> DownlinkPolicy {
        DownlinkPolicy {
            too_late_us: self.downlink_too_late_ms * 1000,
            send_ahead_us: self.downlink_send_ahead_ms * 1000,
        }
    }

    pub fn log_summary(&self, gateway_id: &str) {
        info!("PlatformInfo:");
        info!("  ID (EUI-64): {}", gateway_id);
        info!("  Radio: {}", self.chip);
        info!(
            "  Location: lat={} long={} alt={} m",
            self.latitude, self.longitude, self.altitude_meters
        );
        info!(
            "  Name/Definition: {}, E-mail: {}, Description: {}",
            self.platform_definition, self.platform_email, self.platform_description
        );
        for server in &self.servers {
            info!("  Server: {} (rx timeout {} ms)", server, server.receive_timeout_ms);
        }
    }
}
