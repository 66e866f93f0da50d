extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::MAX_PAYLOAD_SIZE;

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CodecConfig {
    pub max_payload_size: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProbeConfig {
    pub default_interval_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            default_interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DialConfig {
    /// overall budget of one fan-out race
    pub deadline_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for DialConfig {
    fn default() -> Self {
        DialConfig {
            deadline_ms: 10_000,
            connect_timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub idle_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 7878,
            idle_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WireConfig {
    pub codec: CodecConfig,
    pub probe: ProbeConfig,
    pub dial: DialConfig,
    pub network: NetworkConfig,
}

impl WireConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<WireConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let wire_config: WireConfig = config.try_deserialize()?;
        wire_config.validate()?;
        Ok(wire_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let max = self.codec.max_payload_size;
        if max == 0 || max > MAX_PAYLOAD_SIZE {
            return Err(AppError::InvalidValue(format!(
                "codec.max_payload_size must be in 1..={}, got {}",
                MAX_PAYLOAD_SIZE, max
            )));
        }
        if self.probe.default_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "probe.default_interval_ms must be positive".into(),
            ));
        }
        if self.dial.deadline_ms == 0 {
            return Err(AppError::InvalidValue(
                "dial.deadline_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe.default_interval_ms)
    }

    pub fn dial_deadline(&self) -> Duration {
        Duration::from_millis(self.dial.deadline_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.dial.connect_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.network.idle_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
