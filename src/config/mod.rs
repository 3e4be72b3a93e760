//! Configuration management
//!
//! Loads the optional TOML file driving the `udpflow` binary. Every
//! section has full defaults so an empty file (or none at all) is valid;
//! command-line flags override file values.

use crate::capture::{PcapConfig, ReceiverConfig, ReplayMode};
use crate::error::{Error, Result};
use crate::telemetry::LogConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log: LogSection,
    pub listen: ListenSection,
    pub replay: ReplaySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    pub level: String,
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenSection {
    /// UDP ports to subscribe to.
    pub ports: Vec<u16>,
    pub max_fds: usize,
    pub batch_size: usize,
    pub buffer_size: usize,
}

impl Default for ListenSection {
    fn default() -> Self {
        let defaults = ReceiverConfig::default();
        Self {
            ports: Vec::new(),
            max_fds: defaults.max_fds,
            batch_size: defaults.batch_size,
            buffer_size: defaults.buffer_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplaySection {
    /// Capture file to replay.
    pub file: Option<PathBuf>,
    /// Destination ports to deliver; empty means every subscribed port
    /// must come from the command line.
    pub ports: Vec<u16>,
    /// timed, flood, or step
    pub mode: String,
    pub speed: f64,
    pub flood_batch_limit: usize,
}

impl Default for ReplaySection {
    fn default() -> Self {
        let defaults = PcapConfig::default();
        Self {
            file: None,
            ports: Vec::new(),
            mode: "timed".to_string(),
            speed: defaults.speed_multiplier,
            flood_batch_limit: defaults.flood_batch_limit,
        }
    }
}

/// Load configuration from a TOML file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config =
        toml::from_str(&content).map_err(|e| Error::Format(e.to_string()))?;
    Ok(config)
}

impl Config {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log.level.clone(),
            format: self.log.format.clone(),
        }
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            max_fds: self.listen.max_fds,
            batch_size: self.listen.batch_size,
            buffer_size: self.listen.buffer_size,
        }
    }

    pub fn pcap_config(&self) -> Result<PcapConfig> {
        Ok(PcapConfig {
            base: self.receiver_config(),
            mode: parse_mode(&self.replay.mode)?,
            speed_multiplier: self.replay.speed,
            flood_batch_limit: self.replay.flood_batch_limit,
        })
    }
}

pub fn parse_mode(mode: &str) -> Result<ReplayMode> {
    match mode.to_lowercase().as_str() {
        "timed" => Ok(ReplayMode::Timed),
        "flood" => Ok(ReplayMode::Flood),
        "step" => Ok(ReplayMode::Step),
        _ => Err(Error::InvalidArg("replay mode must be timed, flood, or step")),
    }
}
