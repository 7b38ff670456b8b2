//! Simulation configuration (TOML)
//!
//! ```toml
//! clock_hz = 108000000
//! pace = true
//! timeout_ms = 10000
//! idle_ms = 50
//!
//! [port]
//! baud_rate = 115200
//! cancel_sentinel = 24
//! irq_priority = 0
//! stream_type = "serial"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serial_stream::PortConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Peripheral clock feeding the simulated baud generator
    pub clock_hz: u32,

    /// Feed input at line rate instead of all at once
    pub pace: bool,

    /// Whole-session limit, also the give-up point for blocked writes
    pub timeout_ms: u64,

    /// Quiet period after the input ends before the session is closed
    pub idle_ms: u64,

    pub port: PortConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            clock_hz: 108_000_000,
            pace: true,
            timeout_ms: 10_000,
            idle_ms: 50,
            port: PortConfig::default(),
        }
    }
}

impl SimConfig {
    /// Load from `path`, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Self::parse(&text).with_context(|| format!("Invalid config {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    /// Time one 8N1 character occupies on the wire
    pub fn byte_time(&self) -> Duration {
        Duration::from_nanos(10_000_000_000 / self.port.baud_rate.max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_stream::StreamType;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(SimConfig::parse("").unwrap(), SimConfig::default());
    }

    #[test]
    fn test_partial_port_table() {
        let config = SimConfig::parse(
            r#"
            clock_hz = 54000000

            [port]
            baud_rate = 250000
            stream_type = "telnet"
            "#,
        )
        .unwrap();

        assert_eq!(config.clock_hz, 54_000_000);
        assert_eq!(config.port.baud_rate, 250_000);
        assert_eq!(config.port.stream_type, StreamType::Telnet);
        assert_eq!(config.port.cancel_sentinel, 0x18);
        assert!(config.pace);
    }

    #[test]
    fn test_unknown_stream_type_rejected() {
        assert!(SimConfig::parse("[port]\nstream_type = \"carrier_pigeon\"").is_err());
    }

    #[test]
    fn test_byte_time() {
        let config = SimConfig {
            port: PortConfig {
                baud_rate: 10_000,
                ..PortConfig::default()
            },
            ..SimConfig::default()
        };
        assert_eq!(config.byte_time(), Duration::from_millis(1));
    }
}
