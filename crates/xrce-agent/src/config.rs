// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::XrceError;
use crate::protocol::{MESSAGE_HEADER_SIZE, SUBMESSAGE_HEADER_SIZE};

/// Smallest usable transport buffer: one header plus one empty submessage.
const MIN_BUFFER_SIZE: usize = MESSAGE_HEADER_SIZE + SUBMESSAGE_HEADER_SIZE;

/// Largest buffer a single UDP datagram can fill.
const MAX_BUFFER_SIZE: usize = 65_507;

/// Configuration for the XRCE agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// UDP listen port (default: 2019, the XRCE standard port).
    pub udp_port: u16,

    /// Port replies go to when no client address is known.
    pub udp_out_port: u16,

    /// Host paired with `udp_out_port` to form the default reply locator.
    pub udp_peer_host: String,

    /// Optional serial device path (e.g. "/dev/ttyUSB0").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_device: Option<String>,

    /// Maximum concurrent clients.
    pub max_clients: usize,

    /// Size of the fixed receive and send buffers in bytes.
    pub buffer_size: usize,

    /// How long a transport receive waits before the run loop re-checks
    /// its running flag.
    pub poll_interval_ms: u64,

    /// Log level used by the binary when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            udp_port: 2019,
            udp_out_port: 2020,
            udp_peer_host: "127.0.0.1".to_string(),
            serial_device: None,
            max_clients: 128,
            buffer_size: 1024,
            poll_interval_ms: 100,
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, XrceError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| XrceError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text. Missing keys take
    /// their default value.
    pub fn from_toml(content: &str) -> Result<Self, XrceError> {
        let config: Self =
            toml::from_str(content).map_err(|e| XrceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML (used by `xrce-agent gen-config`).
    pub fn to_toml(&self) -> Result<String, XrceError> {
        toml::to_string_pretty(self).map_err(|e| XrceError::Config(e.to_string()))
    }

    /// Validate configuration. Returns Ok(()) if valid.
    pub fn validate(&self) -> Result<(), XrceError> {
        if self.max_clients == 0 {
            return Err(XrceError::Config("max_clients must be > 0".into()));
        }
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(XrceError::Config(format!(
                "buffer_size must be within {}..={}",
                MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(XrceError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.udp_peer_host.is_empty() {
            return Err(XrceError::Config("udp_peer_host must not be empty".into()));
        }
        if matches!(&self.serial_device, Some(dev) if dev.is_empty()) {
            return Err(XrceError::Config("serial_device must not be empty".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolve `udp_peer_host:out_port`.
    pub fn peer_addr(&self, out_port: u16) -> Result<SocketAddr, XrceError> {
        (self.udp_peer_host.as_str(), out_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                XrceError::Config(format!("cannot resolve peer host {}", self.udp_peer_host))
            })
    }
}
