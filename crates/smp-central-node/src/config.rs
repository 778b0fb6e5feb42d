// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Central node configuration.

use serde::{Deserialize, Serialize};
use smp_protocol::{CENTRAL_NODE_PORT, MAX_PACKET_LEN};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Range;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Central node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// UDP control port (default: 15001)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maintenance tick length in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Ticks without a keep-alive before a publisher or subscriber is evicted
    #[serde(default = "default_timeout_limit")]
    pub timeout_limit: u32,

    /// Retransmissions of an unacknowledged notification beyond the first send
    #[serde(default = "default_max_retransmissions")]
    pub max_retransmissions: u32,

    /// First broadcast port handed to publishers
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// One past the last broadcast port
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Receive buffer size (bytes)
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    CENTRAL_NODE_PORT
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_timeout_limit() -> u32 {
    10
}

fn default_max_retransmissions() -> u32 {
    2
}

fn default_port_range_start() -> u16 {
    15002
}

fn default_port_range_end() -> u16 {
    15555
}

fn default_recv_buffer_size() -> usize {
    1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            tick_interval_ms: default_tick_interval(),
            timeout_limit: default_timeout_limit(),
            max_retransmissions: default_max_retransmissions(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            recv_buffer_size: default_recv_buffer_size(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Control endpoint address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Get tick interval as Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Broadcast ports available to publishers.
    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("port cannot be 0".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "tick_interval_ms cannot be 0".into(),
            ));
        }
        if self.timeout_limit == 0 {
            return Err(ConfigError::InvalidValue("timeout_limit cannot be 0".into()));
        }
        if self.port_range_start >= self.port_range_end {
            return Err(ConfigError::InvalidValue(format!(
                "empty broadcast port range {}..{}",
                self.port_range_start, self.port_range_end
            )));
        }
        if self.port_range().contains(&self.port) {
            return Err(ConfigError::InvalidValue(format!(
                "broadcast port range {}..{} overlaps control port {}",
                self.port_range_start, self.port_range_end, self.port
            )));
        }
        // A buffer of exactly MAX_PACKET_LEN would truncate oversized datagrams into range.
        if self.recv_buffer_size <= MAX_PACKET_LEN {
            return Err(ConfigError::InvalidValue(format!(
                "recv_buffer_size must be larger than {} bytes",
                MAX_PACKET_LEN
            )));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}
