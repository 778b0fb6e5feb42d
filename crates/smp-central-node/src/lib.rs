// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SMP Central Node
//!
//! Broker for the SMP sensor mesh. Publishers register here and receive a
//! multicast broadcast port; subscribers look publishers up by key and join
//! that port. The central node only carries control traffic:
//!
//! - **Registry**: publishers, their subscribers and the broadcast port pool
//! - **Dispatcher**: one inbound command in, at most one response out
//! - **Maintenance**: retransmission of unacknowledged notifications and
//!   eviction of peers that stopped sending keep-alives
//!
//! # Quick Start
//!
//! ```bash
//! # Default control port (15001), 1 s maintenance tick
//! smp-central-node
//!
//! # Faster liveness detection
//! smp-central-node --tick-ms 250 --timeout-limit 8
//!
//! # Using config file
//! smp-central-node --config central-node.json
//! ```
//!
//! # Configuration File
//!
//! ```json
//! {
//!   "port": 15001,
//!   "tick_interval_ms": 1000,
//!   "timeout_limit": 10,
//!   "port_range_start": 15002,
//!   "port_range_end": 15555
//! }
//! ```

pub mod config;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use server::{
    CentralNode, CentralNodeServer, MaintenanceReport, NodeSettings, Outbound, ServerError,
    StateError,
};
