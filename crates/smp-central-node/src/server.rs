// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Central node broker loop.
//!
//! One task owns the [`CentralNode`] state. It waits on the control socket,
//! the next maintenance deadline and the shutdown signal, so datagram
//! handling and maintenance never run concurrently.

use crate::config::ServerConfig;
use smp_protocol::Command;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub mod dispatcher;
pub mod maintenance;
pub mod registry;
pub mod transaction;

pub use dispatcher::{CentralNode, NodeSettings, Outbound};
pub use maintenance::MaintenanceReport;
pub use registry::{Publisher, Registry, StateError, Subscriber};
pub use transaction::{Transaction, TransactionTable};

/// Central node server - registry and control plane for the sensor mesh.
#[derive(Clone)]
pub struct CentralNodeServer {
    config: Arc<ServerConfig>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl CentralNodeServer {
    /// Create a new server. The configuration is validated here.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured control port and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.socket_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))?;

        self.run_on(socket).await
    }

    /// Serve on an already bound socket until shutdown.
    pub async fn run_on(&self, socket: UdpSocket) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let result = self.serve(socket).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn serve(&self, socket: UdpSocket) -> Result<(), ServerError> {
        info!("Central node listening on {}", socket.local_addr()?);

        let mut node = CentralNode::new(NodeSettings::from(self.config.as_ref()));
        let tick = self.config.tick_interval();
        let mut next_tick = Instant::now() + tick;
        let mut buf = vec![0u8; self.config.recv_buffer_size];

        // Registered before the loop so a shutdown() racing startup is not lost.
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = tokio::time::sleep_until(next_tick) => {
                    let report = node.run_maintenance();
                    if !report.evicted_publishers.is_empty() {
                        info!("Evicted publishers: {:?}", report.evicted_publishers);
                    }
                    flush(&socket, &mut node).await;
                    next_tick += tick;
                    // Skip ticks missed while blocked rather than bursting them.
                    let now = Instant::now();
                    if next_tick < now {
                        next_tick = now + tick;
                    }
                }
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            if let Some(response) = node.handle(&buf[..len], from) {
                                send(&socket, &response, from).await;
                            }
                            flush(&socket, &mut node).await;
                        }
                        Err(e) => {
                            // ICMP port-unreachable surfaces here on some platforms.
                            warn!("Receive error: {}", e);
                        }
                    }
                }
            }
        }

        debug!(
            "Central node stopped with {} publishers and {} outstanding transactions",
            node.registry().publisher_count(),
            node.transactions().len()
        );
        Ok(())
    }

    /// Signal the server to shutdown.
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Check if server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Send every queued notification and retransmission.
async fn flush(socket: &UdpSocket, node: &mut CentralNode) {
    for out in node.drain_outbound() {
        send(socket, &out.command, out.destination).await;
    }
}

/// Fire-and-forget send. Failures are logged and otherwise ignored.
async fn send(socket: &UdpSocket, command: &Command, to: SocketAddr) {
    match socket.send_to(&command.encode(), to).await {
        Ok(_) => debug!("Sent {} to {}", command, to),
        Err(e) => error!("Failed to send {} to {}: {}", command, to, e),
    }
}

/// Server error types.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
