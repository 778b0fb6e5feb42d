// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SMP Central Node
//!
//! Standalone broker for the SMP sensor mesh.
//!
//! # Usage
//!
//! ```bash
//! # Start on the default control port (15001)
//! smp-central-node
//!
//! # Custom port and config
//! smp-central-node --port 16001 --config central-node.json
//!
//! # Verbose, with a short tick for local testing
//! smp-central-node --tick-ms 200 --log-level debug
//! ```

use clap::Parser;
use smp_central_node::{CentralNodeServer, ServerConfig};
use smp_protocol::CENTRAL_NODE_PORT;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// SMP Central Node - publisher/subscriber registry for the sensor mesh
#[derive(Parser, Debug)]
#[command(name = "smp-central-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP control port
    #[arg(short, long, default_value_t = CENTRAL_NODE_PORT)]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maintenance tick in milliseconds
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// Ticks without a keep-alive before a peer is evicted
    #[arg(long, default_value = "10")]
    timeout_limit: u32,

    /// Log level (trace, debug, info, warn, error) or filter directives
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging. Accepts a level or full filter directives.
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Load or create config
    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        ServerConfig::from_file(&config_path)?
    } else {
        ServerConfig {
            bind_address: args.bind.parse()?,
            port: args.port,
            tick_interval_ms: args.tick_ms,
            timeout_limit: args.timeout_limit,
            ..Default::default()
        }
    };

    info!("+----------------------------------------------------+");
    info!(
        "|       SMP Central Node v{}                   |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:    {:39} |", config.socket_addr());
    info!(
        "|  Tick:    {:39} |",
        format!("{}ms", config.tick_interval_ms)
    );
    info!(
        "|  Timeout: {:39} |",
        format!("{} ticks", config.timeout_limit)
    );
    info!(
        "|  Ports:   {:39} |",
        format!("{}..{}", config.port_range_start, config.port_range_end)
    );
    info!("+----------------------------------------------------+");

    let server = CentralNodeServer::new(config)?;

    // Handle shutdown signals
    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping server...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Central node stopped");
    Ok(())
}
