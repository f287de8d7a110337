// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XRCE Agent CLI
//!
//! # Usage
//!
//! ```bash
//! # UDP on the standard port, replies default to 127.0.0.1:2020
//! xrce-agent udp
//!
//! # Explicit ports and peer
//! xrce-agent udp --port 8888 --out-port 8889 --peer-host 192.168.1.50
//!
//! # Serial link
//! xrce-agent serial --device /dev/ttyUSB0
//!
//! # Using configuration file
//! xrce-agent --config agent.toml udp
//!
//! # Write an example configuration file
//! xrce-agent gen-config --output agent.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use xrce_agent::{Agent, AgentConfig, LoopbackBridge, NullBridge, ProxyBridge, XrceError};

/// DDS-XRCE Agent
#[derive(Parser, Debug)]
#[command(name = "xrce-agent")]
#[command(about = "DDS-XRCE agent - bridges resource-constrained clients to DDS")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// DDS bridge backing the proxy clients
    #[arg(long, value_enum, default_value = "loopback", global = true)]
    bridge: BridgeKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve clients over UDP
    Udp {
        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Port of the default reply destination
        #[arg(long)]
        out_port: Option<u16>,

        /// Host of the default reply destination
        #[arg(long)]
        peer_host: Option<String>,
    },

    /// Serve one client over a serial device
    Serial {
        /// Device path (e.g. /dev/ttyUSB0)
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "xrce-agent.toml")]
        output: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BridgeKind {
    /// Accept everything, never produce data
    Null,
    /// In-process delivery between clients sharing a topic name
    Loopback,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Commands::GenConfig { output } = &args.command {
        return cmd_gen_config(output);
    }

    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    init_logging(&config.log_level);

    let bridge: Arc<dyn ProxyBridge> = match args.bridge {
        BridgeKind::Null => Arc::new(NullBridge),
        BridgeKind::Loopback => Arc::new(LoopbackBridge::new()),
    };

    match args.command {
        Commands::Udp {
            port,
            out_port,
            peer_host,
        } => {
            if let Some(port) = port {
                config.udp_port = port;
            }
            if let Some(out_port) = out_port {
                config.udp_out_port = out_port;
            }
            if let Some(host) = peer_host {
                config.udp_peer_host = host;
            }
            let (in_port, out_port) = (config.udp_port, config.udp_out_port);
            let agent = Arc::new(Agent::new(config, bridge)?);
            agent.init_udp(in_port, out_port)?;
            serve(agent)
        }
        Commands::Serial { device } => {
            let device = device
                .or_else(|| config.serial_device.clone())
                .ok_or_else(|| XrceError::Config("no serial device (use --device)".into()))?;
            let agent = Arc::new(Agent::new(config, bridge)?);
            agent.init_serial(&device)?;
            serve(agent)
        }
        Commands::GenConfig { .. } => Ok(()),
    }
}

fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .try_init();
}

fn serve(agent: Arc<Agent>) -> Result<(), Box<dyn std::error::Error>> {
    let stop_handle = Arc::clone(&agent);
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, shutting down...");
        stop_handle.stop();
    })?;

    println!("DDS-XRCE Agent v{}", env!("CARGO_PKG_VERSION"));
    println!("Press Ctrl+C to stop...");

    agent.run()?;

    let stats = agent.stats();
    println!(
        "Replies sent: {} ({} bytes), send failures: {}, oversize drops: {}",
        stats.sent, stats.bytes_sent, stats.send_failures, stats.oversize_drops
    );
    Ok(())
}

fn cmd_gen_config(output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig {
        serial_device: Some("/dev/ttyUSB0".into()),
        ..AgentConfig::default()
    };
    std::fs::write(output, config.to_toml()?)?;
    println!("Configuration written to {}", output.display());
    Ok(())
}
