//! PCOM Gateway
//!
//! Bridges JSON logical messages to a PCOM device reached through a TCP
//! serial bridge.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pcom_link::{spawn_connection, LinkError, LinkHandle};
use pcom_protocol::LogicalMessage;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::GatewayConfig;

#[derive(Parser)]
#[command(name = "pcom-gateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "PCOM serial gateway", long_about = None)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Serial bridge address (HOST:PORT), overrides the config file
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bridge JSON lines on stdin/stdout to the device
    Run {
        /// Run discovery before reading stdin
        #[arg(short, long)]
        discover: bool,
    },

    /// Run discovery and print what the device exposes
    Discover {
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(address) = cli.address {
        config.address = address;
    }
    install_metrics(&config)?;

    match cli.command {
        Commands::Run { discover } => cmd_run(&config, discover || config.discover_on_connect).await,
        Commands::Discover { json } => cmd_discover(&config, json).await,
    }
}

#[cfg(feature = "prometheus")]
fn install_metrics(config: &GatewayConfig) -> Result<()> {
    if let Some(address) = &config.metrics_address {
        let addr = address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid metrics address {}", address))?;
        pcom_metrics::install_prometheus(addr)?;
        pcom_metrics::describe_metrics();
        info!("Serving metrics on {}", addr);
    }
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
fn install_metrics(config: &GatewayConfig) -> Result<()> {
    if config.metrics_address.is_some() {
        warn!("metrics_address is set but the prometheus feature is disabled");
    }
    Ok(())
}

async fn connect(config: &GatewayConfig) -> Result<(LinkHandle, JoinHandle<pcom_link::LinkResult<()>>)> {
    let stream = TcpStream::connect(&config.address)
        .await
        .with_context(|| format!("Failed to connect to {}", config.address))?;
    stream.set_nodelay(true)?;
    info!("Connected to {}", config.address);
    Ok(spawn_connection(stream, config.connection()))
}

async fn cmd_run(config: &GatewayConfig, discover: bool) -> Result<()> {
    let (link, task) = connect(config).await?;

    if discover {
        match tokio::time::timeout(config.request_timeout() * 10, link.discover()).await {
            Ok(Ok(subsystems)) => info!("Discovered subsystems {:?}", subsystems),
            Ok(Err(e)) => warn!("Discovery failed: {}", e),
            Err(_) => warn!("Discovery timed out"),
        }
    }

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let mut inbound = link.subscribe(|_| true).await?;
    let forward_tx = out_tx.clone();
    tokio::spawn(async move {
        while let Some(msg) = inbound.recv().await {
            if forward_tx.send(msg).is_err() {
                break;
            }
        }
    });
    let writer = tokio::spawn(write_messages(out_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let msg: LogicalMessage = match serde_json::from_str(&line) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Ignoring malformed message: {}", e);
                        continue;
                    }
                };
                match link.publish(msg.clone()).await {
                    Ok(()) => {}
                    Err(LinkError::Closed) => break,
                    // delivery failures already come back as error responses
                    Err(LinkError::DeliveryFailed { .. }) => {}
                    Err(e) => {
                        let _ = out_tx.send(LogicalMessage::error_response(&msg, e.to_string()));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    link.close().await;
    drop(out_tx);
    task.await??;
    writer.await??;
    Ok(())
}

async fn write_messages(mut messages: mpsc::UnboundedReceiver<LogicalMessage>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(msg) = messages.recv().await {
        let mut line = serde_json::to_vec(&msg)?;
        line.push(b'\n');
        stdout.write_all(&line).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn cmd_discover(config: &GatewayConfig, json: bool) -> Result<()> {
    let (link, task) = connect(config).await?;

    let subsystems = tokio::time::timeout(config.request_timeout() * 10, link.discover())
        .await
        .context("Discovery timed out")??;
    let descriptors = link.descriptors().await?;
    link.close().await;
    task.await??;

    if json {
        let report = serde_json::json!({
            "subsystems": subsystems,
            "descriptors": descriptors,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Subsystems: {:?}", subsystems);
    for entry in &descriptors {
        println!(
            "  0x{:04X} {:<16} {:<8} {:>5}  {}",
            entry.destination,
            entry.endpoint.to_string(),
            entry.kind.to_string(),
            entry.descriptor.id,
            entry.descriptor.to_spec()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "pcom-gateway",
            "run",
            "--discover",
            "--address",
            "10.1.1.1:4001",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.address.as_deref(), Some("10.1.1.1:4001"));
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Run { discover: true }));
    }

    #[test]
    fn test_parse_discover() {
        let cli = Cli::try_parse_from(["pcom-gateway", "--config", "gw.yaml", "discover", "--json"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("gw.yaml")));
        assert!(matches!(cli.command, Commands::Discover { json: true }));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["pcom-gateway"]).is_err());
    }
}
