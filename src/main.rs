//! ims-b2bua main application

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use ims_b2bua::{config::GatewayConfig, core::B2buaServer, services::GatewayEvent, utils::setup_logging, Result};

#[derive(Parser)]
#[command(name = "ims-b2bua")]
#[command(about = "IMS-style SIP B2BUA with RTPProxy media control")]
#[command(version = ims_b2bua::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the B2BUA server
    Start,
    /// Validate configuration and exit
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_configuration(&cli).await?;
    setup_logging(&config.logging)?;

    info!("Starting {} v{}", ims_b2bua::NAME, ims_b2bua::VERSION);
    info!("Description: {}", ims_b2bua::DESCRIPTION);

    match &cli.command {
        Some(Commands::Start) | None => run_server(config).await,
        Some(Commands::ValidateConfig) => validate_configuration(&config),
        Some(Commands::GenerateConfig { output }) => generate_default_config(output.clone()),
    }
}

async fn load_configuration(cli: &Cli) -> Result<GatewayConfig> {
    let config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path.display());
        GatewayConfig::load_from_file(config_path)?
    } else {
        info!("No configuration file specified, trying environment variables");
        match GatewayConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => {
                info!("No environment configuration found, using defaults");
                GatewayConfig::default_config()
            }
        }
    };

    config.validate()?;
    info!("Configuration loaded and validated successfully");
    Ok(config)
}

async fn run_server(config: GatewayConfig) -> Result<()> {
    let auto_detected_ip = if config.general.advertised_host.eq_ignore_ascii_case("AUTO") {
        detect_public_ip().await
    } else {
        None
    };

    let server = B2buaServer::new(config, auto_detected_ip).await?;
    let mut events = server.subscribe_events();

    server.start().await?;

    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => handle_server_event(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event log dropped events (slow consumer)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    server.stop().await?;
    event_task.abort();

    info!("ims-b2bua shutdown complete");
    Ok(())
}

fn handle_server_event(event: GatewayEvent) {
    match event {
        GatewayEvent::Started => info!("server started"),
        GatewayEvent::Stopped => info!("server stopped"),
        GatewayEvent::RegistrationUpdated { aor, expires } => {
            info!(aor, expires, "registration updated")
        }
        GatewayEvent::RegistrationRemoved { aor } => info!(aor, "registration removed"),
        GatewayEvent::CallStarted { call_id, from_aor, to_aor } => {
            info!(call_id, from_aor, to_aor, "call started")
        }
        GatewayEvent::CallAnswered { call_id } => info!(call_id, "call answered"),
        GatewayEvent::CallEnded(record) => {
            info!(call_id = %record.call_id, disposition = ?record.disposition, "call ended")
        }
        GatewayEvent::MediaBackendDown { reason } => error!(reason, "media backend down"),
    }
}

/// Best-effort public IP detection for `advertised_host = "AUTO"`. Binding a
/// UDP socket toward a well-known address and reading the local address back
/// is the usual trick for finding the outbound-facing interface; it does not
/// discover a NAT-mapped public address, which is a known limitation of
/// "AUTO" without a STUN client (ICE is out of scope).
async fn detect_public_ip() -> Option<IpAddr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

fn validate_configuration(config: &GatewayConfig) -> Result<()> {
    info!("Validating configuration...");
    config.validate()?;

    println!("Configuration is valid");
    println!("  Node ID: {}", config.general.node_id);
    println!("  Domain: {}", config.general.domain);
    println!("  SIP bind: {}:{}", config.sip.bind_address, config.sip.bind_port);
    println!("  Advertised: {}:{}", config.general.advertised_host, config.general.advertised_port);
    println!("  Registered users: {}", config.registrar.users.len());
    Ok(())
}

fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = GatewayConfig::default_config();
    let toml_content = toml::to_string_pretty(&config)
        .map_err(|e| ims_b2bua::Error::internal(format!("failed to serialize config: {e}")))?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{toml_content}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_generates_and_validates() {
        let config = GatewayConfig::default_config();
        assert!(validate_configuration(&config).is_ok());
    }
}
