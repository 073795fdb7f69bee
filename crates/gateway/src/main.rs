//! Open IoT Gateway
//!
//! Headless service receiving datagrams from IoT devices.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gateway::config::{default_config_path, Config};
use gateway::devices::load_devices;
use gateway::handlers::HandlerRegistry;
use gateway::runtime::{build_transports, Runtime, RuntimeEvent};

/// Open IoT Gateway - onboards devices and processes their messages.
#[derive(Parser, Debug)]
#[command(name = "openiot-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to the devices file, overriding the configuration
    #[arg(long, global = true, value_name = "FILE")]
    pub devices: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for the gateway.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the gateway until SIGINT or SIGTERM
    Run,

    /// Validate the configuration and print the effective values
    CheckConfig,

    /// List persisted devices
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    if let Some(devices) = &cli.devices {
        config.server.devices_file = devices.clone();
    }

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.server.log_level.to_lowercase())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::CheckConfig => check_config(&config),
        Commands::Devices => list_devices(&config),
    }
}

/// Runs the gateway until a shutdown signal arrives.
async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("Open IoT gateway starting...");

    let runtime = Runtime::new(config)?;
    let mut events = runtime.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RuntimeEvent::StateChanged(state) => {
                    tracing::info!("Runtime state: {:?}", state);
                }
                RuntimeEvent::Saved { count } => {
                    tracing::debug!("Saved {} devices", count);
                }
                RuntimeEvent::Processed { .. } | RuntimeEvent::Rejected { .. } => {}
            }
        }
    });

    runtime.start().await?;

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    runtime.stop().await?;
    Ok(())
}

fn check_config(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    print!("{}", config.to_toml()?);
    println!("# configuration is valid");
    Ok(())
}

fn list_devices(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    let handlers = HandlerRegistry::with_builtin();
    let transports = build_transports(config)?;
    let devices = load_devices(&config.server.devices_file, &handlers, &transports)
        .context("Failed to load devices")?;

    if devices.is_empty() {
        println!("No devices in {}", config.server.devices_file.display());
        return Ok(());
    }

    println!(
        "{:<20} {:<24} {:<8} {:<26} {:>8} {:>8}",
        "ID", "NAME", "MODE", "MESSAGE TYPE", "SENT", "RECEIVED"
    );
    for device in devices {
        println!(
            "{:<20} {:<24} {:<8} {:<26} {:>8} {:>8}",
            device.id.to_string(),
            truncate_str(&device.name, 24),
            device.encryption.as_config_str(),
            truncate_str(&device.message_type, 26),
            device.sequence_send,
            device.sequence_receive
        );
    }
    Ok(())
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!("Failed to register signal handlers ({}), falling back to Ctrl-C", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        // Verify the CLI structure is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["openiot-gateway"]).unwrap();
        assert_eq!(cli.command, None);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from(["openiot-gateway", "run"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Run));
    }

    #[test]
    fn test_check_config_command() {
        let cli = Cli::try_parse_from(["openiot-gateway", "check-config", "-c", "/etc/openiot.toml"])
            .unwrap();
        assert_eq!(cli.command, Some(Commands::CheckConfig));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/openiot.toml")));
    }

    #[test]
    fn test_devices_command_with_file() {
        let cli = Cli::try_parse_from([
            "openiot-gateway",
            "--devices",
            "/tmp/devices.toml",
            "devices",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.command, Some(Commands::Devices));
        assert_eq!(cli.devices, Some(PathBuf::from("/tmp/devices.toml")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_unknown_command() {
        assert!(Cli::try_parse_from(["openiot-gateway", "pair"]).is_err());
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("a very long device name", 10), "a very ...");
    }
}
