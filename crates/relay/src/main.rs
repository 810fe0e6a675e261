//! usb-mitm
//!
//! USB man-in-the-middle relay: impersonates a target USB device toward an
//! upstream host while relaying traffic to the real device, applying the
//! configured filters and injectors in flight.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use relay::config::RelayConfig;
use relay::manager::Manager;
use relay::plugin::PluginRegistry;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "usb-mitm")]
#[command(author, version, about = "USB man-in-the-middle relay")]
#[command(long_about = "
Relays USB traffic between a real device and an upstream host, with
configurable packet filters and injectors on the datapath.

EXAMPLES:
    # Run with default config
    usb-mitm

    # Run with custom config
    usb-mitm --config /path/to/relay.toml

    # Run with debug logging
    usb-mitm --log-level debug

CONFIGURATION:
    The relay looks for its configuration at ~/.config/usb-mitm/relay.toml
    unless --config is given. Use --save-config to write the defaults there.
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = RelayConfig::default();
        let path = RelayConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if args.config.is_some() {
        RelayConfig::load(args.config.clone()).context("failed to load configuration")?
    } else {
        RelayConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .unwrap_or_else(|| config.relay.log_level.clone());
    setup_logging(&log_level)?;

    // Proxy backends register their constructors here before the bundle is
    // built; the built-in filter and injector kinds are preloaded.
    let registry = PluginRegistry::with_builtins();
    let plugins = registry.build(&config).context("failed to load plugins")?;

    let manager = Manager::new();
    manager.load_plugins(plugins)?;

    let setup_manager = manager.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(err) = setup_manager.start_control_relaying() {
            error!("control relaying failed: {err}");
        }
    });

    info!("usb-mitm running; press Ctrl-C to stop");
    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    let stop_manager = manager.clone();
    tokio::task::spawn_blocking(move || {
        stop_manager.stop_relaying();
        stop_manager.cleanup();
    })
    .await
    .context("shutdown task panicked")?;

    Ok(())
}
