/*!
 * INKBT Bluetooth Remote Daemon
 * Page turners and remotes for e-readers, without a desktop Bluetooth stack
 * Onyx Digital Intelligence Development LLC
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::Path;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

mod config;
mod hooks;
mod ipc;
mod service;
mod store;

use config::{load_catalog, DaemonConfig};
use inkbt_core::input::NodeDetector;
use inkbt_core::protocol::{self, Request, Response};
use inkbt_core::{BluetoothController, BusAdapter, InputDeviceHandler, SysfsDetector, SystemCommandRunner};
use ipc::IpcServer;
use store::JsonSettings;

#[derive(Parser)]
#[command(name = "inkbtd")]
#[command(about = "INKBT Bluetooth Remote Daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/inkbt/inkbtd.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run,
    /// Ask a running daemon for its status
    Status,
    /// Print the bus profile and Bluetooth input nodes this host would use
    Detect,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("inkbt_daemon={0},inkbt_core={0}", log_level))
        .init();

    // Load configuration
    let config = DaemonConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config).await,
        Commands::Status => check_status(&config).await,
        Commands::Detect => detect(&config),
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("INKBT daemon starting...");

    let profile = config.bluetooth.profile.resolve(&SystemCommandRunner);
    info!("Using {:?} Bluetooth bus profile", profile);
    let bus = BusAdapter::new(Box::new(SystemCommandRunner), profile, &config.bluetooth.adapter_path);

    let (events, _) = broadcast::channel(64);
    let settings = JsonSettings::open(&config.settings_path);
    info!("Settings at {}", settings.path().display());
    let host = hooks::build_host(
        Box::new(settings),
        config.hooks.clone(),
        config.bluetooth.enabled,
        events.clone(),
    );

    let detector = SysfsDetector::new(&config.bluetooth.input_dir, &config.bluetooth.sys_class_input);
    let input = InputDeviceHandler::new(Box::new(detector), &config.bluetooth.default_input_path);
    let catalog = load_catalog(&config.actions_path)?;

    let mut controller = BluetoothController::new(
        host,
        bus,
        input,
        &catalog,
        config.controller_settings(),
        Instant::now(),
    );
    controller.start();

    let listener = bind_socket(&config.socket_path)?;
    let (commands, requests) = mpsc::channel(32);
    let ipc_server = IpcServer::new(listener, commands, events);
    tokio::spawn(async move {
        if let Err(e) = ipc_server.run().await {
            tracing::error!("IPC server stopped: {}", e);
        }
    });

    info!("INKBT daemon ready on socket: {}", config.socket_path);
    service::run(controller, requests, &config.actions_path).await?;

    if let Err(e) = fs::remove_file(&config.socket_path) {
        warn!("Could not remove socket {}: {}", config.socket_path, e);
    }
    Ok(())
}

fn bind_socket(path: &str) -> Result<UnixListener> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create socket directory {}", parent.display()))?;
    }
    if path.exists() {
        // Stale socket from a previous run
        fs::remove_file(path)?;
    }
    UnixListener::bind(path).with_context(|| format!("cannot bind {}", path.display()))
}

async fn check_status(config: &DaemonConfig) -> Result<()> {
    let stream = UnixStream::connect(&config.socket_path)
        .await
        .with_context(|| format!("daemon not reachable on {}", config.socket_path))?;
    let (read, mut write) = stream.into_split();
    write
        .write_all(protocol::encode(&Request::Status)?.as_bytes())
        .await?;

    let mut lines = BufReader::new(read).lines();
    match lines.next_line().await? {
        Some(line) => match protocol::decode::<Response>(&line)? {
            Response::Status { status } => println!("{}", serde_json::to_string_pretty(&status)?),
            other => println!("{:?}", other),
        },
        None => println!("Daemon closed the connection"),
    }
    Ok(())
}

fn detect(config: &DaemonConfig) -> Result<()> {
    let profile = config.bluetooth.profile.resolve(&SystemCommandRunner);
    println!("bus profile: {:?} ({})", profile, profile.service());

    let detector = SysfsDetector::new(&config.bluetooth.input_dir, &config.bluetooth.sys_class_input);
    let nodes = detector.bluetooth_nodes();
    if nodes.is_empty() {
        println!("no Bluetooth input nodes");
    }
    for node in nodes {
        let name = detector.node_name(&node).unwrap_or_default();
        println!("{}  {}", node.display(), name);
    }
    Ok(())
}
