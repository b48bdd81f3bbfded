//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the R-BESS daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use indexmap::IndexMap;
use r_bess_common::{init_tracing, AppConfig, LoadedAppConfig};
use r_bess_core::{CoordinatorHandle, DeviceTarget, PollingCoordinator};
use r_bess_discovery::{Discovery, KnownDevice, Scanner, ScannerEvent, ScannerHandle};
use r_bess_metrics::{
    new_registry, spawn_http_server, DaemonMetrics, PollerMetrics, ScannerMetrics,
    TransportMetrics,
};
use r_bess_proto::Codec;
use r_bess_transport::{DeviceLink, UdpTransport};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const VERSION: &str = concat!("R-BESS ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    version = VERSION,
    about = "R-BESS daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Discover, poll and track the configured devices")]
    Run,
    #[command(about = "Validate the configuration and print the effective settings")]
    CheckConfig,
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("{} ({})", VERSION, build_profile());
        return Ok(());
    }

    let load_started = Instant::now();
    let loaded = match &cli.config {
        Some(path) => LoadedAppConfig {
            config: AppConfig::from_path(path)?,
            source: path.clone(),
        },
        None => AppConfig::load_with_source(&[
            PathBuf::from("configs/r-bess.toml"),
            PathBuf::from("configs/example.toml"),
        ])?,
    };
    let config = loaded.config;
    let load_duration = load_started.elapsed();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!("# loaded from {}", loaded.source.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Run => {
            init_tracing("r-bessd", &config.logging)?;
            info!(config_path = %loaded.source.display(), devices = config.devices.len(), "configuration loaded");

            let registry = new_registry();
            let daemon_metrics = DaemonMetrics::new(registry.clone())?;
            daemon_metrics.observe_config_load(load_duration.as_secs_f64());
            daemon_metrics.inc_start();
            daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), build_profile());
            daemon_metrics.set_device_count(config.devices.len());

            run_daemon(config, daemon_metrics).await
        }
    }
}

async fn run_daemon(config: AppConfig, daemon_metrics: DaemonMetrics) -> Result<()> {
    let registry = daemon_metrics.registry();
    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry.clone(), config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let transport = UdpTransport::bind(
        config.transport.clone(),
        Codec::new(config.codec),
        Some(TransportMetrics::new(&registry)?),
    )
    .await?;
    let link: Arc<dyn DeviceLink> = Arc::new(transport.clone());
    let discovery = Arc::new(Discovery::new(link.clone(), config.discovery.clone()));

    let known = config
        .devices
        .iter()
        .map(|(name, device)| KnownDevice::from_config(name.clone(), device))
        .collect();
    let scanner = Scanner::new(discovery.clone(), config.scanner.clone())
        .with_known_devices(known)
        .with_metrics(ScannerMetrics::new(&registry)?)
        .spawn();

    let poller_metrics = PollerMetrics::new(&registry)?;
    let mut coordinators: IndexMap<String, CoordinatorHandle> = IndexMap::new();
    for (name, device) in &config.devices {
        let handle = PollingCoordinator::new(
            name.clone(),
            link.clone(),
            config.polling.clone(),
            DeviceTarget::from_config(device),
        )
        .with_scanner(scanner.requester())
        .with_metrics(poller_metrics.clone())
        .spawn();
        coordinators.insert(name.clone(), handle);
    }
    if coordinators.is_empty() {
        warn!("no devices configured; running discovery and scanning only");
        match discovery.discover(config.discovery.timeout).await {
            Ok(found) => info!(count = found.len(), "initial discovery finished"),
            Err(err) => warn!(error = %err, "initial discovery failed"),
        }
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
    let events = spawn_event_router(&scanner, coordinators.clone(), shutdown_rx);

    info!(devices = coordinators.len(), "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    let _ = shutdown_tx.send(());
    if let Err(err) = events.await {
        warn!(error = %err, "event router ended abnormally");
    }
    futures::future::join_all(coordinators.values().map(|handle| handle.shutdown())).await;
    scanner.shutdown().await;
    transport.shutdown().await;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

/// Apply scanner findings to the running coordinators.
///
/// Address changes retarget polling in memory only; persisting them is left to
/// whoever owns the configuration file.
fn spawn_event_router(
    scanner: &ScannerHandle,
    coordinators: IndexMap<String, CoordinatorHandle>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let mut events = scanner.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events.recv() => match event {
                    Ok(ScannerEvent::AddressChanged { name, old, new, descriptor, .. }) => {
                        match coordinators.get(&name) {
                            Some(handle) => {
                                let port = handle.target().addr.port();
                                handle.set_target(SocketAddr::new(new, port));
                                info!(device = %name, old = %old, new = %new, "device moved; update the configuration to persist");
                            }
                            None => debug!(device = %name, id = %descriptor.stable_id, "address change for a device without a poller"),
                        }
                    }
                    Ok(ScannerEvent::UnconfiguredDevice { descriptor }) => {
                        info!(
                            id = %descriptor.stable_id,
                            ip = %descriptor.ip,
                            device_type = descriptor.device_type.as_deref().unwrap_or("unknown"),
                            "unconfigured device on the network"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "scanner events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
