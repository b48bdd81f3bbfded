//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control CLI for operators interacting with R-BESS devices."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use r_bess_common::{init_console, DEFAULT_DEVICE_PORT};
use r_bess_core::{ControlExecutor, PollingCoordinator, Tier};
use r_bess_discovery::Discovery;
use serde_json::json;

mod mode;
mod session;

use mode::ModeCommand;
use session::{load_config, Session, TargetArgs};

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "R-BESS device control utility",
    long_about = None
)]
struct Cli {
    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,

    #[arg(long, global = true, value_name = "FILE", env = "R_BESS_CONFIG", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Local UDP port to bind instead of the configured one")]
    bind_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Broadcast for devices on the local network.
    Discover {
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    /// Ask one address to identify itself.
    Query {
        host: IpAddr,
        #[arg(long, default_value_t = DEFAULT_DEVICE_PORT)]
        port: u16,
        #[arg(long, value_name = "SECS", default_value_t = 5)]
        timeout: u64,
    },
    /// Poll every tier once and print the merged state.
    Status(TargetArgs),
    /// Change the operating mode and confirm it took effect.
    SetMode {
        #[command(flatten)]
        target: TargetArgs,
        #[command(subcommand)]
        mode: ModeCommand,
    },
    /// Disable all schedule slots.
    ClearSchedules(TargetArgs),
    /// Charge at a fixed power.
    Charge(PowerArgs),
    /// Discharge at a fixed power.
    Discharge(PowerArgs),
    /// Stop forced charging or discharging.
    Stop(TargetArgs),
}

#[derive(Debug, Args)]
struct PowerArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Power in watts.
    #[arg(long)]
    power: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_console();
    let cli = Cli::parse();
    if cli.version {
        println!("R-BESS {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let Some(command) = cli.command else {
        eprintln!("no command given; see --help");
        return Ok(());
    };

    let config = load_config(cli.config.as_ref())?;
    let session = Session::open(config, cli.bind_port).await?;
    let outcome = run(&session, command).await;
    session.close().await;
    outcome
}

async fn run(session: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::Discover { timeout } => {
            let discovery = Discovery::new(session.link(), session.config.discovery.clone());
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or(session.config.discovery.timeout);
            let devices = discovery.discover(timeout).await?;
            print_json(&devices)
        }
        Commands::Query {
            host,
            port,
            timeout,
        } => {
            let discovery = Discovery::new(session.link(), session.config.discovery.clone());
            let device = discovery
                .query_one(SocketAddr::new(host, port), Duration::from_secs(timeout))
                .await?;
            print_json(&device)
        }
        Commands::Status(args) => {
            let (name, target) = session.resolve(&args)?;
            let poller = PollingCoordinator::new(
                name,
                session.link(),
                session.config.polling.clone(),
                target,
            )
            .manual();
            let mut cycles = serde_json::Map::new();
            for tier in Tier::ALL {
                let outcome = poller.fetch_tier(tier).await;
                cycles.insert(tier.to_string(), json!(format!("{outcome:?}")));
            }
            let snapshot = poller.snapshot();
            print_json(&json!({
                "device": snapshot.device,
                "target": snapshot.target,
                "updated_at": snapshot.updated_at,
                "consecutive_failures": snapshot.consecutive_failures,
                "stale": snapshot.stale,
                "last_error": snapshot.last_error,
                "cycles": cycles,
                "fields": snapshot.fields(),
            }))
        }
        Commands::SetMode { target, mode } => {
            let mode = mode.to_mode()?;
            executor(session, &target)?.set_mode(&mode).await?;
            println!("{} mode confirmed", mode.wire_name());
            Ok(())
        }
        Commands::ClearSchedules(args) => {
            let cleared = executor(session, &args)?.clear_schedules().await?;
            println!("cleared {} schedule slot(s)", cleared.len());
            Ok(())
        }
        Commands::Charge(args) => {
            executor(session, &args.target)?.charge(args.power).await?;
            println!("charging at {} W confirmed", args.power);
            Ok(())
        }
        Commands::Discharge(args) => {
            executor(session, &args.target)?.discharge(args.power).await?;
            println!("discharging at {} W confirmed", args.power);
            Ok(())
        }
        Commands::Stop(args) => {
            executor(session, &args)?.stop().await?;
            println!("battery idle confirmed");
            Ok(())
        }
    }
}

fn executor(session: &Session, args: &TargetArgs) -> Result<ControlExecutor> {
    let (_, target) = session.resolve(args)?;
    Ok(ControlExecutor::new(
        session.link(),
        session.codec(),
        session.config.control.clone(),
        target,
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
