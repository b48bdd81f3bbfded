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
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Args;
use r_bess_common::{AppConfig, DEFAULT_DEVICE_PORT};
use r_bess_core::DeviceTarget;
use r_bess_proto::Codec;
use r_bess_transport::{DeviceLink, UdpTransport};
use tracing::{debug, warn};

/// Selects one device, by configured name or by address.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Name of a device in the configuration file.
    #[arg(long, short = 'd', value_name = "NAME", conflicts_with = "host")]
    pub device: Option<String>,

    /// Address of a device that is not configured.
    #[arg(long, value_name = "IP")]
    pub host: Option<IpAddr>,

    /// UDP port used with --host.
    #[arg(long, default_value_t = DEFAULT_DEVICE_PORT)]
    pub port: u16,

    /// Device index sent with scoped methods when using --host.
    #[arg(long, default_value_t = 0)]
    pub index: u8,
}

/// Load the configuration the way the daemon does, falling back to defaults
/// when nothing was asked for explicitly and nothing is found.
pub fn load_config(explicit: Option<&PathBuf>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        return AppConfig::from_path(path);
    }
    match AppConfig::load_with_source(&[
        PathBuf::from("configs/r-bess.toml"),
        PathBuf::from("configs/example.toml"),
    ]) {
        Ok(loaded) => {
            debug!(config_path = %loaded.source.display(), "configuration loaded");
            Ok(loaded.config)
        }
        Err(err) => {
            warn!(error = %err, "using built-in defaults");
            Ok(AppConfig::default())
        }
    }
}

/// A bound transport plus the configuration it was built from.
pub struct Session {
    pub config: AppConfig,
    pub transport: UdpTransport,
}

impl Session {
    pub async fn open(mut config: AppConfig, bind_port: Option<u16>) -> Result<Self> {
        if let Some(port) = bind_port {
            config.transport.bind_port = port;
        }
        let transport = UdpTransport::bind(config.transport.clone(), Codec::new(config.codec), None).await?;
        Ok(Self { config, transport })
    }

    pub fn link(&self) -> Arc<dyn DeviceLink> {
        Arc::new(self.transport.clone())
    }

    pub fn codec(&self) -> Arc<Codec> {
        Arc::new(Codec::new(self.config.codec))
    }

    /// Resolve `args` to a display name and a target.
    pub fn resolve(&self, args: &TargetArgs) -> Result<(String, DeviceTarget)> {
        if let Some(host) = args.host {
            let addr = SocketAddr::new(host, args.port);
            return Ok((
                addr.to_string(),
                DeviceTarget {
                    addr,
                    device_index: args.index,
                },
            ));
        }
        let (name, device) = match &args.device {
            Some(name) => self
                .config
                .devices
                .get_key_value(name)
                .ok_or_else(|| anyhow!("device '{}' is not configured", name))?,
            None if self.config.devices.len() == 1 => self
                .config
                .devices
                .first()
                .ok_or_else(|| anyhow!("no devices configured"))?,
            None => {
                return Err(anyhow!(
                    "select a device with --device NAME or --host IP ({} configured)",
                    self.config.devices.len()
                ))
            }
        };
        Ok((name.clone(), DeviceTarget::from_config(device)))
    }

    pub async fn close(self) {
        self.transport.shutdown().await;
    }
}
