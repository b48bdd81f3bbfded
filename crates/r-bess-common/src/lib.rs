//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration and logging primitives."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the R-BESS workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the transport, discovery, and polling crates and the binaries.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, CodecConfig, ControlConfig, DeviceConfig, DiscoveryConfig, LoadedAppConfig,
    LoggingConfig, MetricsConfig, PollingConfig, ScannerConfig, TransportConfig,
};
pub use logging::{init_console, init_tracing, LogFormat};

/// Default UDP port spoken by the devices.
pub const DEFAULT_DEVICE_PORT: u16 = 30000;
