//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device discovery and address tracking."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Finding devices on the local network and noticing when they move.
use std::net::SocketAddr;

use r_bess_transport::TransportError;

pub mod discovery;
pub mod scanner;

pub use discovery::{DeviceDescriptor, Discovery};
pub use scanner::{
    KnownDevice, ScanControl, ScanRequest, ScanRequester, ScanTrigger, Scanner, ScannerEvent,
    ScannerHandle,
};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery exchange failed: {0}")]
    Transport(#[from] TransportError),
    #[error("{0} answered but did not identify itself as a device")]
    NotADevice(SocketAddr),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
