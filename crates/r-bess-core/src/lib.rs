//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device polling and verified control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Tiered polling and verified control of R-BESS devices.

pub mod control;
pub mod coordinator;
pub mod error;
mod pause;
pub mod snapshot;
pub mod tier;

pub use control::ControlExecutor;
pub use coordinator::{CoordinatorHandle, CycleOutcome, DeviceTarget, PollingCoordinator};
pub use error::ControlError;
pub use pause::PauseGuard;
pub use snapshot::StateSnapshot;
pub use tier::Tier;
