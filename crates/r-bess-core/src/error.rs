//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device polling and verified control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use r_bess_proto::ValidationError;
use r_bess_transport::TransportError;

/// Why a control command did not take effect.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Rejected before anything was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The device answered but reported `set_result: false`.
    #[error("device refused {method}")]
    Refused { method: String },
    /// The write was acknowledged but the device never reported the requested state.
    #[error("verification failed after {writes} write(s) and {attempts} read-back(s): expected {expected}, observed {observed}")]
    Verification {
        expected: String,
        observed: String,
        /// Write attempts made, each followed by its own read-backs.
        writes: u32,
        /// Read-backs after the final write.
        attempts: u32,
    },
    /// A slot-by-slot clear stopped partway.
    #[error("schedule clear stopped at slot {failed_slot} after clearing {cleared:?}: {source}")]
    PartialClear {
        cleared: Vec<u8>,
        failed_slot: u8,
        source: Box<ControlError>,
    },
}

impl ControlError {
    /// Short label for metrics and CLI exit reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::Validation(_) => "validation",
            ControlError::Transport(err) if err.is_timeout() => "timeout",
            ControlError::Transport(TransportError::Device { .. }) => "device_error",
            ControlError::Transport(_) => "transport",
            ControlError::Refused { .. } => "refused",
            ControlError::Verification { .. } => "verification",
            ControlError::PartialClear { .. } => "partial_clear",
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
