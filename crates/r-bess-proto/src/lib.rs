//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device message model and protocol codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Wire codec for the device JSON-over-UDP protocol.
//!
//! Requests are built and validated by [`Codec`] before anything touches a
//! socket. Inbound datagrams are classified by [`parse_response`] into
//! responses, echoed requests, or noise.
#![warn(missing_docs)]

pub mod codec;
pub mod identity;
pub mod method;
pub mod mode;
pub mod telemetry;
pub mod types;
pub mod validation;

/// Raised when a command fails a protocol constraint before transmission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    /// Name of the offending field (`method`, `params`, `power`, `end_time`, ...).
    pub field: String,
    /// Human readable explanation.
    pub message: String,
}

impl ValidationError {
    /// Construct a validation error for `field`.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Raised when a JSON payload is not a recognisable protocol envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// A response-shaped object without a usable `id`.
    #[error("response is missing a usable id")]
    MissingId,
    /// An envelope whose shape or field types are wrong.
    #[error("malformed response: {reason}")]
    Malformed {
        /// Request id carried by the payload, when it could be read.
        id: Option<u32>,
        /// What was wrong with the payload.
        reason: String,
    },
}

impl ParseError {
    /// Request id the malformed payload claimed, if any.
    pub fn id(&self) -> Option<u32> {
        match self {
            ParseError::MissingId => None,
            ParseError::Malformed { id, .. } => *id,
        }
    }

    pub(crate) fn malformed(id: Option<u32>, reason: impl Into<String>) -> Self {
        ParseError::Malformed {
            id,
            reason: reason.into(),
        }
    }
}

pub use codec::{parse_response, Codec, DISCOVERY_REQUEST_ID, MAX_MESSAGE_SIZE};
pub use identity::{normalize_mac, select_stable_id, StableId};
pub use method::Method;
pub use mode::{ClockTime, ModeConfig, PassiveTarget, ScheduleSlot, Weekdays};
pub use telemetry::{
    BatStatus, BatteryFlow, DeviceInfo, EmStatus, EsMode, EsStatus, OperatingMode, PassiveReport,
    PvChannel, PvStatus, SetModeAck, WifiStatus,
};
pub use types::{DeviceError, Inbound, Outcome, Request, Response};
pub use validation::{StrictWarning, MAX_DEVICE_ID, MAX_PASSIVE_DURATION, MAX_POWER, MAX_TIME_SLOTS, MAX_WEEK_SET};
