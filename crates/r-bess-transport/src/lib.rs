//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "UDP device transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Request/response exchange with devices over UDP.
//!
//! One socket serves every device. Replies are correlated to waiting callers
//! purely by message id; anything that matches no waiter is logged and dropped.
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use r_bess_proto::{DeviceError, Method, ParseError, Response, StableId, ValidationError};
use serde_json::{Map, Value};

pub mod broadcast;
pub mod pacing;
mod pending;
pub mod retry;
pub mod stats;
pub mod udp;

pub use broadcast::broadcast_targets;
pub use pacing::DestinationPacer;
pub use retry::RetryPolicy;
pub use stats::{AttemptOutcome, CommandStats};
pub use udp::UdpTransport;

/// Errors surfaced by the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Command rejected locally; nothing was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// No matching reply after every attempt.
    #[error("{method} to {target} timed out after {attempts} attempt(s)")]
    Timeout {
        method: String,
        target: SocketAddr,
        attempts: u32,
    },
    /// A reply carried our id but was not a usable envelope.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The device understood and rejected the request.
    #[error("device rejected {method}: {error}")]
    Device { method: String, error: DeviceError },
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request id {0} is already pending")]
    DuplicateId(u32),
    #[error("transport is shut down")]
    Closed,
}

impl TransportError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout { .. } | TransportError::Io(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One distinct device answer to a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub from: SocketAddr,
    pub stable_id: StableId,
    pub response: Response,
}

/// Per-call overrides; unset fields fall back to the transport configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            retries: None,
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// The seam between device-facing components and the network.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Send a directed request, with pacing and retry, and return its `result` mapping.
    async fn call(
        &self,
        target: SocketAddr,
        method: Method,
        params: Map<String, Value>,
        options: RequestOptions,
    ) -> Result<Map<String, Value>>;

    /// Broadcast a request and collect distinct replies until `window` elapses.
    async fn broadcast(
        &self,
        method: Method,
        params: Map<String, Value>,
        window: Duration,
    ) -> Result<Vec<Reply>>;
}
