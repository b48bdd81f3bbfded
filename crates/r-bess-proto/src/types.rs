//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device message model and protocol codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::method::Method;
use crate::ValidationError;

/// A validated, encoded request. Only [`crate::Codec`] can construct one.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub(crate) id: u32,
    pub(crate) method: Method,
    pub(crate) params: Map<String, Value>,
    pub(crate) encoded: Vec<u8>,
}

/// Borrowed wire shape used for encoding.
#[derive(Serialize)]
pub(crate) struct WireRequest<'a> {
    pub id: u32,
    pub method: &'a str,
    pub params: &'a Map<String, Value>,
}

impl Request {
    /// Correlation id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Method being invoked.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Parameter mapping.
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// UTF-8 JSON datagram payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    /// The same, already validated command under a new id (used for retries).
    pub fn reissue(&self, id: u32) -> Result<Request, ValidationError> {
        let encoded = serde_json::to_vec(&WireRequest {
            id,
            method: self.method.as_str(),
            params: &self.params,
        })
        .map_err(|err| ValidationError::new("message", err.to_string()))?;
        Ok(Request {
            id,
            method: self.method,
            params: self.params.clone(),
            encoded,
        })
    }
}

/// Error envelope returned by a device that understood but rejected a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceError {
    /// JSON-RPC style error code, when supplied.
    #[serde(default)]
    pub code: Option<i64>,
    /// Device supplied message.
    #[serde(default)]
    pub message: String,
    /// Optional extra payload.
    #[serde(default)]
    pub data: Option<Value>,
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// Either a result mapping or a device error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Successful result mapping.
    Result(Map<String, Value>),
    /// Device rejected the request.
    Error(DeviceError),
}

/// A response envelope correlated by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request this answers.
    pub id: u32,
    /// Device self-identification (`VenusE-aabbcc...`), when present.
    pub src: Option<String>,
    /// Result or error.
    pub outcome: Outcome,
}

impl Response {
    /// Result mapping, if the device accepted the request.
    pub fn result(&self) -> Option<&Map<String, Value>> {
        match &self.outcome {
            Outcome::Result(map) => Some(map),
            Outcome::Error(_) => None,
        }
    }

    /// Device error, if the request was rejected.
    pub fn error(&self) -> Option<&DeviceError> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(err) => Some(err),
        }
    }
}

/// Classification of one inbound datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A response carrying `result` or `error`.
    Response(Response),
    /// A request-shaped payload (our own broadcast, or a device echoing it back).
    Echo {
        /// Id carried by the echo, if readable.
        id: Option<u32>,
        /// Method name as sent.
        method: String,
        /// Parameters as sent.
        params: Map<String, Value>,
    },
    /// Not JSON, or JSON that is not an object. Never an error.
    Noise {
        /// Short description for logging.
        reason: String,
    },
}
