//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device message model and protocol codec."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use r_bess_common::CodecConfig;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::method::Method;
use crate::mode::ModeConfig;
use crate::types::{DeviceError, Inbound, Outcome, Request, Response, WireRequest};
use crate::validation::{self, StrictWarning};
use crate::{ParseError, ValidationError};

/// Id reserved for discovery broadcasts; never handed out by [`Codec::next_id`].
pub const DISCOVERY_REQUEST_ID: u32 = 0;
/// Largest datagram payload the codec will produce.
pub const MAX_MESSAGE_SIZE: usize = 65_535;

/// Builds validated requests. One codec per client; its strictness is not shared.
#[derive(Debug)]
pub struct Codec {
    config: CodecConfig,
    next_id: AtomicU32,
}

impl Codec {
    /// Construct a codec with the given options.
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            next_id: AtomicU32::new(1),
        }
    }

    /// Options this codec was built with.
    pub fn config(&self) -> CodecConfig {
        self.config
    }

    /// Next request id in `1..=u32::MAX`, wrapping and skipping the discovery id.
    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != DISCOVERY_REQUEST_ID {
                return id;
            }
        }
    }

    /// Validate a method and its parameters without building a request.
    pub fn check(
        &self,
        method: &str,
        params: &Map<String, Value>,
    ) -> Result<(Method, Vec<StrictWarning>), ValidationError> {
        let method = Method::from_str(method).map_err(|_| {
            ValidationError::new("method", format!("'{method}' is not an allowed method"))
        })?;
        let warnings = validation::validate(method, params, self.config.strict)?;
        Ok((method, warnings))
    }

    /// Validate and encode a request with a fresh id.
    pub fn build_command(
        &self,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Request, ValidationError> {
        let (method, warnings) = self.check(method, &params)?;
        self.finish(self.next_id(), method, params, warnings)
    }

    /// Validate and encode a request with a caller-chosen id.
    pub fn build_with_id(
        &self,
        id: u32,
        method: &str,
        params: Map<String, Value>,
    ) -> Result<Request, ValidationError> {
        let (method, warnings) = self.check(method, &params)?;
        self.finish(id, method, params, warnings)
    }

    /// The reserved discovery broadcast: `Marstek.GetDevice` with id 0.
    pub fn discovery_request(&self) -> Result<Request, ValidationError> {
        self.build_with_id(
            DISCOVERY_REQUEST_ID,
            Method::GetDevice.as_str(),
            params(json!({"ble_mac": "0"})),
        )
    }

    /// A read query addressed to `device_index`.
    pub fn build_query(&self, method: Method, device_index: u8) -> Result<Request, ValidationError> {
        let params = match method {
            Method::GetDevice => params(json!({"ble_mac": "0"})),
            _ => params(json!({"id": device_index})),
        };
        self.build_command(method.as_str(), params)
    }

    /// `ES.SetMode` requests for a mode; Manual yields one request per slot.
    pub fn build_mode(
        &self,
        mode: &ModeConfig,
        device_index: u8,
    ) -> Result<Vec<Request>, ValidationError> {
        let configs = mode.to_wire_configs();
        if configs.is_empty() {
            return Err(ValidationError::new(
                "manual_cfg",
                "Manual mode needs at least one schedule slot",
            ));
        }
        configs
            .into_iter()
            .map(|config| {
                self.build_command(
                    Method::EsSetMode.as_str(),
                    params(json!({"id": device_index, "config": config})),
                )
            })
            .collect()
    }

    fn finish(
        &self,
        id: u32,
        method: Method,
        params: Map<String, Value>,
        warnings: Vec<StrictWarning>,
    ) -> Result<Request, ValidationError> {
        for warning in &warnings {
            warn!(
                target: "r_bess::codec",
                method = %method,
                field = warning.field,
                "{}",
                warning.message
            );
        }
        let encoded = serde_json::to_vec(&WireRequest {
            id,
            method: method.as_str(),
            params: &params,
        })
        .map_err(|err| ValidationError::new("message", err.to_string()))?;
        if encoded.len() > MAX_MESSAGE_SIZE {
            return Err(ValidationError::new(
                "message",
                format!("{} bytes exceeds {MAX_MESSAGE_SIZE}", encoded.len()),
            ));
        }
        Ok(Request {
            id,
            method,
            params,
            encoded,
        })
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn read_id(object: &Map<String, Value>) -> Option<u32> {
    object
        .get("id")
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
}

/// Classify one inbound datagram.
///
/// Non-JSON payloads and non-object JSON are [`Inbound::Noise`], never errors.
/// A response-shaped object with a bad `id` or a non-object `result` is a
/// [`ParseError`].
pub fn parse_response(raw: &[u8]) -> Result<Inbound, ParseError> {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(err) => {
            return Ok(Inbound::Noise {
                reason: format!("not JSON: {err}"),
            })
        }
    };
    let Value::Object(mut object) = value else {
        return Ok(Inbound::Noise {
            reason: "JSON payload is not an object".into(),
        });
    };

    let id = read_id(&object);
    let src = object
        .get("src")
        .and_then(Value::as_str)
        .map(str::to_owned);

    if let Some(result) = object.remove("result") {
        let id = id.ok_or(ParseError::MissingId)?;
        return match result {
            Value::Object(map) => Ok(Inbound::Response(Response {
                id,
                src,
                outcome: Outcome::Result(map),
            })),
            other => Err(ParseError::malformed(
                Some(id),
                format!("result is {}, expected an object", kind(&other)),
            )),
        };
    }

    if let Some(error) = object.remove("error") {
        let id = id.ok_or(ParseError::MissingId)?;
        let error = match error {
            Value::Object(map) => DeviceError {
                code: map.get("code").and_then(Value::as_i64),
                message: map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                data: map.get("data").cloned(),
            },
            Value::String(message) => DeviceError {
                code: None,
                message,
                data: None,
            },
            other => {
                return Err(ParseError::malformed(
                    Some(id),
                    format!("error is {}, expected an object", kind(&other)),
                ))
            }
        };
        return Ok(Inbound::Response(Response {
            id,
            src,
            outcome: Outcome::Error(error),
        }));
    }

    if let Some(method) = object.get("method") {
        let method = method
            .as_str()
            .ok_or_else(|| ParseError::malformed(id, "method is not a string"))?
            .to_owned();
        let params = match object.remove("params") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        return Ok(Inbound::Echo { id, method, params });
    }

    Err(ParseError::malformed(
        id,
        "object has neither result, error nor method",
    ))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
