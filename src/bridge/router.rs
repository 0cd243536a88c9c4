use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};

use super::error::{BridgeError, ErrorKind};
use super::registry::BoundObject;
use super::BridgeCore;

/// One decoded inbound transport message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Init,
    Get {
        id: String,
        property: String,
    },
    Set {
        id: String,
        property: String,
        new_value: JsonValue,
    },
    Invoke {
        id: String,
        function: String,
        arguments: Vec<JsonValue>,
    },
}

#[derive(Deserialize)]
struct GetData {
    id: String,
    property: String,
}

#[derive(Deserialize)]
struct SetData {
    id: String,
    property: String,
    #[serde(rename = "newValue", default)]
    new_value: JsonValue,
}

#[derive(Deserialize)]
struct InvokeData {
    id: String,
    function: String,
    #[serde(default)]
    arguments: Vec<JsonValue>,
}

impl Message {
    /// Decode the `[type, data]` array delivered by the transport binding.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let mut parts: Vec<JsonValue> = serde_json::from_str(raw)
            .map_err(|err| BridgeError::Protocol(format!("malformed message: {err}")))?;
        if parts.is_empty() || parts.len() > 2 {
            return Err(BridgeError::Protocol(format!(
                "expected [type, data], got {} elements",
                parts.len()
            )));
        }
        let data = if parts.len() == 2 {
            parts.pop().unwrap_or(JsonValue::Null)
        } else {
            JsonValue::Null
        };
        let kind = match parts.pop() {
            Some(JsonValue::String(kind)) => kind,
            other => {
                return Err(BridgeError::Protocol(format!(
                    "message type must be a string, got {}",
                    other.unwrap_or(JsonValue::Null)
                )))
            }
        };

        match kind.as_str() {
            "INIT" => Ok(Message::Init),
            "GET" => {
                let data: GetData = decode(&kind, data)?;
                Ok(Message::Get {
                    id: data.id,
                    property: data.property,
                })
            }
            "SET" => {
                let data: SetData = decode(&kind, data)?;
                Ok(Message::Set {
                    id: data.id,
                    property: data.property,
                    new_value: data.new_value,
                })
            }
            "INVOKE" => {
                let data: InvokeData = decode(&kind, data)?;
                Ok(Message::Invoke {
                    id: data.id,
                    function: data.function,
                    arguments: data.arguments,
                })
            }
            other => Err(BridgeError::Protocol(format!(
                "unknown message type: {other:?}"
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Init => "INIT",
            Message::Get { .. } => "GET",
            Message::Set { .. } => "SET",
            Message::Invoke { .. } => "INVOKE",
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, data: JsonValue) -> Result<T, BridgeError> {
    serde_json::from_value(data)
        .map_err(|err| BridgeError::Protocol(format!("malformed {kind} payload: {err}")))
}

/// Correlation record for one inbound call.
///
/// Calls are answered on the stack that delivered them, so the record only
/// lives for the duration of [`DispatchRouter::dispatch`]. A host body that
/// makes its own round trip opens a nested record with a higher sequence.
#[derive(Debug)]
struct PendingCall<'a> {
    seq: u64,
    depth: usize,
    started: Instant,
    in_flight: &'a AtomicUsize,
}

impl<'a> PendingCall<'a> {
    fn open(next_seq: &AtomicU64, in_flight: &'a AtomicUsize) -> Self {
        Self {
            seq: next_seq.fetch_add(1, Ordering::Relaxed),
            depth: in_flight.fetch_add(1, Ordering::AcqRel),
            started: Instant::now(),
            in_flight,
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Resolves inbound messages against the registry.
pub struct DispatchRouter {
    core: Arc<BridgeCore>,
    poisoned: AtomicBool,
    next_seq: AtomicU64,
    in_flight: AtomicUsize,
}

impl DispatchRouter {
    pub(crate) fn new(core: Arc<BridgeCore>) -> Self {
        Self {
            core,
            poisoned: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Whether a protocol error has been seen since the last INIT.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Calls currently on the dispatch stack.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Handle one raw transport message.
    ///
    /// `Ok(None)` is the literal `null`; `Ok(Some(json))` is the encoded
    /// result. Every error is returned to the caller; none escape as panics.
    pub fn dispatch(&self, raw: &str) -> Result<Option<String>, BridgeError> {
        let call = PendingCall::open(&self.next_seq, &self.in_flight);
        let span = tracing::debug_span!(target: "bridge", "dispatch", seq = call.seq, depth = call.depth);
        let _entered = span.enter();

        let result = self.route(raw);
        let elapsed_us = call.started.elapsed().as_micros() as u64;
        match &result {
            Ok(_) => debug!(target: "bridge", elapsed_us, "call completed"),
            Err(err) => match err.kind() {
                ErrorKind::Protocol => {
                    error!(target: "bridge", error = %err, "protocol error; channel poisoned until INIT")
                }
                ErrorKind::Host | ErrorKind::Surface => {
                    warn!(target: "bridge", error = %err, elapsed_us, "host call failed")
                }
                _ => debug!(target: "bridge", error = %err, elapsed_us, "call rejected"),
            },
        }
        result
    }

    fn route(&self, raw: &str) -> Result<Option<String>, BridgeError> {
        let message = match Message::parse(raw) {
            Ok(message) => message,
            Err(err) => {
                self.poisoned.store(true, Ordering::Release);
                return Err(err);
            }
        };
        debug!(target: "bridge", kind = message.kind(), "dispatching");

        if message != Message::Init && self.is_poisoned() {
            return Err(BridgeError::Protocol(
                "channel rejected after an earlier protocol error; waiting for INIT".into(),
            ));
        }

        match message {
            Message::Init => {
                self.poisoned.store(false, Ordering::Release);
                self.core.reinitialize()?;
                Ok(None)
            }
            Message::Get { id, property } => {
                let bound = self.resolve(&id)?;
                let descriptor = bound
                    .object()
                    .descriptor()
                    .property(&property)
                    .ok_or(BridgeError::PropertyNotFound { property })?;
                let value = guarded(|| descriptor.get(bound.object().instance()))?;
                Ok(encode(value))
            }
            Message::Set {
                id,
                property,
                new_value,
            } => {
                let bound = self.resolve(&id)?;
                let descriptor = bound
                    .object()
                    .descriptor()
                    .property(&property)
                    .ok_or(BridgeError::PropertyNotFound { property })?;
                guarded(|| descriptor.set(bound.object().instance(), &new_value))?;
                Ok(None)
            }
            Message::Invoke {
                id,
                function,
                arguments,
            } => {
                let bound = self.resolve(&id)?;
                let descriptor = bound
                    .object()
                    .descriptor()
                    .function(&function)
                    .ok_or(BridgeError::FunctionNotFound { function })?;
                let value = guarded(|| descriptor.invoke(bound.object().instance(), &arguments))?;
                Ok(encode(value))
            }
        }
    }

    fn resolve(&self, id: &str) -> Result<Arc<BoundObject>, BridgeError> {
        self.core
            .registry()
            .lookup(id)
            .filter(|bound| bound.is_live())
            .ok_or_else(|| BridgeError::ObjectNotFound { id: id.to_string() })
    }
}

/// Run host code, turning a panic into a host error.
fn guarded<T>(f: impl FnOnce() -> Result<T, BridgeError>) -> Result<T, BridgeError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(BridgeError::panicked(payload)))
}

fn encode(value: JsonValue) -> Option<String> {
    if value.is_null() {
        None
    } else {
        Some(value.to_string())
    }
}
