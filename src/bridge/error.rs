use std::fmt;

use thiserror::Error;

use crate::surface::SurfaceError;

/// Property operation named in permission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Set,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Get => f.write_str("GET"),
            Operation::Set => f.write_str("SET"),
        }
    }
}

/// Coarse category of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Resolution,
    Permission,
    Arity,
    Coercion,
    Host,
    Surface,
    Setup,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid object path: {path:?}")]
    InvalidPath { path: String },
    #[error("{path} is a declared child of {parent}; change it through {parent}")]
    DeclaredChild { path: String, parent: String },
    #[error("no tokio runtime to run mutation watchers on")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
    #[error("object not found: {id}")]
    ObjectNotFound { id: String },
    #[error("property not found: {property}")]
    PropertyNotFound { property: String },
    #[error("function not found: {function}")]
    FunctionNotFound { function: String },
    #[error("{operation} is not permitted for the property: {property}")]
    NotPermitted {
        operation: Operation,
        property: String,
    },
    #[error("argument count mismatch for {function}: expected {expected}, got {actual}")]
    ArityMismatch {
        function: String,
        expected: usize,
        actual: usize,
    },
    #[error("{subject} could not be converted to {expected}: {reason}")]
    Coercion {
        subject: String,
        expected: &'static str,
        reason: String,
    },
    #[error("{message}")]
    Host { message: String, trace: String },
    #[error("webview surface failed: {0}")]
    Surface(#[from] SurfaceError),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Protocol(_) => ErrorKind::Protocol,
            BridgeError::InvalidPath { .. }
            | BridgeError::DeclaredChild { .. }
            | BridgeError::ObjectNotFound { .. }
            | BridgeError::PropertyNotFound { .. }
            | BridgeError::FunctionNotFound { .. } => ErrorKind::Resolution,
            BridgeError::NotPermitted { .. } => ErrorKind::Permission,
            BridgeError::ArityMismatch { .. } => ErrorKind::Arity,
            BridgeError::Coercion { .. } => ErrorKind::Coercion,
            BridgeError::Host { .. } => ErrorKind::Host,
            BridgeError::Surface(_) => ErrorKind::Surface,
            BridgeError::NoRuntime(_) => ErrorKind::Setup,
        }
    }

    /// Only protocol errors compromise the channel.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Protocol(_))
    }

    pub(crate) fn host(err: anyhow::Error) -> Self {
        BridgeError::Host {
            message: err.to_string(),
            trace: format!("{err:?}"),
        }
    }

    pub(crate) fn panicked(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "host code panicked".to_string()
        };
        BridgeError::Host {
            trace: format!("panic: {message}"),
            message,
        }
    }

    /// Text handed back to the script side as the rejection value.
    pub fn to_script_message(&self) -> String {
        match self {
            BridgeError::Host { message, trace } if trace != message => {
                format!("{message}\n{trace}")
            }
            other => other.to_string(),
        }
    }
}
