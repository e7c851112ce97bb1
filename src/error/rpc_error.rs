use serde::{Deserialize, Serialize};
use std::fmt;

/// Status carried by every response message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Unauthorized,
}

impl ResponseStatus {
    /// Returns the wire representation of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
            ResponseStatus::Unauthorized => "unauthorized",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request-level failure reported back to the calling client.
///
/// These never terminate a connection on their own; the dispatcher decides
/// separately whether the offending session is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub status: ResponseStatus,
    pub message: String,
}

impl RpcError {
    /// Creates an `error` status failure
    pub fn error<S: Into<String>>(message: S) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
        }
    }

    /// Creates an `unauthorized` status failure
    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self {
            status: ResponseStatus::Unauthorized,
            message: message.into(),
        }
    }

    pub fn parse_error(details: &str) -> Self {
        Self::error(format!("Failed to parse JSON data: {}", details))
    }

    pub fn missing_id() -> Self {
        Self::error("Error parsing command. Missing 'id'")
    }

    pub fn invalid_method(method: &str) -> Self {
        Self::error(format!(
            "Error parsing method. Got: '{}', Expected: 'Namespace.method'",
            method
        ))
    }

    pub fn no_such_namespace(namespace: &str) -> Self {
        Self::error(format!("No such namespace: {}", namespace))
    }

    pub fn no_such_method(method: &str) -> Self {
        Self::error(format!("No such method: {}", method))
    }

    pub fn handshake_required() -> Self {
        Self::error("Handshake required. Call JSONRPC.Hello first.")
    }

    pub fn initial_setup_required() -> Self {
        Self::unauthorized("Initial setup required. Call CreateUser first.")
    }

    pub fn invalid_token() -> Self {
        Self::unauthorized("Forbidden: Invalid token.")
    }

    pub fn permission_denied() -> Self {
        Self::error("Permission denied")
    }

    pub fn invalid_params(reason: &str, path: &str) -> Self {
        Self::error(format!("Invalid params: {} in {}", reason, path))
    }

    pub fn duplicate_command_id(id: i64) -> Self {
        Self::error(format!("Duplicate command id: {}", id))
    }

    pub fn timed_out() -> Self {
        Self::error("Command timed out")
    }

    pub fn internal() -> Self {
        Self::error("Internal error")
    }

    pub fn invalid_reply() -> Self {
        Self::error("Internal error: invalid reply")
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for RpcError {}
