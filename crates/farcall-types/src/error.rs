//! Error types shared across farcall.
//!
//! Two layers exist. A [`Fault`] is whatever an operation *throws*: either a
//! structured [`ErrorObject`] or an arbitrary JSON value. Faults cross the
//! channel as THROW wire values. An [`RpcError`] is what a caller of a remote
//! handle observes, which includes faults raised on the other side as well as
//! local encoding and protocol failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structured error with a name, message and optional stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error class name, e.g. `Error` or `TypeError`.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Stack trace text, when the thrower captured one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorObject {
    /// A generic `Error`.
    pub fn new(message: impl Into<String>) -> Self {
        Self::named("Error", message)
    }

    /// An error with an explicit class name.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Serialize into the `{name, message, stack}` THROW payload.
    pub fn to_json(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "name": self.name,
            "message": self.message,
        });
        if let Some(stack) = &self.stack {
            payload["stack"] = serde_json::Value::String(stack.clone());
        }
        payload
    }

    /// Rebuild an error from a THROW payload.
    ///
    /// Missing fields fall back to a generic `Error` with an empty message,
    /// so a malformed payload still surfaces as an error rather than a value.
    pub fn from_json(payload: &serde_json::Value) -> Self {
        Self {
            name: payload["name"].as_str().unwrap_or("Error").to_string(),
            message: payload["message"].as_str().unwrap_or_default().to_string(),
            stack: payload["stack"].as_str().map(String::from),
        }
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Something thrown by an operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Fault {
    /// A structured error object.
    #[error("{0}")]
    Error(ErrorObject),

    /// A bare thrown value that is not an error object.
    #[error("Uncaught {0}")]
    Value(serde_json::Value),
}

impl Fault {
    /// Throw a generic `Error`.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorObject::new(message))
    }

    /// Throw a `TypeError`, the class used for member-access failures.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Error(ErrorObject::named("TypeError", message))
    }

    /// Throw a non-error value.
    pub fn value(value: impl Into<serde_json::Value>) -> Self {
        Self::Value(value.into())
    }

    /// The error message, if this is a structured error.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Error(err) => Some(&err.message),
            Self::Value(_) => None,
        }
    }

    /// The error class name, if this is a structured error.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Error(err) => Some(&err.name),
            Self::Value(_) => None,
        }
    }
}

impl From<ErrorObject> for Fault {
    fn from(err: ErrorObject) -> Self {
        Self::Error(err)
    }
}

/// Errors observed by the caller of a remote operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    /// The remote side threw while executing the operation.
    #[error("Remote failure: {0}")]
    Remote(Fault),

    /// A value has no wire representation.
    #[error("DataCloneError: {0}")]
    DataClone(String),

    /// A HANDLER wire value names a handler that is not registered here.
    #[error("No transfer handler registered as '{0}'")]
    UnknownHandler(String),

    /// A registered transfer handler failed to (de)serialize a value.
    #[error("Transfer handler '{name}' failed: {reason}")]
    Handler {
        /// The handler's registered name.
        name: String,
        /// Why it failed.
        reason: String,
    },

    /// The handle's connection was released.
    #[error("Proxy has been released and is not useable")]
    Released,

    /// The peer answered with something the protocol does not allow.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    /// The remote fault, if the other side threw.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Remote(fault) => Some(fault),
            _ => None,
        }
    }
}

/// Errors raised by nested remote calls inside a local function become
/// faults of that function, so a dispatcher can forward them as THROW.
impl From<RpcError> for Fault {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(fault) => fault,
            RpcError::DataClone(message) => {
                Fault::Error(ErrorObject::named("DataCloneError", message))
            }
            other => Fault::error(other.to_string()),
        }
    }
}

/// Alias for Result with RpcError.
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_object_payload_roundtrip() {
        let err = ErrorObject::named("RangeError", "out of range").with_stack("at frame 1");
        let payload = err.to_json();
        assert_eq!(payload["name"], "RangeError");
        assert_eq!(payload["stack"], "at frame 1");
        assert_eq!(ErrorObject::from_json(&payload), err);
    }

    #[test]
    fn test_error_object_from_partial_payload() {
        let err = ErrorObject::from_json(&serde_json::json!({"message": "boom"}));
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "boom");
        assert!(err.stack.is_none());
    }

    #[test]
    fn test_fault_display() {
        assert_eq!(Fault::type_error("bad").to_string(), "TypeError: bad");
        assert_eq!(Fault::value(42).to_string(), "Uncaught 42");
    }

    #[test]
    fn test_rpc_error_into_fault() {
        let remote = RpcError::Remote(Fault::value("oops"));
        assert_eq!(Fault::from(remote), Fault::value("oops"));

        let clone = Fault::from(RpcError::DataClone("function could not be cloned".into()));
        assert_eq!(clone.name(), Some("DataCloneError"));
        assert_eq!(clone.message(), Some("function could not be cloned"));

        let released = Fault::from(RpcError::Released);
        assert_eq!(
            released.message(),
            Some("Proxy has been released and is not useable")
        );
    }
}
