//! # Shared Error Handling Module
//!
//! Error handling for the mockbus harnesses, with each failure classified by
//! where it came from.
//!
//! ## Error Categories
//!
//! - **Transport Errors**: The private bus could not be started or reached
//! - **Closed Errors**: An operation was attempted on a closed connection
//! - **Remote Errors**: The peer replied with a structured D-Bus error
//! - **Timeout Errors**: A blocking call did not complete in time
//! - **Validation Errors**: Malformed names, paths, signatures or descriptors
//! - **Registration Errors**: An object export or name ownership failed
//! - **Decode Errors**: A value did not have the type the caller asked for
//!
//! Programmer-contract violations and broken test expectations are not
//! represented here: the harness crates panic for those.

use thiserror::Error;
use tracing::warn;

/// Result type alias for mockbus operations
///
/// This is the standard Result type used throughout the mockbus crates.
pub type Result<T> = std::result::Result<T, MockBusError>;

/// Error types for mockbus transport and harness operations
///
/// Each variant carries enough context to produce an actionable test failure
/// message when the caller decides to `unwrap()` it.
#[derive(Error, Debug)]
pub enum MockBusError {
    /// Private bus or connection setup errors
    ///
    /// These occur when the bus cannot be brought up, or when a connection
    /// cannot be opened to the given bus address.
    ///
    /// **Recovery Strategy**: Fail the test; the environment is broken
    #[error("Transport error: {message}")]
    Transport {
        /// Human-readable description of the transport failure
        message: String,
        /// Optional source error for additional context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation attempted on a closed connection or a bus which is down
    #[error("{what} is closed")]
    Closed {
        /// Description of the closed resource
        what: String,
    },

    /// Structured error reply received from the remote peer
    ///
    /// `name` is a D-Bus error name such as
    /// `org.freedesktop.DBus.Error.UnknownMethod`.
    #[error("{name}: {message}")]
    Remote {
        /// D-Bus error name
        name: String,
        /// Error message sent by the peer
        message: String,
    },

    /// Blocking operation exceeded its timeout
    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
        /// Description of the operation that timed out
        operation: String,
    },

    /// Malformed bus name, object path, signature or interface descriptor
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Reason the argument was rejected
        reason: String,
    },

    /// Object export or name ownership failure
    #[error("Registration of {target} failed: {reason}")]
    Registration {
        /// Object path or bus name that failed to register
        target: String,
        /// Reason for the failure
        reason: String,
    },

    /// Value could not be converted to the requested type
    #[error("Cannot decode value: expected {expected}, found {found}")]
    Decode {
        /// Expected D-Bus type signature or Rust type description
        expected: String,
        /// Signature of the value actually present
        found: String,
    },
}

impl MockBusError {
    /// Creates a transport error with optional source context
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mockbus_shared::error::MockBusError;
    ///
    /// let error = MockBusError::transport("no bus at address", None);
    /// ```
    pub fn transport(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source,
        }
    }

    /// Creates a closed-resource error
    pub fn closed(what: impl Into<String>) -> Self {
        Self::Closed { what: what.into() }
    }

    /// Creates a remote error from a D-Bus error name and message
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mockbus_shared::error::MockBusError;
    ///
    /// let error = MockBusError::remote("org.freedesktop.DBus.Error.Failed", "nope");
    /// assert_eq!(error.remote_name(), Some("org.freedesktop.DBus.Error.Failed"));
    /// ```
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error with operation context
    pub fn timeout(timeout: std::time::Duration, operation: impl Into<String>) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            operation: operation.into(),
        }
    }

    /// Creates an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Creates a registration error for an object path or bus name
    pub fn registration(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Registration {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Creates a decode error
    pub fn decode(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::Decode {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Returns the D-Bus error name if this is a remote error
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            MockBusError::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Checks if this error represents a temporary condition
    ///
    /// Only timeouts and a handful of remote errors qualify. Nothing in the
    /// harness retries automatically; this only helps callers that layer
    /// their own deadline on top of the non-blocking APIs.
    pub fn is_temporary(&self) -> bool {
        match self {
            MockBusError::Timeout { .. } => true,
            MockBusError::Remote { name, .. } => matches!(
                name.as_str(),
                "org.freedesktop.DBus.Error.NoReply"
                    | "org.freedesktop.DBus.Error.Timeout"
                    | "org.freedesktop.DBus.Error.LimitsExceeded"
            ),
            MockBusError::Transport { .. }
            | MockBusError::Closed { .. }
            | MockBusError::InvalidArgument { .. }
            | MockBusError::Registration { .. }
            | MockBusError::Decode { .. } => false,
        }
    }
}

/// Conversion from the oneshot receive error raised when the server side of a
/// marshalled request went away before answering.
impl From<tokio::sync::oneshot::error::RecvError> for MockBusError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        warn!(error = %err, "Result channel closed before a reply was sent");
        MockBusError::closed("result channel")
    }
}
