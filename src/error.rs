//! Error types for the HART-IP client.

use std::io;
use thiserror::Error;

/// Result type alias for HART-IP operations.
pub type Result<T> = std::result::Result<T, HartError>;

/// Broad classification of a [`HartError`].
///
/// Callers use this to tell transport failures (the connection is gone) from
/// protocol or decode problems that only affect a single response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Socket, resolution, timeout or peer-closed failures.
    Transport,
    /// Malformed or unsupported frames.
    Protocol,
    /// Session initiate was refused by the server.
    Session,
    /// Delayed-response retries ran out.
    RetryExhausted,
    /// The caller cancelled a retry sequence.
    UserAbort,
    /// A response payload could not be rendered.
    Decode,
    /// The API was called with invalid arguments or in the wrong state.
    Usage,
}

/// Errors that can occur during HART-IP communication.
#[derive(Debug, Error)]
pub enum HartError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The host name could not be resolved to an address.
    #[error("Cannot resolve host '{host}': {reason}")]
    Resolve {
        /// Host name as given by the caller.
        host: String,
        /// Resolver failure description.
        reason: String,
    },

    /// Socket send or receive timed out.
    #[error("Communication timeout")]
    Timeout,

    /// The peer closed or reset the connection, or the transport was shut down.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An operation requiring an established session was attempted without one.
    #[error("Not connected: call connect to initialize the network connection first")]
    NotConnected,

    /// A connection is already open on this transport.
    #[error("A HART-IP connection is already open to {0}")]
    AlreadyConnected(String),

    /// The requested transport kind is not available.
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(&'static str),

    /// The response carried a HART-IP version this client does not speak.
    #[error("Unsupported HART-IP message version: {0}")]
    UnsupportedVersion(u8),

    /// The response header carried an unknown message type.
    #[error("Unsupported HART-IP message type: {0}")]
    UnsupportedMessageType(u8),

    /// Invalid response received from the server.
    #[error("Invalid response: {reason}")]
    InvalidResponse {
        /// Description of the response error.
        reason: String,
    },

    /// The server refused the session initiate request.
    #[error("Session initiate rejected with status {status}: {description}")]
    SessionRejected {
        /// Status byte from the session initiate reply.
        status: u8,
        /// Human readable meaning of the status byte.
        description: &'static str,
    },

    /// No response arrived before the request timeout, or the connection closed
    /// while the request was pending.
    #[error("No response received")]
    NoResponse,

    /// The device kept answering busy / delayed-response until the retry ceiling.
    #[error("Delayed response retries exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Number of retries sent.
        attempts: u32,
    },

    /// The caller aborted a delayed-response retry sequence.
    #[error("User cancelled sending retries")]
    UserAbort,

    /// Invalid parameter provided.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },

    /// Field-layout table or payload decoding failure.
    #[error("Decode error: {reason}")]
    Decode {
        /// Description of the decoding problem.
        reason: String,
    },
}

impl HartError {
    /// Creates a new `InvalidResponse` error.
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::HartError;
    ///
    /// let err = HartError::invalid_response("response too short");
    /// assert_eq!(err.to_string(), "Invalid response: response too short");
    /// ```
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidParameter` error.
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::HartError;
    ///
    /// let err = HartError::invalid_parameter("data", "odd number of hex digits");
    /// ```
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `Decode` error.
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Returns the broad category of this error.
    ///
    /// # Example
    ///
    /// ```
    /// use hart_ip::{ErrorKind, HartError};
    ///
    /// assert_eq!(HartError::Timeout.kind(), ErrorKind::Transport);
    /// assert_eq!(HartError::UserAbort.kind(), ErrorKind::UserAbort);
    /// ```
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_)
            | Self::Resolve { .. }
            | Self::Timeout
            | Self::ConnectionClosed
            | Self::NotConnected
            | Self::AlreadyConnected(_)
            | Self::UnsupportedTransport(_)
            | Self::NoResponse => ErrorKind::Transport,
            Self::UnsupportedVersion(_)
            | Self::UnsupportedMessageType(_)
            | Self::InvalidResponse { .. } => ErrorKind::Protocol,
            Self::SessionRejected { .. } => ErrorKind::Session,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::UserAbort => ErrorKind::UserAbort,
            Self::Decode { .. } => ErrorKind::Decode,
            Self::InvalidParameter { .. } => ErrorKind::Usage,
        }
    }

    /// Returns whether the error leaves the connection unusable.
    ///
    /// A single timed-out request (`NoResponse`) or a malformed frame is not
    /// fatal; a closed socket or a version mismatch is.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionClosed
                | Self::NotConnected
                | Self::UnsupportedVersion(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_response_display() {
        let err = HartError::invalid_response("response too short for command 84");
        assert_eq!(
            err.to_string(),
            "Invalid response: response too short for command 84"
        );
    }

    #[test]
    fn test_session_rejected_display() {
        let err = HartError::SessionRejected {
            status: 15,
            description: "All available sessions in use",
        };
        assert_eq!(
            err.to_string(),
            "Session initiate rejected with status 15: All available sessions in use"
        );
        assert_eq!(err.kind(), ErrorKind::Session);
    }

    #[test]
    fn test_kinds_distinguish_abort_from_timeout() {
        assert_eq!(HartError::UserAbort.kind(), ErrorKind::UserAbort);
        assert_eq!(HartError::NoResponse.kind(), ErrorKind::Transport);
        assert_eq!(
            HartError::RetryExhausted { attempts: 3 }.kind(),
            ErrorKind::RetryExhausted
        );
        assert_eq!(HartError::decode("bad layout").kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(HartError::ConnectionClosed.is_fatal());
        assert!(HartError::UnsupportedVersion(2).is_fatal());
        assert!(!HartError::NoResponse.is_fatal());
        assert!(!HartError::invalid_response("short").is_fatal());
    }
}
