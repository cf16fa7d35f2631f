//! Error types for the Neuron command bus
//!
//! Specific error families (codec, transport) are folded into the unified
//! `NeuronError`, and every variant reduces to a wire status code through
//! [`NeuronError::status`].

use crate::status::StatusCode;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Errors raised while framing, obfuscating or decoding payloads
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Input is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Salt marker not found in decrypted payload")]
    MissingSalt,
    #[error("Cipher initialisation failed: {reason}")]
    Cipher { reason: String },
    #[error("Compression failed: {0}")]
    Compression(#[from] std::io::Error),
    #[error("Base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Malformed frame: {reason}")]
    MalformedFrame { reason: String },
}

/// Errors raised by the duplex transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },
    #[error("Lack of Connection")]
    NotConnected,
    #[error("Send failed to {peer}: {reason}")]
    SendFailed { peer: String, reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Transport timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the Neuron command bus
#[derive(Debug, thiserror::Error)]
pub enum NeuronError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Operation {service}.{operation} not found")]
    OperationNotFound { service: String, operation: String },

    #[error("Lack of Parameter -> {name}")]
    MissingParameter { name: String },

    #[error("Bad request: {reason}")]
    BadRequest { reason: String },

    /// A supervised task panicked or failed
    #[error("Task fault in {context}")]
    TaskFault { context: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Service is not running: {reason}")]
    Shutdown { reason: String },

    #[error("Operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("Invalid URL: {reason}")]
    InvalidUrl { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl NeuronError {
    /// Create a not-found error for an unknown operation pair
    pub fn operation_not_found<S: Into<String>, O: Into<String>>(service: S, operation: O) -> Self {
        NeuronError::OperationNotFound {
            service: service.into(),
            operation: operation.into(),
        }
    }

    /// Create a request error for a missing query parameter
    pub fn missing_parameter<T: Into<String>>(name: T) -> Self {
        NeuronError::MissingParameter { name: name.into() }
    }

    pub fn bad_request<T: Into<String>>(reason: T) -> Self {
        NeuronError::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn task_fault<T: Into<String>>(context: T) -> Self {
        NeuronError::TaskFault {
            context: context.into(),
        }
    }

    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        NeuronError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn shutdown<T: Into<String>>(reason: T) -> Self {
        NeuronError::Shutdown {
            reason: reason.into(),
        }
    }

    pub fn timeout<T: Into<String>>(reason: T) -> Self {
        NeuronError::Timeout {
            reason: reason.into(),
        }
    }

    pub fn invalid_url<T: Into<String>>(reason: T) -> Self {
        NeuronError::InvalidUrl {
            reason: reason.into(),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed<P: Into<String>, R: Into<String>>(peer: P, reason: R) -> Self {
        NeuronError::Transport(TransportError::ConnectionFailed {
            peer: peer.into(),
            reason: reason.into(),
        })
    }

    pub fn send_failed<P: Into<String>, R: Into<String>>(peer: P, reason: R) -> Self {
        NeuronError::Transport(TransportError::SendFailed {
            peer: peer.into(),
            reason: reason.into(),
        })
    }

    pub fn malformed_frame<T: Into<String>>(reason: T) -> Self {
        NeuronError::Codec(CodecError::MalformedFrame {
            reason: reason.into(),
        })
    }

    /// Wire status code for this error
    pub fn status(&self) -> StatusCode {
        match self {
            NeuronError::Codec(_) => StatusCode::CODEC_ERROR,
            NeuronError::Json(_) => StatusCode::JSON_ERROR,
            NeuronError::Transport(TransportError::NetworkIo(_)) => StatusCode::TCP_CONN_ERROR,
            NeuronError::Transport(_) => StatusCode::WEBSOCKET_ERROR,
            NeuronError::OperationNotFound { .. } => StatusCode::COMMAND_ERROR,
            NeuronError::MissingParameter { .. } | NeuronError::BadRequest { .. } => {
                StatusCode::REQUEST_ERROR
            }
            NeuronError::TaskFault { .. } => StatusCode::SYSTEM_ERROR,
            NeuronError::Configuration { .. } => StatusCode::FAILED,
            NeuronError::Shutdown { .. } => StatusCode::SYSTEM_SHUTDOWN,
            NeuronError::Timeout { .. } => StatusCode::PROCESS_TIMEOUT,
            NeuronError::InvalidUrl { .. } => StatusCode::URL_ERROR,
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, NeuronError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            NeuronError::operation_not_found("System", "Nope").status(),
            StatusCode::COMMAND_ERROR
        );
        assert_eq!(
            NeuronError::missing_parameter("neuronId").status(),
            StatusCode::REQUEST_ERROR
        );
        assert_eq!(
            NeuronError::Transport(TransportError::NotConnected).status(),
            StatusCode::WEBSOCKET_ERROR
        );
        assert_eq!(
            NeuronError::bad_request("body too large").status(),
            StatusCode::REQUEST_ERROR
        );
        assert_eq!(NeuronError::task_fault("looper").status(), StatusCode::SYSTEM_ERROR);
        assert_eq!(
            NeuronError::Codec(CodecError::MissingSalt).status(),
            StatusCode::CODEC_ERROR
        );
    }

    #[test]
    fn test_error_display() {
        let err = NeuronError::missing_parameter("message");
        assert_eq!(err.to_string(), "Lack of Parameter -> message");
        let err = NeuronError::Transport(TransportError::NotConnected);
        assert_eq!(err.to_string(), "Transport error: Lack of Connection");
    }
}
