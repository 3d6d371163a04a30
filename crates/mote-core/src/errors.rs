//! Unified error system for Mote
//!
//! One error type for every layer. Variants follow the failure taxonomy of the
//! engine: invalid input, missing entities, exhausted fixed-size tables,
//! transport and handshake failures, protocol errors surfaced by the codec,
//! and the single fatal initialization failure.

use serde::{Deserialize, Serialize};

/// Unified error type for all Mote operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum MoteError {
    /// Invalid input or configuration
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Entity not found (service, transaction, socket, session)
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// A bounded table or identifier space is full
    #[error("Resource exhausted: {message}")]
    ResourceExhausted {
        /// Error message naming the exhausted resource
        message: String,
    },

    /// Datagram transmission or socket operation failed
    #[error("Transport error: {message}")]
    Transport {
        /// Error message describing the transport failure
        message: String,
    },

    /// Secure channel handshake failed
    #[error("Handshake error: {message}")]
    Handshake {
        /// Error message describing the handshake failure
        message: String,
    },

    /// Message could not be built or parsed
    #[error("Protocol error: {message}")]
    Protocol {
        /// Error message describing the protocol failure
        message: String,
    },

    /// Internal invariant violated
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },

    /// Non-recoverable failure; the host is expected to halt
    #[error("Fatal: {message}")]
    Fatal {
        /// Error message describing the fatal condition
        message: String,
    },
}

impl MoteError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a handshake error
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether the host must stop after seeing this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Whether the failure came from a full table or identifier space
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}

/// Standard Result type for Mote operations
pub type Result<T> = std::result::Result<T, MoteError>;

impl From<std::io::Error> for MoteError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::InvalidInput => Self::invalid(err.to_string()),
            _ => Self::transport(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for MoteError {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid(format!("Invalid configuration: {err}"))
    }
}
