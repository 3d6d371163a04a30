//! Mote Core - foundation types for the CoAP endpoint engine
//!
//! This crate holds everything the orchestration layers share and nothing that
//! performs I/O:
//!
//! - Identifiers (`ServiceId`, `SocketId`, `TimerId`, ...) and the tick clock
//! - The CoAP message model exchanged with the codec collaborator
//! - Service and request option bitmasks
//! - `MoteError`, the single error type used across the workspace
//! - `EngineConfig` and its validation
//! - Effect traits describing the external collaborators (codec, handshake
//!   engine, transport, scheduler, randomness)

#![forbid(unsafe_code)]

/// Collaborator interfaces (pure signatures, no implementations)
pub mod effects;

/// Unified error handling
pub mod errors;

/// Engine configuration
pub mod config;

/// Small integer identifiers and the tick clock
pub mod identifiers;

/// CoAP message model
pub mod message;

/// Service and request option bitmasks
pub mod options;

pub use config::{EngineConfig, HandshakeTimeouts, SessionConfig, TransactionConfig, MAX_RESEND_COUNT};
pub use errors::{MoteError, Result};
pub use identifiers::{InterfaceId, MessageId, ServiceId, SocketId, Tick, TimerId, TransportHandle};
pub use message::{CoapMessage, Code, ContentFormat, MessageType, MethodMask, ParseOutcome, Token};
pub use options::{RequestOptions, ServiceOptions};
