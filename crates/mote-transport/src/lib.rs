//! Mote Transport - socket multiplexing and secure sessions
//!
//! Sits between the CoAP transaction layer and the transport/handshake
//! collaborators:
//!
//! - **Multiplexer**: reference-counted shared sockets (real or virtual),
//!   multicast membership, inbound demultiplexing and outbound routing
//! - **Sessions**: per-peer secure channels with admission control, LRU
//!   eviction of closed sessions and state-specific inactivity sweeps
//! - **Timer**: the two-stage handshake timer
//! - **Events**: what the multiplexer reports upward (plaintext received,
//!   channel established, channel terminated)
//!
//! Everything runs on the caller's thread and is driven by explicit calls;
//! nothing here blocks or spawns.

#![forbid(unsafe_code)]

/// Events reported to the layer above
pub mod events;

/// Adapter exposing a session's socket and timer to the handshake engine
mod io;

/// Socket multiplexer
pub mod multiplexer;

/// Secure session table and state machine
pub mod session;

/// Multiplexed sockets
pub mod socket;

/// Two-stage handshake timer
pub mod timer;

pub use events::TransportEvent;
pub use multiplexer::{Multiplexer, OutboundDatagram, SendOutcome, SocketCallbacks};
pub use session::{SecureSession, SessionManager, SessionState};
pub use socket::{Socket, SocketSpec, SocketTable};
pub use timer::{HandshakeTimer, TimerCommand, TimerFiring};

use std::net::Ipv6Addr;

/// Link-local, admin-local and site-local "All CoAP Nodes" groups
pub const COAP_MULTICAST_GROUPS: [Ipv6Addr; 3] = [
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfd),
    Ipv6Addr::new(0xff03, 0, 0, 0, 0, 0, 0, 0xfd),
    Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xfd),
];
