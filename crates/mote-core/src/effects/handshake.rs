//! Handshake engine effect trait definitions
//!
//! The handshake engine runs a DTLS-style handshake per peer and protects
//! application records once the channel is up. It never touches sockets or
//! timers directly: every call receives a `HandshakeIo` bound to the session's
//! socket, peer and two-stage timer.

use crate::config::HandshakeTimeouts;
use crate::errors::Result;
use crate::identifiers::TimerId;
use std::net::SocketAddr;

/// Which side of the handshake the session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeRole {
    /// We initiated the exchange
    Client,
    /// The peer initiated the exchange
    Server,
}

/// Progress reported by a handshake step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Channel established
    Established,
    /// More flights needed; not an error
    WouldBlock,
    /// Handshake failed irrecoverably
    Failed {
        /// Engine diagnostic
        reason: String,
    },
}

/// Result of reading application data from an established channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Decrypted application payload
    Data(Vec<u8>),
    /// No complete record available
    WouldBlock,
    /// Peer sent a close-notify alert
    PeerClosed,
    /// Record protection failed
    Failed {
        /// Engine diagnostic
        reason: String,
    },
}

/// State of the session's two-stage timer as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerStatus {
    /// No timer armed
    Cancelled,
    /// Armed, nothing expired yet
    Running,
    /// The intermediate interval expired at least once
    IntermediateExpired,
    /// The final budget is spent
    FinalExpired,
}

/// Key material used to run the handshake
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Certificate chain and private key
    Certificate {
        /// DER or PEM encoded chain
        chain: Vec<u8>,
        /// Private key bytes
        private_key: Vec<u8>,
    },
    /// Pre-shared key
    PreSharedKey {
        /// PSK identity
        identity: Vec<u8>,
        /// Key bytes
        key: Vec<u8>,
    },
    /// Password for a password-authenticated key exchange
    Password(Vec<u8>),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Certificate { chain, .. } => f
                .debug_struct("Certificate")
                .field("chain_len", &chain.len())
                .finish_non_exhaustive(),
            Self::PreSharedKey { identity, .. } => f
                .debug_struct("PreSharedKey")
                .field("identity_len", &identity.len())
                .finish_non_exhaustive(),
            Self::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Parameters for creating a handshake session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeParams {
    /// Timer id the session's timer requests will carry
    pub timer_id: TimerId,
    /// Remote peer
    pub peer: SocketAddr,
    /// Client or server side
    pub role: HandshakeRole,
}

/// Transport and timer callbacks bound to one session
pub trait HandshakeIo {
    /// Send a protected datagram to the session's peer
    fn send(&mut self, datagram: &[u8]) -> Result<usize>;

    /// Take the datagram pending on the session's socket, if any
    fn recv(&mut self) -> Option<Vec<u8>>;

    /// Arm the two-stage timer; `final_ms == 0` cancels it
    fn set_timer(&mut self, intermediate_ms: u32, final_ms: u32);

    /// Current state of the two-stage timer
    fn timer_status(&self) -> TimerStatus;
}

/// One handshake/record-protection context for one peer
pub trait HandshakeSession: Send {
    /// Start a non-blocking handshake
    fn connect(
        &mut self,
        io: &mut dyn HandshakeIo,
        credentials: &Credentials,
        timeouts: HandshakeTimeouts,
    ) -> HandshakeStatus;

    /// Run the next handshake step
    fn continue_connecting(&mut self, io: &mut dyn HandshakeIo) -> HandshakeStatus;

    /// Whether `connect` has been called
    fn is_started(&self) -> bool;

    /// Decrypt the next application record
    fn read(&mut self, io: &mut dyn HandshakeIo) -> ReadOutcome;

    /// Encrypt and send an application payload
    fn send_message(&mut self, io: &mut dyn HandshakeIo, payload: &[u8]) -> Result<usize>;

    /// Exported key block of the established channel
    fn keyblock(&self) -> Option<Vec<u8>>;

    /// Send a close-notify alert
    fn send_close_alert(&mut self, io: &mut dyn HandshakeIo);
}

/// Factory for handshake sessions
pub trait HandshakeEngine: Send {
    /// Create a session context; dropping it destroys the context
    fn create(&mut self, params: HandshakeParams) -> Result<Box<dyn HandshakeSession>>;
}
