//! Collaborator effect interfaces
//!
//! The engine orchestrates five external collaborators and owns none of their
//! implementations. Each one is an object-safe trait here; production handlers
//! live in `mote-effects` and deterministic mocks in `mote-testkit`.
//!
//! | Trait | Collaborator |
//! |-------|--------------|
//! | `CodecEffects` | CoAP wire codec with duplicate detection and retransmission queue |
//! | `HandshakeEngine`, `HandshakeSession` | Secure channel handshake and record protection |
//! | `TransportEffects` | UDP sockets and multicast membership |
//! | `SchedulerEffects` | Host timer service |
//! | `RandomEffects` | Random source for tokens |
//!
//! All traits are `Send` so a fully assembled endpoint can be moved onto the
//! host thread that drives it. None of them is ever called concurrently.

pub mod codec;
pub mod handshake;
pub mod random;
pub mod scheduler;
pub mod transport;

pub use codec::{CodecEffects, Retransmission};
pub use handshake::{
    Credentials, HandshakeEngine, HandshakeIo, HandshakeParams, HandshakeRole, HandshakeSession,
    HandshakeStatus, ReadOutcome, TimerStatus,
};
pub use random::RandomEffects;
pub use scheduler::SchedulerEffects;
pub use transport::{
    AddressPreference, Datagram, MulticastAction, OpenOptions, SendMeta, TransportEffects,
};

/// Bundle of boxed collaborator handlers used to assemble an endpoint
pub struct EffectHandlers {
    /// Wire codec
    pub codec: Box<dyn CodecEffects>,
    /// Handshake engine factory
    pub handshake: Box<dyn HandshakeEngine>,
    /// UDP transport
    pub transport: Box<dyn TransportEffects>,
    /// Host timer service
    pub scheduler: Box<dyn SchedulerEffects>,
    /// Random source
    pub random: Box<dyn RandomEffects>,
}

impl std::fmt::Debug for EffectHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectHandlers")
            .field("codec", &"<dyn CodecEffects>")
            .field("handshake", &"<dyn HandshakeEngine>")
            .field("transport", &"<dyn TransportEffects>")
            .field("scheduler", &"<dyn SchedulerEffects>")
            .field("random", &"<dyn RandomEffects>")
            .finish()
    }
}
