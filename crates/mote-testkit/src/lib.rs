//! Mote Testing Infrastructure
//!
//! Deterministic mock collaborators for the engine. Every mock keeps its state
//! behind an `Arc<Mutex<_>>`, so a test can box one clone into the engine and
//! keep another to inspect what the engine did or to inject input.
//!
//! ```rust,no_run
//! use mote_testkit::MockEffects;
//!
//! let mocks = MockEffects::new(42);
//! let handlers = mocks.handlers();
//! // hand `handlers` to the engine, then inspect `mocks.transport.sent()`
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod codec;
pub mod effects;
pub mod handshake;
pub mod random;
pub mod scheduler;
pub mod strategies;
pub mod transport;

pub use codec::MockCodec;
pub use effects::MockEffects;
pub use handshake::{HandshakeScript, MockHandshakeEngine};
pub use random::{ScriptedRandom, SeededRandom};
pub use scheduler::ManualScheduler;
pub use transport::{MockTransport, SentDatagram};

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Unique-local peer address `fd00::<host>` on `port`
pub fn peer(host: u16, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, host)), port)
}

/// Local address used as packet destination in tests
pub fn local_addr() -> IpAddr {
    IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0x100))
}
