//! Mote Effects - production handlers
//!
//! Effect handlers that touch the operating system. Everything else in the
//! engine is synchronous and deterministic; this crate is where real sockets,
//! entropy and wall-clock timers come in.
//!
//! - `UdpTransport`: non-blocking UDP sockets built with `socket2`
//! - `OsRandom`: entropy-seeded random source
//! - `HostScheduler` and `TaskletHost`: a single-threaded tokio loop that
//!   drives an `Endpoint`

#![forbid(unsafe_code)]

/// Tasklet host loop and its timer service
pub mod host;

/// Entropy-backed random source
pub mod random;

/// UDP transport
pub mod udp;

pub use host::{HostScheduler, TaskletHost};
pub use random::OsRandom;
pub use udp::UdpTransport;
