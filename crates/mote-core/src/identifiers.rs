//! Small integer identifiers
//!
//! Every identifier handed across the public API is a small integer with a
//! documented range. Constructors reject out-of-range values instead of
//! wrapping, so a value of one of these types is always valid.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host tick count in seconds, supplied to `exec`
pub type Tick = u64;

/// CoAP message id
pub type MessageId = u16;

/// Network interface id as known to the host stack
pub type InterfaceId = i8;

/// Identifier of a registered service, 1..=126
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(u8);

impl ServiceId {
    /// Smallest assignable service id
    pub const MIN: u8 = 1;
    /// Largest assignable service id
    pub const MAX: u8 = 126;

    /// Create a service id, rejecting values outside 1..=126
    pub fn new(raw: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&raw).then_some(Self(raw))
    }

    /// Raw numeric value
    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a handshake timer, 1..=255, unique among live sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(u8);

impl TimerId {
    /// Smallest assignable timer id
    pub const MIN: u8 = 1;
    /// Largest assignable timer id
    pub const MAX: u8 = 255;

    /// Create a timer id; zero is reserved
    pub fn new(raw: u8) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    /// Raw numeric value
    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a multiplexed socket (real or virtual) inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketId(u32);

impl SocketId {
    /// Wrap a raw slot number
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw slot number
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Handle of an open transport endpoint, assigned by the transport collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportHandle(u32);

impl TransportHandle {
    /// Wrap a raw handle value
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp-{}", self.0)
    }
}
