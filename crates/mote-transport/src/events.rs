//! Transport events
//!
//! The multiplexer never calls up into the transaction layer. Anything the
//! layer above must react to is queued as a `TransportEvent` and drained by the
//! caller after each operation.

use mote_core::{ServiceId, SocketId};
use std::net::{IpAddr, SocketAddr};

/// Something the layer above must react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Plaintext CoAP bytes arrived on a socket
    Received {
        /// Receiving socket
        socket: SocketId,
        /// Sender
        peer: SocketAddr,
        /// Local address the datagram was sent to
        local: IpAddr,
        /// Plaintext bytes
        data: Vec<u8>,
    },

    /// A secure channel reached the established state
    SecurityEstablished {
        /// Socket carrying the channel
        socket: SocketId,
        /// Service owning that socket
        owner: ServiceId,
        /// Remote peer
        peer: SocketAddr,
        /// Exported key block
        keyblock: Vec<u8>,
    },

    /// A secure channel failed, was closed or was reclaimed
    SessionTerminated {
        /// Socket that carried the channel
        socket: SocketId,
        /// Remote peer
        peer: SocketAddr,
    },
}

impl TransportEvent {
    /// Socket the event relates to
    pub fn socket(&self) -> SocketId {
        match self {
            Self::Received { socket, .. }
            | Self::SecurityEstablished { socket, .. }
            | Self::SessionTerminated { socket, .. } => *socket,
        }
    }
}
