//! Transport effect trait definitions
//!
//! Real UDP socket I/O and multicast group membership. Sockets may listen on a
//! wildcard address, so every received datagram carries the destination
//! address recovered from packet metadata when the transport can supply it.

use crate::errors::Result;
use crate::identifiers::{InterfaceId, TransportHandle};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Destination reported when packet metadata is unavailable
pub const UNKNOWN_DESTINATION: Ipv6Addr = Ipv6Addr::new(
    0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff,
);

/// Source address class to prefer when the stack has several
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressPreference {
    /// Let the stack choose
    #[default]
    Default,
    /// Prefer a global (long) address
    Long,
    /// Prefer a mesh-local (short) address
    Short,
}

/// Per-datagram send metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendMeta {
    /// Explicit source address, sent as ancillary data
    pub source: Option<IpAddr>,
    /// Source address class preference
    pub preference: AddressPreference,
}

/// Options used when opening a transport endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenOptions {
    /// Port to bind; zero binds an ephemeral port
    pub port: u16,
    /// Interface to bind to, if any
    pub interface: Option<InterfaceId>,
    /// Disable link-layer security for this socket
    pub bypass_link_security: bool,
}

/// Multicast membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MulticastAction {
    /// Join a group
    Join,
    /// Leave a group
    Leave,
}

/// A received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Transport endpoint that received it
    pub handle: TransportHandle,
    /// Sender address
    pub source: SocketAddr,
    /// Destination address from packet metadata, when available
    pub destination: Option<IpAddr>,
    /// Datagram bytes
    pub payload: Vec<u8>,
}

/// UDP transport collaborator
pub trait TransportEffects: Send {
    /// Open a UDP endpoint
    fn open(&mut self, options: OpenOptions) -> Result<TransportHandle>;

    /// Port an endpoint is bound to
    fn local_port(&self, handle: TransportHandle) -> Option<u16>;

    /// Close an endpoint
    fn close(&mut self, handle: TransportHandle);

    /// Send one datagram
    fn send_to(
        &mut self,
        handle: TransportHandle,
        destination: SocketAddr,
        meta: &SendMeta,
        payload: &[u8],
    ) -> Result<usize>;

    /// Drain datagrams received since the last call
    fn recv(&mut self) -> Vec<Datagram>;

    /// Join or leave a multicast group on an interface
    fn set_multicast_membership(
        &mut self,
        handle: TransportHandle,
        action: MulticastAction,
        group: Ipv6Addr,
        interface: InterfaceId,
    ) -> Result<()>;
}
