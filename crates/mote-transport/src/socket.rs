//! Multiplexed sockets
//!
//! A socket is either a real transport endpoint or a virtual one whose
//! datagrams travel through application callbacks. Services asking for the
//! same (port, secure, real) combination share one socket; the reference
//! count tracks how many hold it.

use mote_core::{HandshakeTimeouts, InterfaceId, ServiceId, SocketId, TransportHandle};

/// What a service asks for when it opens a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketSpec {
    /// Service that will own the socket if it is created
    pub owner: ServiceId,
    /// Port to listen on; zero picks an ephemeral port
    pub port: u16,
    /// Always create a fresh socket on an ephemeral port
    pub ephemeral: bool,
    /// Route traffic through secure sessions
    pub secure: bool,
    /// Real transport endpoint rather than a virtual one
    pub real: bool,
    /// Disable link-layer security
    pub bypass_link_security: bool,
    /// Join the CoAP multicast groups
    pub multicast_join: bool,
    /// Bind to this interface
    pub interface: Option<InterfaceId>,
    /// Handshake timeouts for sessions on this socket
    pub handshake_timeouts: HandshakeTimeouts,
}

/// One multiplexed socket
#[derive(Debug)]
pub struct Socket {
    pub(crate) id: SocketId,
    pub(crate) owner: ServiceId,
    pub(crate) listen_port: u16,
    pub(crate) ephemeral: bool,
    pub(crate) secure: bool,
    pub(crate) real: bool,
    pub(crate) bypass_link_security: bool,
    pub(crate) interface: Option<InterfaceId>,
    pub(crate) handle: Option<TransportHandle>,
    pub(crate) ref_count: u32,
    pub(crate) pending: Option<Vec<u8>>,
    pub(crate) multicast_member: bool,
    pub(crate) handshake_timeouts: HandshakeTimeouts,
}

impl Socket {
    pub(crate) fn new(id: SocketId, spec: &SocketSpec, handle: Option<TransportHandle>) -> Self {
        Self {
            id,
            owner: spec.owner,
            listen_port: spec.port,
            ephemeral: spec.ephemeral,
            secure: spec.secure,
            real: spec.real,
            bypass_link_security: spec.bypass_link_security,
            interface: spec.interface,
            handle,
            ref_count: 1,
            pending: None,
            multicast_member: false,
            handshake_timeouts: spec.handshake_timeouts,
        }
    }

    /// Socket identifier
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Service whose callbacks serve this socket
    pub fn owner(&self) -> ServiceId {
        self.owner
    }

    /// Port the socket listens on (resolved for ephemeral sockets)
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Whether traffic goes through secure sessions
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether this is a real transport endpoint
    pub fn is_real(&self) -> bool {
        self.real
    }

    /// Number of services holding the socket
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether the socket has joined the CoAP multicast groups
    pub fn is_multicast_member(&self) -> bool {
        self.multicast_member
    }

    /// Whether a received datagram is waiting to be consumed
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Transport handle of a real socket
    pub fn transport_handle(&self) -> Option<TransportHandle> {
        self.handle
    }

    /// Interface the socket is bound to
    pub fn interface(&self) -> Option<InterfaceId> {
        self.interface
    }

    /// Handshake timeouts used for new sessions
    pub fn handshake_timeouts(&self) -> HandshakeTimeouts {
        self.handshake_timeouts
    }

    fn shares_with(&self, spec: &SocketSpec) -> bool {
        !self.ephemeral
            && !spec.ephemeral
            && self.listen_port == spec.port
            && self.secure == spec.secure
            && self.real == spec.real
    }
}

/// Linear table of live sockets
#[derive(Debug, Default)]
pub struct SocketTable {
    sockets: Vec<Socket>,
    next_id: u32,
}

impl SocketTable {
    /// Socket a non-ephemeral spec may share
    pub fn find_shareable(&mut self, spec: &SocketSpec) -> Option<&mut Socket> {
        self.sockets.iter_mut().find(|socket| socket.shares_with(spec))
    }

    pub(crate) fn allocate_id(&mut self) -> SocketId {
        self.next_id = self.next_id.wrapping_add(1);
        SocketId::from_raw(self.next_id)
    }

    pub(crate) fn insert(&mut self, socket: Socket) {
        self.sockets.push(socket);
    }

    pub(crate) fn remove(&mut self, id: SocketId) -> Option<Socket> {
        let index = self.sockets.iter().position(|socket| socket.id == id)?;
        Some(self.sockets.remove(index))
    }

    /// Look up a socket
    pub fn get(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.iter().find(|socket| socket.id == id)
    }

    /// Look up a socket mutably
    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut Socket> {
        self.sockets.iter_mut().find(|socket| socket.id == id)
    }

    /// Socket bound to a transport handle
    pub fn by_handle(&mut self, handle: TransportHandle) -> Option<&mut Socket> {
        self.sockets
            .iter_mut()
            .find(|socket| socket.handle == Some(handle))
    }

    /// Number of live sockets
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Whether no socket is open
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Iterate over live sockets
    pub fn iter(&self) -> impl Iterator<Item = &Socket> {
        self.sockets.iter()
    }
}
