//! UDP transport handler
//!
//! One non-blocking `std::net::UdpSocket` per open endpoint, created through
//! `socket2` so the socket can be dual-stack with address reuse before it is
//! bound. `recv` drains every socket until it would block.
//!
//! An interface given at open time becomes the socket's outgoing IPv6
//! multicast interface and the default interface for group membership.
//!
//! The host stack does not expose per-packet destination addresses without
//! ancillary-data syscalls, so received datagrams carry the bound local
//! address as their destination. Source address selection on send is left to
//! the kernel.

use mote_core::effects::{
    Datagram, MulticastAction, OpenOptions, SendMeta, TransportEffects,
};
use mote_core::{InterfaceId, MoteError, Result, TransportHandle};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};
use tracing::{debug, info, warn};

/// Largest datagram read from a socket
pub const MAX_DATAGRAM: usize = 1280;

struct BoundSocket {
    socket: UdpSocket,
    local: SocketAddr,
    interface: Option<u32>,
}

/// Host UDP transport
pub struct UdpTransport {
    bind_address: IpAddr,
    sockets: BTreeMap<TransportHandle, BoundSocket>,
    next_handle: u32,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("bind_address", &self.bind_address)
            .field(
                "sockets",
                &self
                    .sockets
                    .iter()
                    .map(|(handle, bound)| (*handle, bound.local))
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTransport {
    /// Dual-stack transport bound to the IPv6 wildcard address
    pub fn new() -> Self {
        Self::with_bind_address(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
    }

    /// Transport binding every socket to `bind_address`
    pub fn with_bind_address(bind_address: IpAddr) -> Self {
        Self {
            bind_address,
            sockets: BTreeMap::new(),
            next_handle: 0,
            buffer: vec![0; MAX_DATAGRAM],
        }
    }

    /// Local address of an open endpoint
    pub fn local_addr(&self, handle: TransportHandle) -> Option<SocketAddr> {
        self.sockets.get(&handle).map(|bound| bound.local)
    }

    /// Interface index an open endpoint is tied to
    pub fn interface(&self, handle: TransportHandle) -> Option<u32> {
        self.sockets.get(&handle).and_then(|bound| bound.interface)
    }

    fn bind(&self, options: &OpenOptions, interface: Option<u32>) -> std::io::Result<UdpSocket> {
        let domain = match self.bind_address {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if domain == Domain::IPV6 {
            socket.set_only_v6(false)?;
        }
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        if let Some(index) = interface {
            if domain == Domain::IPV6 {
                socket.set_multicast_if_v6(index)?;
            } else {
                debug!(interface = index, "IPv4 sockets keep the default multicast interface");
            }
        }
        socket.bind(&SocketAddr::new(self.bind_address, options.port).into())?;
        Ok(socket.into())
    }

    fn socket(&self, handle: TransportHandle) -> Result<&BoundSocket> {
        self.sockets
            .get(&handle)
            .ok_or_else(|| MoteError::transport(format!("{handle} is not open")))
    }
}

impl TransportEffects for UdpTransport {
    fn open(&mut self, options: OpenOptions) -> Result<TransportHandle> {
        let interface = options
            .interface
            .and_then(|index| u32::try_from(index).ok())
            .filter(|index| *index > 0);
        let socket = self.bind(&options, interface).map_err(|error| {
            MoteError::transport(format!(
                "cannot bind {}:{}: {error}",
                self.bind_address, options.port
            ))
        })?;
        let local = socket.local_addr()?;

        if options.bypass_link_security {
            debug!(local = %local, "Link-layer security bypass has no effect on host sockets");
        }

        self.next_handle = self.next_handle.wrapping_add(1);
        let handle = TransportHandle::from_raw(self.next_handle);
        self.sockets.insert(handle, BoundSocket { socket, local, interface });
        info!(handle = %handle, local = %local, interface = ?interface, "UDP socket bound");
        Ok(handle)
    }

    fn local_port(&self, handle: TransportHandle) -> Option<u16> {
        self.local_addr(handle).map(|local| local.port())
    }

    fn close(&mut self, handle: TransportHandle) {
        if let Some(bound) = self.sockets.remove(&handle) {
            info!(handle = %handle, local = %bound.local, "UDP socket closed");
        }
    }

    fn send_to(
        &mut self,
        handle: TransportHandle,
        destination: SocketAddr,
        meta: &SendMeta,
        payload: &[u8],
    ) -> Result<usize> {
        let bound = self.socket(handle)?;
        if let Some(source) = meta.source {
            debug!(handle = %handle, source = %source, "Source address left to the kernel");
        }
        bound
            .socket
            .send_to(payload, destination)
            .map_err(|error| MoteError::transport(format!("send to {destination} failed: {error}")))
    }

    fn recv(&mut self) -> Vec<Datagram> {
        let mut received = Vec::new();
        for (handle, bound) in &self.sockets {
            loop {
                match bound.socket.recv_from(&mut self.buffer) {
                    Ok((len, source)) => received.push(Datagram {
                        handle: *handle,
                        source,
                        destination: Some(bound.local.ip()),
                        payload: self.buffer[..len].to_vec(),
                    }),
                    Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                    Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                    Err(error) => {
                        warn!(handle = %handle, error = %error, "UDP receive failed");
                        break;
                    }
                }
            }
        }
        received
    }

    fn set_multicast_membership(
        &mut self,
        handle: TransportHandle,
        action: MulticastAction,
        group: Ipv6Addr,
        interface: InterfaceId,
    ) -> Result<()> {
        let bound = self.socket(handle)?;
        let index = u32::try_from(interface)
            .ok()
            .filter(|index| *index > 0)
            .or(bound.interface)
            .unwrap_or(0);
        let result = match action {
            MulticastAction::Join => bound.socket.join_multicast_v6(&group, index),
            MulticastAction::Leave => bound.socket.leave_multicast_v6(&group, index),
        };
        result.map_err(|error| {
            MoteError::transport(format!("multicast {action:?} {group} failed: {error}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    fn loopback() -> UdpTransport {
        UdpTransport::with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn recv_within(transport: &mut UdpTransport, timeout: Duration) -> Vec<Datagram> {
        let deadline = Instant::now() + timeout;
        loop {
            let received = transport.recv();
            if !received.is_empty() || Instant::now() >= deadline {
                return received;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_ephemeral_bind_reports_port() {
        let mut transport = loopback();
        let handle = transport.open(OpenOptions::default()).unwrap();
        assert_ne!(transport.local_port(handle), Some(0));
        transport.close(handle);
        assert!(transport.local_port(handle).is_none());
    }

    #[test]
    fn test_loopback_datagram() {
        let mut sender = loopback();
        let mut receiver = loopback();
        let tx = sender.open(OpenOptions::default()).unwrap();
        let rx = receiver.open(OpenOptions::default()).unwrap();
        let target = receiver.local_addr(rx).unwrap();

        let sent = sender
            .send_to(tx, target, &SendMeta::default(), b"ping")
            .unwrap();
        assert_eq!(sent, 4);

        let received = recv_within(&mut receiver, Duration::from_secs(2));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].handle, rx);
        assert_eq!(received[0].payload, b"ping");
        assert_eq!(received[0].source, sender.local_addr(tx).unwrap());
        assert_eq!(received[0].destination, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_interface_selects_multicast_interface() {
        if UdpSocket::bind("[::1]:0").is_err() {
            return;
        }
        let mut transport = UdpTransport::with_bind_address(IpAddr::V6(Ipv6Addr::LOCALHOST));
        let handle = transport
            .open(OpenOptions {
                interface: Some(1),
                ..OpenOptions::default()
            })
            .unwrap();
        assert_eq!(transport.interface(handle), Some(1));
        let bound = transport.socket(handle).unwrap();
        assert_eq!(socket2::SockRef::from(&bound.socket).multicast_if_v6().unwrap(), 1);

        let unbound = transport.open(OpenOptions::default()).unwrap();
        assert_eq!(transport.interface(unbound), None);
    }

    #[test]
    fn test_send_on_closed_handle_fails() {
        let mut transport = loopback();
        let result = transport.send_to(
            TransportHandle::from_raw(42),
            "127.0.0.1:9".parse().unwrap(),
            &SendMeta::default(),
            b"x",
        );
        assert_matches!(result, Err(MoteError::Transport { .. }));
    }
}
