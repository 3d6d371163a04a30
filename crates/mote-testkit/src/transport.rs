//! Mock UDP transport
//!
//! Records every open, send, close and multicast membership change. Tests
//! inject inbound datagrams with `inject` and the engine picks them up through
//! `TransportEffects::recv`.

use mote_core::effects::{
    Datagram, MulticastAction, OpenOptions, SendMeta, TransportEffects,
};
use mote_core::{InterfaceId, MoteError, Result, TransportHandle};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

/// First port handed out for ephemeral binds
pub const EPHEMERAL_PORT_BASE: u16 = 49152;

/// One datagram the engine sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    /// Endpoint used
    pub handle: TransportHandle,
    /// Peer
    pub destination: SocketAddr,
    /// Send metadata
    pub meta: SendMeta,
    /// Bytes
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct TransportState {
    next_handle: u32,
    next_ephemeral: u16,
    open: BTreeMap<TransportHandle, u16>,
    opened: Vec<OpenOptions>,
    closed: Vec<TransportHandle>,
    sent: Vec<SentDatagram>,
    inbound: VecDeque<Datagram>,
    memberships: Vec<(TransportHandle, MulticastAction, Ipv6Addr, InterfaceId)>,
    fail_sends: bool,
    fail_opens: bool,
    fail_multicast: bool,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            next_handle: 0,
            next_ephemeral: EPHEMERAL_PORT_BASE,
            open: BTreeMap::new(),
            opened: Vec::new(),
            closed: Vec::new(),
            sent: Vec::new(),
            inbound: VecDeque::new(),
            memberships: Vec::new(),
            fail_sends: false,
            fail_opens: false,
            fail_multicast: false,
        }
    }
}

/// Mock transport handler; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    /// Transport with no endpoints
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a datagram for the endpoint bound to `port`
    pub fn inject(&self, port: u16, source: SocketAddr, destination: Option<IpAddr>, payload: Vec<u8>) {
        let mut state = self.state.lock();
        let handle = state
            .open
            .iter()
            .find(|(_, bound)| **bound == port)
            .map(|(handle, _)| *handle)
            .expect("no endpoint bound to port");
        state.inbound.push_back(Datagram {
            handle,
            source,
            destination,
            payload,
        });
    }

    /// Make subsequent sends fail
    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    /// Make subsequent opens fail
    pub fn fail_opens(&self, fail: bool) {
        self.state.lock().fail_opens = fail;
    }

    /// Make multicast membership changes fail
    pub fn fail_multicast(&self, fail: bool) {
        self.state.lock().fail_multicast = fail;
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.state.lock().sent.clone()
    }

    /// Take and clear the sent log
    pub fn take_sent(&self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Options of every successful open
    pub fn opened(&self) -> Vec<OpenOptions> {
        self.state.lock().opened.clone()
    }

    /// Handles closed so far
    pub fn closed(&self) -> Vec<TransportHandle> {
        self.state.lock().closed.clone()
    }

    /// Number of endpoints currently open
    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Multicast membership changes
    pub fn memberships(&self) -> Vec<(TransportHandle, MulticastAction, Ipv6Addr, InterfaceId)> {
        self.state.lock().memberships.clone()
    }
}

impl TransportEffects for MockTransport {
    fn open(&mut self, options: OpenOptions) -> Result<TransportHandle> {
        let mut state = self.state.lock();
        if state.fail_opens {
            return Err(MoteError::transport("mock open failure"));
        }
        let port = if options.port == 0 {
            let port = state.next_ephemeral;
            state.next_ephemeral = state.next_ephemeral.wrapping_add(1);
            port
        } else {
            if state.open.values().any(|bound| *bound == options.port) {
                return Err(MoteError::transport(format!(
                    "port {} already bound",
                    options.port
                )));
            }
            options.port
        };
        state.next_handle += 1;
        let handle = TransportHandle::from_raw(state.next_handle);
        state.open.insert(handle, port);
        state.opened.push(options);
        Ok(handle)
    }

    fn local_port(&self, handle: TransportHandle) -> Option<u16> {
        self.state.lock().open.get(&handle).copied()
    }

    fn close(&mut self, handle: TransportHandle) {
        let mut state = self.state.lock();
        state.open.remove(&handle);
        state.closed.push(handle);
    }

    fn send_to(
        &mut self,
        handle: TransportHandle,
        destination: SocketAddr,
        meta: &SendMeta,
        payload: &[u8],
    ) -> Result<usize> {
        let mut state = self.state.lock();
        if state.fail_sends {
            return Err(MoteError::transport("mock send failure"));
        }
        if !state.open.contains_key(&handle) {
            return Err(MoteError::transport(format!("{handle} is not open")));
        }
        state.sent.push(SentDatagram {
            handle,
            destination,
            meta: *meta,
            payload: payload.to_vec(),
        });
        Ok(payload.len())
    }

    fn recv(&mut self) -> Vec<Datagram> {
        self.state.lock().inbound.drain(..).collect()
    }

    fn set_multicast_membership(
        &mut self,
        handle: TransportHandle,
        action: MulticastAction,
        group: Ipv6Addr,
        interface: InterfaceId,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_multicast {
            return Err(MoteError::transport("mock multicast failure"));
        }
        state.memberships.push((handle, action, group, interface));
        Ok(())
    }
}
