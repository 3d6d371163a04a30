//! Socket / connection multiplexer
//!
//! Owns the transport, scheduler and handshake engine collaborators together
//! with the socket and session tables. Services open sockets through it, send
//! datagrams through it and feed it everything the transport receives.
//!
//! Outbound routing:
//! - unsecured real socket: straight to the transport, with the selected source
//!   address as ancillary data
//! - unsecured virtual socket: the owning service's virtual send callback
//! - secured socket: through the peer's session, starting a client handshake
//!   when none exists yet (the caller keeps the payload until the channel is up)
//!
//! Inbound datagrams become `TransportEvent`s; the caller drains them after
//! every operation.

use crate::events::TransportEvent;
use crate::io::SessionIo;
use crate::session::{SecureSession, SessionManager, SessionState};
use crate::socket::{Socket, SocketSpec, SocketTable};
use crate::timer::TimerFiring;
use crate::COAP_MULTICAST_GROUPS;
use mote_core::effects::transport::UNKNOWN_DESTINATION;
use mote_core::effects::{
    Credentials, Datagram, HandshakeEngine, HandshakeIo, HandshakeParams, HandshakeRole,
    HandshakeSession, HandshakeStatus, MulticastAction, OpenOptions, ReadOutcome,
    SchedulerEffects, SendMeta, TransportEffects,
};
use mote_core::{
    HandshakeTimeouts, MoteError, Result, ServiceId, SessionConfig, SocketId, Tick, TimerId,
};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use tracing::{debug, info, warn};

/// Per-service hooks the multiplexer needs but does not own
pub trait SocketCallbacks {
    /// Deliver an outbound datagram through a virtual socket
    fn virtual_send(&mut self, owner: ServiceId, peer: SocketAddr, data: &[u8]) -> Result<()>;

    /// Credentials for a handshake with `peer`
    fn credentials(&mut self, owner: ServiceId, peer: SocketAddr) -> Option<Credentials>;
}

/// Result of an outbound send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Bytes handed to the transport (or the virtual sink)
    Sent(usize),
    /// No secure channel yet; a handshake is running and the caller keeps the payload
    HandshakePending,
}

/// One outbound datagram
#[derive(Debug, Clone, Copy)]
pub struct OutboundDatagram<'a> {
    /// Socket to send through
    pub socket: SocketId,
    /// Remote peer
    pub destination: SocketAddr,
    /// CoAP bytes
    pub payload: &'a [u8],
    /// Source address metadata
    pub meta: SendMeta,
    /// Send in plaintext even on a secure socket
    pub bypass_security: bool,
}

/// Socket multiplexer and secure session owner
pub struct Multiplexer {
    sockets: SocketTable,
    sessions: SessionManager,
    transport: Box<dyn TransportEffects>,
    scheduler: Box<dyn SchedulerEffects>,
    engine: Box<dyn HandshakeEngine>,
    events: VecDeque<TransportEvent>,
    now: Tick,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("sockets", &self.sockets)
            .field("sessions", &self.sessions)
            .field("events", &self.events.len())
            .field("now", &self.now)
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Create a multiplexer over the given collaborators
    pub fn new(
        transport: Box<dyn TransportEffects>,
        scheduler: Box<dyn SchedulerEffects>,
        engine: Box<dyn HandshakeEngine>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            sockets: SocketTable::default(),
            sessions: SessionManager::new(config),
            transport,
            scheduler,
            engine,
            events: VecDeque::new(),
            now: 0,
        }
    }

    /// Open or share a socket
    pub fn open(&mut self, mut spec: SocketSpec) -> Result<SocketId> {
        spec.ephemeral |= spec.port == 0;

        if !spec.ephemeral {
            if let Some(socket) = self.sockets.find_shareable(&spec) {
                socket.ref_count += 1;
                if spec.multicast_join && socket.real && !socket.multicast_member {
                    join_multicast(self.transport.as_mut(), socket);
                }
                debug!(
                    socket = %socket.id,
                    port = socket.listen_port,
                    ref_count = socket.ref_count,
                    "Sharing socket"
                );
                return Ok(socket.id);
            }
        }

        let handle = if spec.real {
            let options = OpenOptions {
                port: if spec.ephemeral { 0 } else { spec.port },
                interface: spec.interface,
                bypass_link_security: spec.bypass_link_security,
            };
            Some(self.transport.open(options)?)
        } else {
            None
        };

        let id = self.sockets.allocate_id();
        let mut socket = Socket::new(id, &spec, handle);
        if let Some(port) = handle.and_then(|handle| self.transport.local_port(handle)) {
            socket.listen_port = port;
        }
        if spec.multicast_join && spec.real {
            join_multicast(self.transport.as_mut(), &mut socket);
        }

        info!(
            socket = %id,
            port = socket.listen_port,
            secure = socket.secure,
            real = socket.real,
            owner = %socket.owner,
            "Socket opened"
        );
        self.sockets.insert(socket);
        Ok(id)
    }

    /// Release one reference; tears the socket down at zero.
    ///
    /// Returns the remaining reference count.
    pub fn close(&mut self, id: SocketId, callbacks: &mut dyn SocketCallbacks) -> Result<u32> {
        let socket = self
            .sockets
            .get_mut(id)
            .ok_or_else(|| MoteError::not_found(format!("socket {id}")))?;

        socket.ref_count = socket.ref_count.saturating_sub(1);
        if socket.ref_count > 0 {
            debug!(socket = %id, ref_count = socket.ref_count, "Socket reference released");
            return Ok(socket.ref_count);
        }

        self.teardown(id, callbacks);
        Ok(0)
    }

    /// Sessions, then multicast membership, then buffers, then the transport
    fn teardown(&mut self, id: SocketId, callbacks: &mut dyn SocketCallbacks) {
        for session in self.sessions.drain_socket(id) {
            self.retire(session, callbacks);
        }

        let Some(mut socket) = self.sockets.remove(id) else {
            return;
        };

        if socket.multicast_member {
            if let Some(handle) = socket.handle {
                let interface = socket.interface.unwrap_or_default();
                for group in COAP_MULTICAST_GROUPS {
                    if let Err(error) = self.transport.set_multicast_membership(
                        handle,
                        MulticastAction::Leave,
                        group,
                        interface,
                    ) {
                        warn!(socket = %id, group = %group, error = %error, "Failed to leave multicast group");
                    }
                }
            }
            socket.multicast_member = false;
        }

        socket.pending = None;

        if let Some(handle) = socket.handle.take() {
            self.transport.close(handle);
        }

        info!(socket = %id, port = socket.listen_port, "Socket closed");
    }

    /// Hand the socket's callbacks to another service
    pub fn set_owner(&mut self, id: SocketId, owner: ServiceId) -> Result<()> {
        let socket = self
            .sockets
            .get_mut(id)
            .ok_or_else(|| MoteError::not_found(format!("socket {id}")))?;
        socket.owner = owner;
        Ok(())
    }

    /// Send one datagram
    pub fn send(
        &mut self,
        out: OutboundDatagram<'_>,
        callbacks: &mut dyn SocketCallbacks,
    ) -> Result<SendOutcome> {
        let socket = self
            .sockets
            .get_mut(out.socket)
            .ok_or_else(|| MoteError::not_found(format!("socket {}", out.socket)))?;

        if !socket.secure || out.bypass_security {
            if !socket.real {
                callbacks.virtual_send(socket.owner, out.destination, out.payload)?;
                return Ok(SendOutcome::Sent(out.payload.len()));
            }
            let handle = socket.handle.ok_or_else(|| {
                MoteError::internal(format!("socket {} has no transport handle", socket.id))
            })?;
            let sent = self
                .transport
                .send_to(handle, out.destination, &out.meta, out.payload)?;
            return Ok(SendOutcome::Sent(sent));
        }

        let state = self
            .sessions
            .find(out.socket, out.destination)
            .map(SecureSession::state);

        match state {
            Some(SessionState::Ok) => {
                let now = self.now;
                let sent = self.drive(out.socket, out.destination, callbacks, |session, io| {
                    session.send_message(io, out.payload)
                })??;
                if let Some(session) = self.sessions.find_mut(out.socket, out.destination) {
                    session.touch(now);
                }
                Ok(SendOutcome::Sent(sent))
            }
            Some(SessionState::HandshakeOngoing) => Ok(SendOutcome::HandshakePending),
            Some(SessionState::Closed) | None => {
                if let Some(closed) = self.sessions.remove(out.socket, out.destination) {
                    self.retire(closed, callbacks);
                }
                let status = self.start_session(
                    out.socket,
                    out.destination,
                    out.meta.source,
                    HandshakeRole::Client,
                    callbacks,
                )?;
                match status {
                    HandshakeStatus::Established => {
                        let sent = self.drive(out.socket, out.destination, callbacks, |session, io| {
                            session.send_message(io, out.payload)
                        })??;
                        Ok(SendOutcome::Sent(sent))
                    }
                    HandshakeStatus::WouldBlock => Ok(SendOutcome::HandshakePending),
                    HandshakeStatus::Failed { reason } => Err(MoteError::handshake(reason)),
                }
            }
        }
    }

    /// Drain the transport and process everything it received
    pub fn poll(&mut self, callbacks: &mut dyn SocketCallbacks) {
        for datagram in self.transport.recv() {
            self.receive(datagram, callbacks);
        }
    }

    /// Process one datagram from a real socket
    pub fn receive(&mut self, datagram: Datagram, callbacks: &mut dyn SocketCallbacks) {
        let Some(socket) = self.sockets.by_handle(datagram.handle) else {
            debug!(handle = %datagram.handle, "Dropping datagram for unknown transport handle");
            return;
        };
        let socket_id = socket.id;

        let local = match datagram.destination {
            Some(IpAddr::V6(addr)) if addr == UNKNOWN_DESTINATION => None,
            other => other,
        };
        let Some(local) = local else {
            debug!(
                socket = %socket_id,
                peer = %datagram.source,
                "Dropping datagram without destination metadata"
            );
            return;
        };

        self.deliver(socket_id, datagram.source, local, datagram.payload, callbacks);
    }

    /// Process one datagram handed in by the application for a virtual socket
    pub fn virtual_receive(
        &mut self,
        id: SocketId,
        peer: SocketAddr,
        data: Vec<u8>,
        callbacks: &mut dyn SocketCallbacks,
    ) -> Result<()> {
        let socket = self
            .sockets
            .get(id)
            .ok_or_else(|| MoteError::not_found(format!("socket {id}")))?;
        if socket.real {
            return Err(MoteError::invalid(format!("socket {id} is not virtual")));
        }
        self.deliver(id, peer, IpAddr::V6(Ipv6Addr::UNSPECIFIED), data, callbacks);
        Ok(())
    }

    fn deliver(
        &mut self,
        socket_id: SocketId,
        peer: SocketAddr,
        local: IpAddr,
        payload: Vec<u8>,
        callbacks: &mut dyn SocketCallbacks,
    ) {
        let Some(socket) = self.sockets.get_mut(socket_id) else {
            return;
        };

        if !socket.secure {
            self.events.push_back(TransportEvent::Received {
                socket: socket_id,
                peer,
                local,
                data: payload,
            });
            return;
        }

        if local.is_multicast() {
            debug!(socket = %socket_id, peer = %peer, "Dropping multicast datagram on secure socket");
            return;
        }

        socket.pending = Some(payload);

        let now = self.now;
        let state = self.sessions.find_mut(socket_id, peer).map(|session| {
            session.touch(now);
            session.state
        });

        match state {
            Some(SessionState::Ok) => self.read_session(socket_id, peer, local, callbacks),
            Some(SessionState::HandshakeOngoing) => {
                let status = self.drive(socket_id, peer, callbacks, |session, io| {
                    session.continue_connecting(io)
                });
                if let Ok(status) = status {
                    self.settle(socket_id, peer, status, callbacks);
                }
            }
            Some(SessionState::Closed) | None => {
                if let Some(closed) = self.sessions.remove(socket_id, peer) {
                    debug!(socket = %socket_id, peer = %peer, "Replacing closed session");
                    self.retire(closed, callbacks);
                }
                if let Err(error) = self.start_session(
                    socket_id,
                    peer,
                    Some(local),
                    HandshakeRole::Server,
                    callbacks,
                ) {
                    warn!(socket = %socket_id, peer = %peer, error = %error, "Rejecting secure session");
                }
            }
        }

        if let Some(socket) = self.sockets.get_mut(socket_id) {
            socket.pending = None;
        }
    }

    fn read_session(
        &mut self,
        socket_id: SocketId,
        peer: SocketAddr,
        local: IpAddr,
        callbacks: &mut dyn SocketCallbacks,
    ) {
        let outcome = match self.drive(socket_id, peer, callbacks, |session, io| session.read(io)) {
            Ok(outcome) => outcome,
            Err(_) => return,
        };

        match outcome {
            ReadOutcome::Data(data) => self.events.push_back(TransportEvent::Received {
                socket: socket_id,
                peer,
                local,
                data,
            }),
            ReadOutcome::WouldBlock => {}
            ReadOutcome::PeerClosed => {
                info!(socket = %socket_id, peer = %peer, "Peer closed secure session");
                self.mark_closed(socket_id, peer);
            }
            ReadOutcome::Failed { reason } => {
                warn!(socket = %socket_id, peer = %peer, reason = %reason, "Dropping undecryptable record");
            }
        }
    }

    /// Admit, create, register and start a session
    fn start_session(
        &mut self,
        socket_id: SocketId,
        peer: SocketAddr,
        local: Option<IpAddr>,
        role: HandshakeRole,
        callbacks: &mut dyn SocketCallbacks,
    ) -> Result<HandshakeStatus> {
        let socket = self
            .sockets
            .get(socket_id)
            .ok_or_else(|| MoteError::not_found(format!("socket {socket_id}")))?;
        let timeouts = socket.handshake_timeouts;
        let credentials = callbacks
            .credentials(socket.owner, peer)
            .ok_or_else(|| MoteError::handshake(format!("no credentials for {peer}")))?;

        if let Some(evicted) = self.sessions.admit()? {
            info!(
                socket = %evicted.socket,
                peer = %evicted.peer,
                last_contact = evicted.last_contact,
                "Evicting closed session"
            );
            self.retire(evicted, callbacks);
        }

        let timer_id = self.sessions.allocate_timer_id()?;
        let handle = self.engine.create(HandshakeParams {
            timer_id,
            peer,
            role,
        })?;
        self.sessions.insert(SecureSession::new(
            handle, socket_id, peer, local, timer_id, role, self.now,
        ));

        info!(
            socket = %socket_id,
            peer = %peer,
            timer_id = %timer_id,
            role = ?role,
            "Secure session created"
        );

        let status = self.drive(socket_id, peer, callbacks, |session, io| {
            session.connect(io, &credentials, timeouts)
        })?;
        Ok(self.settle(socket_id, peer, status, callbacks))
    }

    /// Apply a handshake step result to the session
    fn settle(
        &mut self,
        socket_id: SocketId,
        peer: SocketAddr,
        status: HandshakeStatus,
        callbacks: &mut dyn SocketCallbacks,
    ) -> HandshakeStatus {
        match &status {
            HandshakeStatus::Established => self.establish(socket_id, peer),
            HandshakeStatus::WouldBlock => {}
            HandshakeStatus::Failed { reason } => {
                warn!(socket = %socket_id, peer = %peer, reason = %reason, "Handshake failed");
                if let Some(session) = self.sessions.remove(socket_id, peer) {
                    self.retire(session, callbacks);
                }
            }
        }
        status
    }

    fn establish(&mut self, socket_id: SocketId, peer: SocketAddr) {
        let Some(session) = self.sessions.find_mut(socket_id, peer) else {
            return;
        };
        if let Err(error) = session.transition(SessionState::Ok) {
            debug!(error = %error, "Ignoring repeated establishment");
            return;
        }
        if session.timer.is_armed() {
            session.timer.cancel();
            self.scheduler.cancel_timer(session.timer_id);
        }
        let keyblock = session.handle.keyblock().unwrap_or_default();

        info!(socket = %socket_id, peer = %peer, "Secure session established");
        if let Some(owner) = self.sockets.get(socket_id).map(Socket::owner) {
            self.events.push_back(TransportEvent::SecurityEstablished {
                socket: socket_id,
                owner,
                peer,
                keyblock,
            });
        }
    }

    /// Deliver a host timer expiry
    pub fn on_timer(&mut self, timer_id: TimerId, callbacks: &mut dyn SocketCallbacks) {
        let Some(session) = self.sessions.by_timer(timer_id) else {
            debug!(timer_id = %timer_id, "Timer for unknown session");
            return;
        };
        let firing = session.timer.fire();
        let (socket_id, peer, state) = (session.socket, session.peer, session.state);

        match firing {
            TimerFiring::Stale => return,
            TimerFiring::Intermediate { rearm_ms } => {
                if let Err(error) = self.scheduler.request_timer(timer_id, rearm_ms) {
                    warn!(timer_id = %timer_id, error = %error, "Failed to re-arm handshake timer");
                }
            }
            TimerFiring::Final => {
                debug!(socket = %socket_id, peer = %peer, "Handshake timer final expiry");
            }
        }

        if state != SessionState::HandshakeOngoing {
            return;
        }

        let Ok(mut status) = self.drive(socket_id, peer, callbacks, |session, io| {
            session.continue_connecting(io)
        }) else {
            return;
        };
        if firing == TimerFiring::Final && status == HandshakeStatus::WouldBlock {
            status = HandshakeStatus::Failed {
                reason: "handshake timed out".to_string(),
            };
        }
        self.settle(socket_id, peer, status, callbacks);
    }

    /// Reclaim sessions whose inactivity budget ran out
    pub fn exec(&mut self, now: Tick, callbacks: &mut dyn SocketCallbacks) {
        self.now = self.now.max(now);
        for session in self.sessions.sweep(self.now) {
            info!(
                socket = %session.socket,
                peer = %session.peer,
                state = %session.state,
                last_contact = session.last_contact,
                "Secure session timed out"
            );
            self.retire(session, callbacks);
        }
    }

    /// Close one peer's channel, keeping the session for LRU reclamation
    pub fn close_secure_connection(
        &mut self,
        socket_id: SocketId,
        peer: SocketAddr,
        callbacks: &mut dyn SocketCallbacks,
    ) -> Result<()> {
        let session = self
            .sessions
            .find(socket_id, peer)
            .ok_or_else(|| MoteError::not_found(format!("session for {peer} on {socket_id}")))?;
        if session.state == SessionState::Closed {
            return Ok(());
        }
        if session.state == SessionState::Ok && session.handle.is_started() {
            self.drive(socket_id, peer, callbacks, |session, io| {
                session.send_close_alert(io)
            })?;
        }
        info!(socket = %socket_id, peer = %peer, "Secure session closed");
        self.mark_closed(socket_id, peer);
        Ok(())
    }

    fn mark_closed(&mut self, socket_id: SocketId, peer: SocketAddr) {
        let Some(session) = self.sessions.find_mut(socket_id, peer) else {
            return;
        };
        if session.transition(SessionState::Closed).is_err() {
            return;
        }
        if session.timer.is_armed() {
            session.timer.cancel();
            self.scheduler.cancel_timer(session.timer_id);
        }
        self.events
            .push_back(TransportEvent::SessionTerminated { socket: socket_id, peer });
    }

    /// Final teardown of a session removed from the table
    fn retire(&mut self, mut session: SecureSession, callbacks: &mut dyn SocketCallbacks) {
        let was_open = session.state != SessionState::Closed;

        if session.state == SessionState::Ok && session.handle.is_started() {
            if let Some(socket) = self.sockets.get_mut(session.socket) {
                let mut io = SessionIo {
                    transport: self.transport.as_mut(),
                    scheduler: self.scheduler.as_mut(),
                    callbacks,
                    socket,
                    timer: &mut session.timer,
                    timer_id: session.timer_id,
                    peer: session.peer,
                    local: session.local,
                };
                session.handle.send_close_alert(&mut io);
            }
        }

        if session.timer.is_armed() {
            session.timer.cancel();
            self.scheduler.cancel_timer(session.timer_id);
        }

        if was_open {
            self.events.push_back(TransportEvent::SessionTerminated {
                socket: session.socket,
                peer: session.peer,
            });
        }

        debug!(
            socket = %session.socket,
            peer = %session.peer,
            timer_id = %session.timer_id,
            "Secure session destroyed"
        );
    }

    /// Run one handshake engine call with the session's I/O bound in
    fn drive<R>(
        &mut self,
        socket_id: SocketId,
        peer: SocketAddr,
        callbacks: &mut dyn SocketCallbacks,
        step: impl FnOnce(&mut dyn HandshakeSession, &mut dyn HandshakeIo) -> R,
    ) -> Result<R> {
        let socket = self
            .sockets
            .get_mut(socket_id)
            .ok_or_else(|| MoteError::not_found(format!("socket {socket_id}")))?;
        let session = self
            .sessions
            .find_mut(socket_id, peer)
            .ok_or_else(|| MoteError::not_found(format!("session for {peer} on {socket_id}")))?;

        let mut io = SessionIo {
            transport: self.transport.as_mut(),
            scheduler: self.scheduler.as_mut(),
            callbacks,
            socket,
            timer: &mut session.timer,
            timer_id: session.timer_id,
            peer,
            local: session.local,
        };
        Ok(step(session.handle.as_mut(), &mut io))
    }

    /// Set the handshake timeouts used for new sessions on a socket
    pub fn set_handshake_timeouts(&mut self, id: SocketId, timeouts: HandshakeTimeouts) -> Result<()> {
        timeouts.validate()?;
        let socket = self
            .sockets
            .get_mut(id)
            .ok_or_else(|| MoteError::not_found(format!("socket {id}")))?;
        socket.handshake_timeouts = timeouts;
        Ok(())
    }

    /// Change session admission limits
    pub fn set_handshake_limits(&mut self, max_handshakes: u8, max_sessions: u8) -> Result<()> {
        self.sessions.set_limits(max_handshakes, max_sessions)?;
        info!(max_handshakes, max_sessions, "Handshake limits updated");
        Ok(())
    }

    /// Next queued event
    pub fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    /// All queued events
    pub fn drain_events(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }

    /// Look up a socket
    pub fn socket(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.get(id)
    }

    /// Socket table
    pub fn sockets(&self) -> &SocketTable {
        &self.sockets
    }

    /// Session table
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// State of the session for a peer on a socket
    pub fn session_state(&self, id: SocketId, peer: SocketAddr) -> Option<SessionState> {
        self.sessions.find(id, peer).map(SecureSession::state)
    }

    /// Latest tick seen by `exec`
    pub fn now(&self) -> Tick {
        self.now
    }
}

fn join_multicast(transport: &mut dyn TransportEffects, socket: &mut Socket) {
    let Some(handle) = socket.handle else {
        return;
    };
    let interface = socket.interface.unwrap_or_default();
    for group in COAP_MULTICAST_GROUPS {
        match transport.set_multicast_membership(handle, MulticastAction::Join, group, interface) {
            Ok(()) => socket.multicast_member = true,
            Err(error) => {
                warn!(socket = %socket.id, group = %group, error = %error, "Failed to join multicast group");
            }
        }
    }
}
