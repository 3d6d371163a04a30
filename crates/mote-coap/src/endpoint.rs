//! Endpoint context
//!
//! The one object a host creates at startup and drives from its event loop.
//! It owns the service registry, the socket multiplexer and the transaction
//! manager and exposes the public API. Every call runs to completion; after
//! anything that can produce transport events the endpoint drains them:
//!
//! - `Received` goes through the transaction manager and, for requests, the
//!   router
//! - `SecurityEstablished` flushes retained messages toward the peer and
//!   notifies the owning service's security handler
//! - `SessionTerminated` cancels every transaction toward the peer
//!
//! The transaction manager is created when the first service initializes.
//! Failing to create it is the one fatal condition of the engine.

use crate::handlers::{
    InboundRequest, MessagePrevalidator, PrevalidateContext, RequestDisposition, RequestHandler,
    Response, ResponseCallback, SecurityHandler, VirtualSocketSink,
};
use crate::registry::{Service, ServiceCallbacks, ServiceRegistry};
use crate::router::{self, Route};
use crate::transaction::{Inbound, OutboundRequest, TransactionManager, Transmitter, Via};
use mote_core::effects::{CodecEffects, EffectHandlers, RandomEffects, SendMeta};
use mote_core::{
    CoapMessage, EngineConfig, HandshakeTimeouts, InterfaceId, MessageId, MessageType, MethodMask,
    MoteError, RequestOptions, Result, ServiceId, ServiceOptions, SocketId, Tick, TimerId,
};
use mote_transport::{Multiplexer, OutboundDatagram, SendOutcome, SessionState, SocketSpec, TransportEvent};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, error, info, warn};

/// Outbound path lent to the transaction manager
struct Link<'a> {
    mux: &'a mut Multiplexer,
    registry: &'a mut ServiceRegistry,
}

impl Transmitter for Link<'_> {
    fn transmit(
        &mut self,
        via: Via,
        destination: SocketAddr,
        payload: &[u8],
        source: Option<IpAddr>,
        options: RequestOptions,
    ) -> Result<SendOutcome> {
        let socket = match via {
            Via::Socket(socket) => socket,
            Via::Service(service) => self.registry.get(service)?.socket(),
        };
        let datagram = OutboundDatagram {
            socket,
            destination,
            payload,
            meta: SendMeta {
                source,
                preference: options.address_preference(),
            },
            bypass_security: options.contains(RequestOptions::SECURE_BYPASS),
        };
        self.mux
            .send(datagram, &mut ServiceCallbacks::new(&mut *self.registry))
    }
}

/// CoAP endpoint engine context
pub struct Endpoint {
    config: EngineConfig,
    registry: ServiceRegistry,
    mux: Multiplexer,
    transactions: Option<TransactionManager>,
    pending: Option<(Box<dyn CodecEffects>, Box<dyn RandomEffects>)>,
    prevalidators: BTreeMap<u16, Box<dyn MessagePrevalidator>>,
    now: Tick,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("registry", &self.registry)
            .field("mux", &self.mux)
            .field("transactions", &self.transactions)
            .field("prevalidators", &self.prevalidators.keys().collect::<Vec<_>>())
            .field("now", &self.now)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Assemble an endpoint from validated configuration and collaborators
    pub fn new(config: EngineConfig, effects: EffectHandlers) -> Result<Self> {
        config.validate()?;
        let EffectHandlers {
            codec,
            handshake,
            transport,
            scheduler,
            random,
        } = effects;
        let mux = Multiplexer::new(transport, scheduler, handshake, &config.sessions);

        Ok(Self {
            config,
            registry: ServiceRegistry::new(),
            mux,
            transactions: None,
            pending: Some((codec, random)),
            prevalidators: BTreeMap::new(),
            now: 0,
        })
    }

    /// Configuration the endpoint was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a service and open its socket.
    ///
    /// `MoteError::Fatal` means the transaction manager could not be created
    /// and the endpoint is unusable.
    pub fn initialize(
        &mut self,
        interface: InterfaceId,
        port: u16,
        options: ServiceOptions,
        security: Option<Box<dyn SecurityHandler>>,
    ) -> Result<ServiceId> {
        self.ensure_transactions()?;
        let id = self.registry.allocate_id()?;

        let spec = SocketSpec {
            owner: id,
            port,
            ephemeral: options.contains(ServiceOptions::EPHEMERAL_PORT),
            secure: options.contains(ServiceOptions::SECURE),
            real: !options.contains(ServiceOptions::VIRTUAL_SOCKET),
            bypass_link_security: options.contains(ServiceOptions::BYPASS_LINK_SECURITY),
            multicast_join: options.contains(ServiceOptions::MULTICAST_JOIN),
            interface: options
                .contains(ServiceOptions::SELECT_INTERFACE)
                .then_some(interface),
            handshake_timeouts: self.config.sessions.handshake_timeouts,
        };
        let socket = self.mux.open(spec)?;
        self.registry
            .insert(Service::new(id, interface, port, options, socket, security));

        info!(service = %id, port = port, socket = %socket, options = ?options, "Service initialized");
        Ok(id)
    }

    fn ensure_transactions(&mut self) -> Result<()> {
        if self.transactions.is_some() {
            return Ok(());
        }
        let Some((codec, random)) = self.pending.take() else {
            error!("Transaction manager unavailable");
            return Err(MoteError::fatal("transaction manager unavailable"));
        };
        match TransactionManager::new(codec, random, &self.config.transactions) {
            Ok(transactions) => {
                self.transactions = Some(transactions);
                Ok(())
            }
            Err(error) => {
                error!(error = %error, "Cannot create transaction manager");
                Err(MoteError::fatal(format!(
                    "cannot create transaction manager: {error}"
                )))
            }
        }
    }

    /// Remove a service: its URIs, its transactions and its socket reference
    pub fn delete(&mut self, id: ServiceId) -> Result<()> {
        let socket = {
            let service = self.registry.get_mut(id)?;
            service.clear_uris();
            service.socket()
        };
        if let Some(transactions) = self.transactions.as_mut() {
            transactions.delete_all_for_service(id);
        }
        let port = self.mux.socket(socket).map(|socket| socket.listen_port());

        let remaining = self
            .mux
            .close(socket, &mut ServiceCallbacks::new(&mut self.registry));
        self.registry.remove(id);
        match remaining {
            Ok(count) if count > 0 => {
                if let Some(next) = self.registry.by_socket(socket) {
                    self.mux.set_owner(socket, next)?;
                }
            }
            Ok(_) => {
                if let Some(port) = port {
                    self.forget_prevalidator(port);
                }
            }
            Err(error) => warn!(service = %id, socket = %socket, error = %error, "Socket release failed"),
        }

        self.process_events();
        info!(service = %id, "Service deleted");
        Ok(())
    }

    fn forget_prevalidator(&mut self, port: u16) {
        let still_listening = self.mux.sockets().iter().any(|socket| socket.listen_port() == port);
        if !still_listening && self.prevalidators.remove(&port).is_some() {
            debug!(port = port, "Prevalidation hook removed with its socket");
        }
    }

    /// Register `handler` for `path`, replacing any earlier registration
    pub fn register_uri<H>(&mut self, id: ServiceId, path: &str, methods: MethodMask, handler: H) -> Result<()>
    where
        H: RequestHandler + 'static,
    {
        self.registry
            .get_mut(id)?
            .register_uri(path, methods, Box::new(handler));
        Ok(())
    }

    /// Remove the registration for `path`
    pub fn unregister_uri(&mut self, id: ServiceId, path: &str) -> Result<()> {
        self.registry.get_mut(id)?.unregister_uri(path)
    }

    /// Send a request from service `id`.
    ///
    /// Returns the message id when `callback` is set and the request is
    /// tracked, `0` otherwise. The callback runs exactly once.
    pub fn request_send(
        &mut self,
        id: ServiceId,
        request: OutboundRequest,
        callback: Option<ResponseCallback>,
    ) -> MessageId {
        if self.registry.get(id).is_err() {
            warn!(service = %id, "Request from unknown service");
            return 0;
        }
        let Some(transactions) = self.transactions.as_mut() else {
            return 0;
        };
        let mut link = Link {
            mux: &mut self.mux,
            registry: &mut self.registry,
        };
        let msg_id = transactions.send_request(&mut link, id, self.now, request, callback);
        self.process_events();
        msg_id
    }

    /// Answer `request` on behalf of service `id`
    pub fn response_send(&mut self, id: ServiceId, request: &InboundRequest, response: Response) -> Result<()> {
        self.respond(id, request.msg_id(), Some(request.peer), response)
    }

    /// Answer a deferred request by message id
    pub fn response_send_by_msg_id(&mut self, id: ServiceId, msg_id: MessageId, response: Response) -> Result<()> {
        self.respond(id, msg_id, None, response)
    }

    fn respond(
        &mut self,
        id: ServiceId,
        msg_id: MessageId,
        peer: Option<SocketAddr>,
        response: Response,
    ) -> Result<()> {
        let transactions = self
            .transactions
            .as_mut()
            .ok_or_else(|| MoteError::not_found("no transactions"))?;
        let mut link = Link {
            mux: &mut self.mux,
            registry: &mut self.registry,
        };
        let result = transactions.send_response(&mut link, id, msg_id, peer, response);
        self.process_events();
        result
    }

    /// Cancel one request; its callback sees no response
    pub fn request_delete(&mut self, id: ServiceId, msg_id: MessageId) -> Result<()> {
        self.transactions
            .as_mut()
            .ok_or_else(|| MoteError::not_found(format!("no request {msg_id}")))?
            .delete_request(id, msg_id)
    }

    /// Cancel every transaction of service `id`
    pub fn request_delete_by_service(&mut self, id: ServiceId) -> Result<usize> {
        self.registry.get(id)?;
        Ok(self
            .transactions
            .as_mut()
            .map_or(0, |transactions| transactions.delete_all_for_service(id)))
    }

    /// Feed a datagram received by application means into the virtual socket of `id`
    pub fn virtual_socket_recv(&mut self, id: ServiceId, peer: SocketAddr, data: &[u8]) -> Result<()> {
        let socket = self.registry.get(id)?.socket();
        let result = self.mux.virtual_receive(
            socket,
            peer,
            data.to_vec(),
            &mut ServiceCallbacks::new(&mut self.registry),
        );
        self.process_events();
        result
    }

    /// Install the outbound path of the virtual socket of `id`
    pub fn virtual_socket_set_cb<S>(&mut self, id: ServiceId, sink: S) -> Result<()>
    where
        S: VirtualSocketSink + 'static,
    {
        self.registry.get_mut(id)?.set_virtual_sink(Box::new(sink));
        Ok(())
    }

    /// Handshake timeouts for new sessions on the socket of `id`
    pub fn set_handshake_timeout(&mut self, id: ServiceId, min_ms: u32, max_ms: u32) -> Result<()> {
        let socket = self.registry.get(id)?.socket();
        self.mux
            .set_handshake_timeouts(socket, HandshakeTimeouts { min_ms, max_ms })
    }

    /// Endpoint-wide session admission limits
    pub fn handshake_limits_set(&mut self, max_handshakes: u8, max_sessions: u8) -> Result<()> {
        self.mux.set_handshake_limits(max_handshakes, max_sessions)
    }

    /// Duplicate detection history length; zero disables detection
    pub fn set_duplicate_message_buffer(&mut self, id: ServiceId, size: u8) -> Result<()> {
        self.registry.get(id)?;
        self.codec_mut()?.set_duplicate_buffer_size(size)
    }

    /// Blockwise transfer block size; zero disables blockwise
    pub fn blockwise_size_set(&mut self, id: ServiceId, size: u16) -> Result<()> {
        self.registry.get(id)?;
        if size != 0 && (!size.is_power_of_two() || !(16..=1024).contains(&size)) {
            return Err(MoteError::invalid(format!(
                "block size {size} must be a power of two between 16 and 1024"
            )));
        }
        self.codec_mut()?.set_block_size(size)
    }

    fn codec_mut(&mut self) -> Result<&mut dyn CodecEffects> {
        self.transactions
            .as_mut()
            .map(TransactionManager::codec_mut)
            .ok_or_else(|| MoteError::not_found("no transaction manager"))
    }

    /// Install or remove the prevalidation hook for sockets listening on `port`
    pub fn msg_prevalidate_callback_set(
        &mut self,
        port: u16,
        hook: Option<Box<dyn MessagePrevalidator>>,
    ) -> Result<()> {
        if !self.mux.sockets().iter().any(|socket| socket.listen_port() == port) {
            return Err(MoteError::not_found(format!("no socket listens on port {port}")));
        }
        match hook {
            Some(hook) => {
                self.prevalidators.insert(port, hook);
            }
            None => {
                self.prevalidators.remove(&port);
            }
        }
        Ok(())
    }

    /// Use a fixed certificate for every handshake of `id`
    pub fn certificate_set(&mut self, id: ServiceId, chain: Vec<u8>, private_key: Vec<u8>) -> Result<()> {
        self.registry.get_mut(id)?.set_certificate(chain, private_key);
        Ok(())
    }

    /// First service using `socket`
    pub fn service_id_by_socket(&self, socket: SocketId) -> Option<ServiceId> {
        self.registry.by_socket(socket)
    }

    /// Tick last supplied to `exec`
    pub fn internal_ticks(&self) -> Tick {
        self.now
    }

    /// Close the secure session of `id`'s socket with `peer`
    pub fn close_secure_connection(&mut self, id: ServiceId, peer: SocketAddr) -> Result<()> {
        let socket = self.registry.get(id)?.socket();
        let result = self.mux.close_secure_connection(
            socket,
            peer,
            &mut ServiceCallbacks::new(&mut self.registry),
        );
        self.process_events();
        result
    }

    /// Host delivery of an expired handshake timer
    pub fn on_timer(&mut self, timer_id: TimerId) {
        self.mux
            .on_timer(timer_id, &mut ServiceCallbacks::new(&mut self.registry));
        self.process_events();
    }

    /// Pull received datagrams from the transport and process them
    pub fn poll_transport(&mut self) {
        self.mux.poll(&mut ServiceCallbacks::new(&mut self.registry));
        self.process_events();
    }

    /// Periodic tick: session sweep, transaction expiry, codec retransmissions
    pub fn exec(&mut self, now: Tick) {
        self.now = self.now.max(now);
        self.mux
            .exec(self.now, &mut ServiceCallbacks::new(&mut self.registry));
        self.process_events();

        if let Some(transactions) = self.transactions.as_mut() {
            let mut link = Link {
                mux: &mut self.mux,
                registry: &mut self.registry,
            };
            transactions.exec(&mut link, self.now);
        }
        self.process_events();
    }

    /// Number of live transactions
    pub fn transaction_count(&self) -> usize {
        self.transactions.as_ref().map_or(0, TransactionManager::len)
    }

    /// Transaction manager, once created
    pub fn transactions(&self) -> Option<&TransactionManager> {
        self.transactions.as_ref()
    }

    /// Socket multiplexer
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Service registry
    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Socket held by service `id`
    pub fn socket_of(&self, id: ServiceId) -> Result<SocketId> {
        Ok(self.registry.get(id)?.socket())
    }

    /// State of the session between `id`'s socket and `peer`
    pub fn session_state(&self, id: ServiceId, peer: SocketAddr) -> Option<SessionState> {
        let socket = self.registry.get(id).ok()?.socket();
        self.mux.session_state(socket, peer)
    }

    fn process_events(&mut self) {
        while let Some(event) = self.mux.next_event() {
            match event {
                TransportEvent::Received {
                    socket,
                    peer,
                    local,
                    data,
                } => self.handle_datagram(socket, peer, local, &data),
                TransportEvent::SecurityEstablished {
                    owner,
                    peer,
                    keyblock,
                    ..
                } => self.handle_established(owner, peer, &keyblock),
                TransportEvent::SessionTerminated { socket, peer } => {
                    if let Some(transactions) = self.transactions.as_mut() {
                        let cancelled = transactions.delete_all_for_peer(peer);
                        if cancelled > 0 {
                            debug!(socket = %socket, peer = %peer, count = cancelled, "Cancelled transactions of closed session");
                        }
                    }
                }
            }
        }
    }

    fn handle_established(&mut self, owner: ServiceId, peer: SocketAddr, keyblock: &[u8]) {
        if let Some(transactions) = self.transactions.as_mut() {
            let mut link = Link {
                mux: &mut self.mux,
                registry: &mut self.registry,
            };
            transactions.flush_retained(&mut link, peer);
        }
        if let Some(security) = self
            .registry
            .get_mut(owner)
            .ok()
            .and_then(Service::security_mut)
        {
            security.security_established(owner, peer, keyblock);
        }
    }

    fn handle_datagram(&mut self, socket: SocketId, peer: SocketAddr, local: IpAddr, data: &[u8]) {
        let Some(transactions) = self.transactions.as_mut() else {
            return;
        };
        let source = (!local.is_unspecified() && !local.is_multicast()).then_some(local);

        match transactions.process_inbound(self.now, data, peer, source) {
            Inbound::Request(message) => self.dispatch(socket, peer, local, message),
            Inbound::Incomplete { reply: Some(reply) } | Inbound::ResponseHandled { ack: Some(reply) } => {
                self.acknowledge(socket, peer, source, &reply);
            }
            Inbound::Incomplete { reply: None }
            | Inbound::ResponseHandled { ack: None }
            | Inbound::Acknowledged
            | Inbound::Dropped => {}
        }
    }

    fn acknowledge(&mut self, socket: SocketId, peer: SocketAddr, source: Option<IpAddr>, reply: &[u8]) {
        let mut link = Link {
            mux: &mut self.mux,
            registry: &mut self.registry,
        };
        if let Err(error) = link.transmit(Via::Socket(socket), peer, reply, source, RequestOptions::empty()) {
            warn!(socket = %socket, peer = %peer, error = %error, "Failed to send acknowledgement");
        }
    }

    fn dispatch(&mut self, socket: SocketId, peer: SocketAddr, local: IpAddr, message: CoapMessage) {
        let Some(transactions) = self.transactions.as_mut() else {
            return;
        };
        let msg_id = message.msg_id;

        if let Some(receiving) = self.mux.socket(socket) {
            if let Some(hook) = self.prevalidators.get_mut(&receiving.listen_port()) {
                let context = PrevalidateContext {
                    interface: receiving.interface(),
                    local,
                    peer,
                    path: message.path(),
                };
                if !hook.accept(&context) {
                    debug!(socket = %socket, peer = %peer, path = %message.path(), "Request rejected by prevalidation");
                    transactions.drop_request(msg_id, peer);
                    return;
                }
            }
        }

        let route = router::resolve(&self.registry, socket, &message);
        let (service, bypass_security) = match route {
            Route::Matched {
                service,
                bypass_security,
            } => (service, bypass_security),
            Route::MethodNotAllowed { .. } | Route::NotFound => {
                debug!(socket = %socket, peer = %peer, path = %message.path(), route = ?route, "Request not routed");
                match (message.msg_type, route.rejection_code()) {
                    (MessageType::Confirmable, Some(code)) => {
                        let mut link = Link {
                            mux: &mut self.mux,
                            registry: &mut self.registry,
                        };
                        transactions.reject_request(&mut link, socket, msg_id, peer, code);
                    }
                    _ => transactions.drop_request(msg_id, peer),
                }
                return;
            }
        };

        let options = if bypass_security {
            RequestOptions::SECURE_BYPASS
        } else {
            RequestOptions::empty()
        };
        if let Err(error) = transactions.assign_service(msg_id, peer, service, options) {
            warn!(service = %service, msg_id = msg_id, error = %error, "Lost track of request");
            return;
        }

        let path = message.path().to_string();
        let request = InboundRequest {
            service_id: service,
            peer,
            local,
            message,
        };
        let disposition = self
            .registry
            .get_mut(service)
            .ok()
            .and_then(|owner| owner.uri_mut(&path))
            .map_or(RequestDisposition::Ignore, |uri| uri.handler_mut().handle(&request));

        match disposition {
            RequestDisposition::Respond(response) => {
                let mut link = Link {
                    mux: &mut self.mux,
                    registry: &mut self.registry,
                };
                if let Err(error) = transactions.send_response(&mut link, service, msg_id, Some(peer), response) {
                    warn!(service = %service, peer = %peer, msg_id = msg_id, error = %error, "Failed to send response");
                }
            }
            RequestDisposition::Deferred => {
                debug!(service = %service, peer = %peer, msg_id = msg_id, "Response deferred");
            }
            RequestDisposition::Ignore => transactions.drop_request(msg_id, peer),
        }
    }
}
