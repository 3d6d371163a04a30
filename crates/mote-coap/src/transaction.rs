//! Transaction manager
//!
//! Tracks every in-flight exchange: client transactions from `send_request`
//! until their response, cancellation or expiry, and server transactions from
//! an inbound request until the application answers it.
//!
//! The manager owns the codec and random collaborators. Transmission goes
//! through a `Transmitter` supplied per call, which lets the endpoint lend its
//! multiplexer and service registry without the manager owning either.
//!
//! Every transaction carries a validity deadline of `now + worst-case codec
//! retransmission lifetime`. `exec` removes transactions whose deadline has
//! passed and reports each to its callback with an absent response.

use crate::handlers::{Response, ResponseCallback, ResponseOutcome};
use mote_core::effects::{CodecEffects, RandomEffects};
use mote_core::{
    CoapMessage, Code, ContentFormat, MessageId, MessageType, MoteError, ParseOutcome,
    RequestOptions, Result, ServiceId, SocketId, Tick, Token, TransactionConfig,
};
use mote_transport::SendOutcome;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

/// Length of generated request tokens
pub const TOKEN_LEN: usize = 4;

const MAX_TOKEN_ATTEMPTS: usize = 32;

/// Where a datagram leaves from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    /// The socket of a service
    Service(ServiceId),
    /// A socket directly, for replies to requests no service claimed
    Socket(SocketId),
}

/// Outbound path used by the transaction manager
pub trait Transmitter {
    /// Send `payload` to `destination`
    fn transmit(
        &mut self,
        via: Via,
        destination: SocketAddr,
        payload: &[u8],
        source: Option<IpAddr>,
        options: RequestOptions,
    ) -> Result<SendOutcome>;
}

/// Which side of the exchange a transaction tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We sent the request
    Client,
    /// We received the request
    Server,
}

/// A request to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Destination
    pub peer: SocketAddr,
    /// Confirmable or non-confirmable
    pub msg_type: MessageType,
    /// Method
    pub code: Code,
    /// Uri-Path
    pub uri: String,
    /// Content-Format of the payload
    pub content_format: Option<ContentFormat>,
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Transmission options
    pub options: RequestOptions,
    /// Explicit source address
    pub source: Option<IpAddr>,
}

impl OutboundRequest {
    /// Request without payload or options
    pub fn new(peer: SocketAddr, msg_type: MessageType, code: Code, uri: impl Into<String>) -> Self {
        Self {
            peer,
            msg_type,
            code,
            uri: uri.into(),
            content_format: None,
            payload: Vec::new(),
            options: RequestOptions::empty(),
            source: None,
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, content_format: ContentFormat, payload: impl Into<Vec<u8>>) -> Self {
        self.content_format = Some(content_format);
        self.payload = payload.into();
        self
    }

    /// Set transmission options
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Send from a specific local address
    pub fn with_source(mut self, source: IpAddr) -> Self {
        self.source = Some(source);
        self
    }
}

/// One in-flight exchange
pub struct Transaction {
    msg_id: MessageId,
    token: Token,
    peer: SocketAddr,
    local: Option<IpAddr>,
    service_id: Option<ServiceId>,
    role: Role,
    request_type: MessageType,
    options: RequestOptions,
    valid_until: Tick,
    retained: Option<Vec<u8>>,
    callback: Option<ResponseCallback>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("msg_id", &self.msg_id)
            .field("token", &format_args!("{}", self.token))
            .field("peer", &self.peer)
            .field("service_id", &self.service_id)
            .field("role", &self.role)
            .field("valid_until", &self.valid_until)
            .field("retained", &self.retained.as_ref().map(Vec::len))
            .field("callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Message id
    pub fn msg_id(&self) -> MessageId {
        self.msg_id
    }

    /// Token
    pub fn token(&self) -> Token {
        self.token
    }

    /// Remote peer
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Owning service, once known
    pub fn service_id(&self) -> Option<ServiceId> {
        self.service_id
    }

    /// Client or server side
    pub fn role(&self) -> Role {
        self.role
    }

    /// Type of the request that opened the exchange
    pub fn request_type(&self) -> MessageType {
        self.request_type
    }

    /// Transmission options
    pub fn options(&self) -> RequestOptions {
        self.options
    }

    /// Last tick at which the transaction is still valid
    pub fn valid_until(&self) -> Tick {
        self.valid_until
    }

    /// Whether bytes are held back until a secure channel is up
    pub fn has_retained(&self) -> bool {
        self.retained.is_some()
    }

    /// Whether a response callback is registered
    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    fn finish(mut self, response: Option<CoapMessage>) {
        if let Some(callback) = self.callback.take() {
            callback(ResponseOutcome {
                msg_id: self.msg_id,
                peer: self.peer,
                response,
            });
        }
    }

    fn answers(&self, message: &CoapMessage, peer: SocketAddr) -> bool {
        if self.role != Role::Client {
            return false;
        }
        let from_peer = self.peer == peer || self.options.contains(RequestOptions::MULTICAST);
        if message.token.is_empty() {
            from_peer && self.msg_id == message.msg_id
        } else {
            from_peer && self.token == message.token
        }
    }
}

/// What `process_inbound` made of a datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A request; a server transaction now exists and the request needs routing
    Request(CoapMessage),
    /// A response matched a client transaction and its callback ran
    ResponseHandled {
        /// Empty acknowledgement owed for a confirmable separate response
        ack: Option<Vec<u8>>,
    },
    /// An empty acknowledgement; the separate response is still awaited
    Acknowledged,
    /// A blockwise transfer is in progress
    Incomplete {
        /// Block acknowledgement to send back to the peer
        reply: Option<Vec<u8>>,
    },
    /// Malformed, duplicate or unmatched
    Dropped,
}

#[derive(Debug, Clone, Copy)]
struct RetransmitRoute {
    msg_id: MessageId,
    via: Via,
    source: Option<IpAddr>,
    options: RequestOptions,
    expires: Tick,
}

/// Transaction table plus the codec and random collaborators
pub struct TransactionManager {
    transactions: Vec<Transaction>,
    routes: Vec<RetransmitRoute>,
    codec: Box<dyn CodecEffects>,
    random: Box<dyn RandomEffects>,
    lifetime_secs: u64,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("transactions", &self.transactions)
            .field("routes", &self.routes.len())
            .field("lifetime_secs", &self.lifetime_secs)
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    /// Configure the codec and create an empty table
    pub fn new(
        mut codec: Box<dyn CodecEffects>,
        random: Box<dyn RandomEffects>,
        config: &TransactionConfig,
    ) -> Result<Self> {
        config.validate()?;
        codec.set_retransmission_params(config.resend_count, config.resend_interval_secs)?;
        codec.set_duplicate_buffer_size(config.duplicate_buffer_size)?;
        codec.set_block_size(config.block_size)?;

        Ok(Self {
            transactions: Vec::new(),
            routes: Vec::new(),
            codec,
            random,
            lifetime_secs: config.worst_case_lifetime_secs(),
        })
    }

    /// Seconds a new transaction stays valid
    pub fn lifetime_secs(&self) -> u64 {
        self.lifetime_secs
    }

    /// The codec collaborator, for runtime tuning
    pub fn codec_mut(&mut self) -> &mut dyn CodecEffects {
        self.codec.as_mut()
    }

    /// Number of live transactions
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// All live transactions
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter()
    }

    /// Client transaction by message id
    pub fn get(&self, msg_id: MessageId) -> Option<&Transaction> {
        self.transactions
            .iter()
            .find(|t| t.role == Role::Client && t.msg_id == msg_id)
    }

    /// Send a request from `service`.
    ///
    /// Returns the message id when a response is expected, `0` otherwise. With
    /// no callback nothing is kept once the datagram is out. A build failure
    /// keeps the transaction with a deadline of `now` so the next `exec` reports
    /// it; a transport failure reports it immediately.
    pub fn send_request(
        &mut self,
        link: &mut dyn Transmitter,
        service: ServiceId,
        now: Tick,
        request: OutboundRequest,
        callback: Option<ResponseCallback>,
    ) -> MessageId {
        let Some(token) = self.unique_token(request.peer) else {
            warn!(peer = %request.peer, "No free token for request");
            return 0;
        };

        let mut message = CoapMessage::request(request.msg_type, request.code, request.uri)
            .with_token(token)
            .with_payload(request.content_format, request.payload);

        let mut transaction = Transaction {
            msg_id: 0,
            token,
            peer: request.peer,
            local: request.source,
            service_id: Some(service),
            role: Role::Client,
            request_type: request.msg_type,
            options: request.options,
            valid_until: now.saturating_add(self.lifetime_secs),
            retained: None,
            callback,
        };

        let built = self.codec.build(&mut message, request.peer);
        transaction.msg_id = message.msg_id;
        let bytes = match built {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(service = %service, peer = %request.peer, error = %error, "Failed to build request");
                if !transaction.has_callback() {
                    return 0;
                }
                transaction.valid_until = now;
                self.transactions.push(transaction);
                return message.msg_id;
            }
        };

        if message.msg_type == MessageType::Confirmable {
            self.routes.push(RetransmitRoute {
                msg_id: message.msg_id,
                via: Via::Service(service),
                source: request.source,
                options: request.options,
                expires: transaction.valid_until,
            });
        }

        match link.transmit(
            Via::Service(service),
            request.peer,
            &bytes,
            request.source,
            request.options,
        ) {
            Ok(SendOutcome::Sent(_)) => {
                debug!(service = %service, peer = %request.peer, msg_id = message.msg_id, token = %token, "Request sent");
                if !transaction.has_callback() {
                    return 0;
                }
                self.transactions.push(transaction);
                message.msg_id
            }
            Ok(SendOutcome::HandshakePending) => {
                debug!(service = %service, peer = %request.peer, msg_id = message.msg_id, "Request held until secure channel is up");
                let expects_response = transaction.has_callback();
                transaction.retained = Some(bytes);
                self.transactions.push(transaction);
                if expects_response {
                    message.msg_id
                } else {
                    0
                }
            }
            Err(error) => {
                warn!(service = %service, peer = %request.peer, error = %error, "Failed to send request");
                self.forget_retransmission(message.msg_id);
                transaction.finish(None);
                0
            }
        }
    }

    /// Hand received bytes to the codec and match the result.
    ///
    /// Requests open a server transaction; the caller routes them and settles
    /// the transaction with `assign_service`, `send_response`,
    /// `reject_request` or `drop_request`.
    pub fn process_inbound(
        &mut self,
        now: Tick,
        data: &[u8],
        peer: SocketAddr,
        local: Option<IpAddr>,
    ) -> Inbound {
        let message = match self.codec.parse(data, peer) {
            ParseOutcome::Message(message) => message,
            ParseOutcome::Duplicate => {
                debug!(peer = %peer, "Duplicate message");
                return Inbound::Dropped;
            }
            ParseOutcome::Incomplete { reply } => return Inbound::Incomplete { reply },
            ParseOutcome::Malformed { reason } => {
                debug!(peer = %peer, reason = %reason, "Malformed message");
                return Inbound::Dropped;
            }
        };

        if message.is_request() {
            self.transactions
                .retain(|t| !(t.role == Role::Server && t.peer == peer && t.msg_id == message.msg_id));
            self.transactions.push(Transaction {
                msg_id: message.msg_id,
                token: message.token,
                peer,
                local,
                service_id: None,
                role: Role::Server,
                request_type: message.msg_type,
                options: RequestOptions::empty(),
                valid_until: now.saturating_add(self.lifetime_secs),
                retained: None,
                callback: None,
            });
            return Inbound::Request(message);
        }

        match message.msg_type {
            MessageType::Reset => return self.reset(message.msg_id, peer),
            MessageType::Acknowledgement if message.code.is_empty() => {
                if !self.has_client(message.msg_id, peer) {
                    debug!(peer = %peer, msg_id = message.msg_id, "Unmatched empty acknowledgement");
                    return Inbound::Dropped;
                }
                self.forget_retransmission(message.msg_id);
                debug!(peer = %peer, msg_id = message.msg_id, "Awaiting separate response");
                return Inbound::Acknowledged;
            }
            _ => {}
        }

        if !message.code.is_response() {
            return Inbound::Dropped;
        }

        let Some(index) = self.transactions.iter().position(|t| t.answers(&message, peer)) else {
            debug!(peer = %peer, msg_id = message.msg_id, token = %message.token, "Unmatched response");
            return Inbound::Dropped;
        };
        let transaction = self.transactions.remove(index);
        self.forget_retransmission(transaction.msg_id);
        debug!(peer = %peer, msg_id = transaction.msg_id, code = %message.code, "Response received");
        let separate = (message.msg_type == MessageType::Confirmable).then_some(message.msg_id);
        transaction.finish(Some(message));

        let ack = separate.and_then(|msg_id| self.empty_ack(msg_id, peer));
        Inbound::ResponseHandled { ack }
    }

    fn empty_ack(&mut self, msg_id: MessageId, peer: SocketAddr) -> Option<Vec<u8>> {
        let mut ack = CoapMessage::response(MessageType::Acknowledgement, Code::EMPTY, msg_id, Token::default());
        match self.codec.build(&mut ack, peer) {
            Ok(bytes) => Some(bytes),
            Err(error) => {
                warn!(peer = %peer, msg_id = msg_id, error = %error, "Failed to build acknowledgement");
                None
            }
        }
    }

    fn reset(&mut self, msg_id: MessageId, peer: SocketAddr) -> Inbound {
        let Some(index) = self
            .transactions
            .iter()
            .position(|t| t.role == Role::Client && t.msg_id == msg_id && t.peer == peer)
        else {
            return Inbound::Dropped;
        };
        let transaction = self.transactions.remove(index);
        self.forget_retransmission(msg_id);
        info!(peer = %peer, msg_id = msg_id, "Request reset by peer");
        transaction.finish(None);
        Inbound::ResponseHandled { ack: None }
    }

    /// Record the service that claimed a request
    pub fn assign_service(
        &mut self,
        msg_id: MessageId,
        peer: SocketAddr,
        service: ServiceId,
        options: RequestOptions,
    ) -> Result<()> {
        let transaction = self
            .server_mut(msg_id, peer)
            .ok_or_else(|| MoteError::not_found(format!("no request {msg_id} from {peer}")))?;
        transaction.service_id = Some(service);
        transaction.options = options;
        Ok(())
    }

    /// Answer a request of `service`.
    ///
    /// `peer` narrows the lookup when known. Confirmable requests get a
    /// piggy-backed acknowledgement, non-confirmable ones a new non-confirmable
    /// message. The transaction is removed only once the response is out.
    pub fn send_response(
        &mut self,
        link: &mut dyn Transmitter,
        service: ServiceId,
        msg_id: MessageId,
        peer: Option<SocketAddr>,
        response: Response,
    ) -> Result<()> {
        let index = self
            .transactions
            .iter()
            .position(|t| {
                t.role == Role::Server
                    && t.msg_id == msg_id
                    && t.service_id == Some(service)
                    && peer.map_or(true, |peer| t.peer == peer)
            })
            .ok_or_else(|| MoteError::not_found(format!("no pending request {msg_id} for {service}")))?;

        let (destination, token, local, options, request_type) = {
            let t = &self.transactions[index];
            (t.peer, t.token, t.local, t.options, t.request_type)
        };
        let (msg_type, reply_id) = match request_type {
            MessageType::Confirmable => (MessageType::Acknowledgement, msg_id),
            _ => (MessageType::NonConfirmable, 0),
        };
        let mut message = CoapMessage::response(msg_type, response.code, reply_id, token)
            .with_payload(response.content_format, response.payload);
        let bytes = self.codec.build(&mut message, destination)?;

        match link.transmit(Via::Service(service), destination, &bytes, local, options)? {
            SendOutcome::Sent(_) => {
                self.transactions.remove(index);
                debug!(service = %service, peer = %destination, msg_id = msg_id, code = %response.code, "Response sent");
            }
            SendOutcome::HandshakePending => {
                self.transactions[index].retained = Some(bytes);
            }
        }
        Ok(())
    }

    /// Answer an unroutable request with an error code and forget it.
    ///
    /// Only confirmable requests are answered.
    pub fn reject_request(
        &mut self,
        link: &mut dyn Transmitter,
        socket: SocketId,
        msg_id: MessageId,
        peer: SocketAddr,
        code: Code,
    ) {
        let Some(transaction) = self.take_server(msg_id, peer) else {
            return;
        };
        if transaction.request_type != MessageType::Confirmable {
            return;
        }

        let mut message =
            CoapMessage::response(MessageType::Acknowledgement, code, msg_id, transaction.token);
        let sent = self.codec.build(&mut message, peer).and_then(|bytes| {
            link.transmit(
                Via::Socket(socket),
                peer,
                &bytes,
                transaction.local,
                RequestOptions::empty(),
            )
        });
        if let Err(error) = sent {
            warn!(peer = %peer, msg_id = msg_id, code = %code, error = %error, "Failed to send rejection");
        }
    }

    /// Forget a request without answering
    pub fn drop_request(&mut self, msg_id: MessageId, peer: SocketAddr) {
        self.take_server(msg_id, peer);
    }

    /// Cancel one client request of `service`; its callback sees no response
    pub fn delete_request(&mut self, service: ServiceId, msg_id: MessageId) -> Result<()> {
        let index = self
            .transactions
            .iter()
            .position(|t| t.role == Role::Client && t.msg_id == msg_id && t.service_id == Some(service))
            .ok_or_else(|| MoteError::not_found(format!("no request {msg_id} for {service}")))?;
        let transaction = self.transactions.remove(index);
        self.forget_retransmission(msg_id);
        info!(service = %service, msg_id = msg_id, "Request cancelled");
        transaction.finish(None);
        Ok(())
    }

    /// Cancel everything owned by `service`
    pub fn delete_all_for_service(&mut self, service: ServiceId) -> usize {
        self.delete_where(|t| t.service_id == Some(service))
    }

    /// Cancel everything toward `peer`
    pub fn delete_all_for_peer(&mut self, peer: SocketAddr) -> usize {
        self.delete_where(|t| t.peer == peer)
    }

    fn delete_where(&mut self, doomed: impl Fn(&Transaction) -> bool) -> usize {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.transactions).into_iter().partition(|t| doomed(t));
        self.transactions = kept;

        let count = removed.len();
        for transaction in removed {
            if transaction.role == Role::Client {
                self.forget_retransmission(transaction.msg_id);
            }
            transaction.finish(None);
        }
        if count > 0 {
            info!(count = count, "Transactions cancelled");
        }
        count
    }

    /// Expire overdue transactions, then transmit due codec retransmissions
    pub fn exec(&mut self, link: &mut dyn Transmitter, now: Tick) {
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.transactions)
            .into_iter()
            .partition(|t| now > t.valid_until);
        self.transactions = kept;

        for transaction in expired {
            info!(peer = %transaction.peer, msg_id = transaction.msg_id, role = ?transaction.role, "Transaction expired");
            if transaction.role == Role::Client {
                self.forget_retransmission(transaction.msg_id);
            }
            transaction.finish(None);
        }
        self.routes.retain(|route| route.expires >= now);

        for retransmission in self.codec.exec(now) {
            let Some(route) = self
                .routes
                .iter()
                .find(|route| route.msg_id == retransmission.msg_id)
                .copied()
            else {
                debug!(msg_id = retransmission.msg_id, "Retransmission without route");
                continue;
            };
            if let Err(error) = link.transmit(
                route.via,
                retransmission.destination,
                &retransmission.bytes,
                route.source,
                route.options,
            ) {
                warn!(msg_id = retransmission.msg_id, error = %error, "Retransmission failed");
            }
        }
    }

    /// Send everything held back for `peer` now that its channel is up.
    ///
    /// Flushed transactions without a callback are done and removed. A
    /// transport failure cancels the transaction.
    pub fn flush_retained(&mut self, link: &mut dyn Transmitter, peer: SocketAddr) -> usize {
        let mut flushed = 0;
        // (index, failed) in ascending index order
        let mut settled = Vec::new();

        for (index, transaction) in self.transactions.iter_mut().enumerate() {
            if transaction.peer != peer {
                continue;
            }
            let (Some(bytes), Some(service)) = (transaction.retained.take(), transaction.service_id) else {
                continue;
            };
            match link.transmit(
                Via::Service(service),
                peer,
                &bytes,
                transaction.local,
                transaction.options,
            ) {
                Ok(SendOutcome::Sent(_)) => {
                    flushed += 1;
                    if !transaction.has_callback() {
                        settled.push((index, false));
                    }
                }
                Ok(SendOutcome::HandshakePending) => transaction.retained = Some(bytes),
                Err(error) => {
                    warn!(peer = %peer, msg_id = transaction.msg_id, error = %error, "Failed to flush retained message");
                    settled.push((index, true));
                }
            }
        }

        for (index, failed) in settled.into_iter().rev() {
            let transaction = self.transactions.remove(index);
            if failed {
                self.forget_retransmission(transaction.msg_id);
                transaction.finish(None);
            }
        }

        if flushed > 0 {
            debug!(peer = %peer, count = flushed, "Retained messages flushed");
        }
        flushed
    }

    fn unique_token(&mut self, peer: SocketAddr) -> Option<Token> {
        for _ in 0..MAX_TOKEN_ATTEMPTS {
            let mut bytes = [0u8; TOKEN_LEN];
            self.random.fill_bytes(&mut bytes);
            let Ok(token) = Token::from_slice(&bytes) else {
                continue;
            };
            let taken = self
                .transactions
                .iter()
                .any(|t| t.role == Role::Client && t.peer == peer && t.token == token);
            if !taken {
                return Some(token);
            }
        }
        None
    }

    fn has_client(&self, msg_id: MessageId, peer: SocketAddr) -> bool {
        self.transactions
            .iter()
            .any(|t| t.role == Role::Client && t.msg_id == msg_id && t.peer == peer)
    }

    fn server_mut(&mut self, msg_id: MessageId, peer: SocketAddr) -> Option<&mut Transaction> {
        self.transactions
            .iter_mut()
            .find(|t| t.role == Role::Server && t.msg_id == msg_id && t.peer == peer)
    }

    fn take_server(&mut self, msg_id: MessageId, peer: SocketAddr) -> Option<Transaction> {
        let index = self
            .transactions
            .iter()
            .position(|t| t.role == Role::Server && t.msg_id == msg_id && t.peer == peer)?;
        Some(self.transactions.remove(index))
    }

    fn forget_retransmission(&mut self, msg_id: MessageId) {
        self.codec.delete_retransmission(msg_id);
        self.routes.retain(|route| route.msg_id != msg_id);
    }
}
