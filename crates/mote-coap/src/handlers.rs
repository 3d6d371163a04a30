//! Application callback traits
//!
//! Everything the engine calls back into lives here. Each trait has a blanket
//! implementation for the matching closure shape so simple applications can
//! pass closures while larger ones implement the traits on their own types.

use mote_core::effects::Credentials;
use mote_core::{CoapMessage, Code, ContentFormat, InterfaceId, MessageId, Result, ServiceId};
use std::net::{IpAddr, SocketAddr};

/// Final result of an outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseOutcome {
    /// Message id returned by `request_send`
    pub msg_id: MessageId,
    /// Peer the request was sent to
    pub peer: SocketAddr,
    /// Matching response; `None` on timeout, cancellation or send failure
    pub response: Option<CoapMessage>,
}

/// Invoked exactly once per request that registered it
pub type ResponseCallback = Box<dyn FnOnce(ResponseOutcome) + Send>;

/// A request routed to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    /// Service the request was routed to
    pub service_id: ServiceId,
    /// Sender
    pub peer: SocketAddr,
    /// Address the request arrived on; unspecified for virtual sockets
    pub local: IpAddr,
    /// Parsed request
    pub message: CoapMessage,
}

impl InboundRequest {
    /// Message id, used to answer a deferred request later
    pub fn msg_id(&self) -> MessageId {
        self.message.msg_id
    }

    /// Request method
    pub fn method(&self) -> Code {
        self.message.code
    }

    /// Normalized Uri-Path
    pub fn path(&self) -> &str {
        self.message.path()
    }
}

/// Response content chosen by the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response code
    pub code: Code,
    /// Content-Format of the payload
    pub content_format: Option<ContentFormat>,
    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Response {
    /// Response without payload
    pub fn new(code: Code) -> Self {
        Self {
            code,
            content_format: None,
            payload: Vec::new(),
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, content_format: ContentFormat, payload: impl Into<Vec<u8>>) -> Self {
        self.content_format = Some(content_format);
        self.payload = payload.into();
        self
    }
}

/// What a request handler did with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDisposition {
    /// Answer right away
    Respond(Response),
    /// The application answers later with `response_send_by_msg_id`
    Deferred,
    /// Drop the request without answering
    Ignore,
}

/// Handles requests for one registered URI
pub trait RequestHandler: Send {
    /// Decide what to do with `request`
    fn handle(&mut self, request: &InboundRequest) -> RequestDisposition;
}

impl<F> RequestHandler for F
where
    F: FnMut(&InboundRequest) -> RequestDisposition + Send,
{
    fn handle(&mut self, request: &InboundRequest) -> RequestDisposition {
        self(request)
    }
}

/// Secure channel hooks of a service
pub trait SecurityHandler: Send {
    /// Credentials for a handshake with `peer`; `None` refuses the handshake
    fn credentials(&mut self, service: ServiceId, peer: SocketAddr) -> Option<Credentials>;

    /// The channel with `peer` is up
    fn security_established(&mut self, _service: ServiceId, _peer: SocketAddr, _keyblock: &[u8]) {}
}

/// Outbound path of a virtual socket
pub trait VirtualSocketSink: Send {
    /// Carry `data` to `peer` by application-specific means
    fn send(&mut self, service: ServiceId, peer: SocketAddr, data: &[u8]) -> Result<()>;
}

impl<F> VirtualSocketSink for F
where
    F: FnMut(ServiceId, SocketAddr, &[u8]) -> Result<()> + Send,
{
    fn send(&mut self, service: ServiceId, peer: SocketAddr, data: &[u8]) -> Result<()> {
        self(service, peer, data)
    }
}

/// What a prevalidation hook sees about an inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrevalidateContext<'a> {
    /// Interface the receiving socket is bound to, if any
    pub interface: Option<InterfaceId>,
    /// Address the request arrived on
    pub local: IpAddr,
    /// Sender
    pub peer: SocketAddr,
    /// Normalized Uri-Path
    pub path: &'a str,
}

/// Per-port filter run before routing
pub trait MessagePrevalidator: Send {
    /// `false` drops the request silently
    fn accept(&mut self, context: &PrevalidateContext<'_>) -> bool;
}

impl<F> MessagePrevalidator for F
where
    F: FnMut(&PrevalidateContext<'_>) -> bool + Send,
{
    fn accept(&mut self, context: &PrevalidateContext<'_>) -> bool {
        self(context)
    }
}
