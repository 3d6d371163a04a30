//! Mote CoAP - transactions, services and routing
//!
//! The top of the engine. An `Endpoint` is the single context object a host
//! creates at startup: it owns the service registry, the socket multiplexer
//! and the transaction manager, and exposes the whole public API.
//!
//! - **Transactions**: token allocation, response matching, validity
//!   deadlines, retained payloads while a handshake completes
//! - **Registry**: services, their sockets and URI registrations
//! - **Router**: maps inbound requests to a service's handler
//! - **Handlers**: the application-facing callback traits
//!
//! Asynchronous completions (responses, timeouts, cancellation) reach the
//! application only through callbacks registered beforehand, each invoked
//! exactly once.

#![forbid(unsafe_code)]

/// Public context object and host API
pub mod endpoint;

/// Application callback traits and request/response types
pub mod handlers;

/// Services and URI registrations
pub mod registry;

/// Inbound request routing
pub mod router;

/// Transaction bookkeeping
pub mod transaction;

pub use endpoint::Endpoint;
pub use handlers::{
    InboundRequest, MessagePrevalidator, PrevalidateContext, RequestDisposition, RequestHandler,
    Response, ResponseCallback, ResponseOutcome, SecurityHandler, VirtualSocketSink,
};
pub use registry::{Service, ServiceRegistry, UriRegistration};
pub use router::Route;
pub use transaction::{
    Inbound, OutboundRequest, Role, Transaction, TransactionManager, Transmitter, Via,
};
