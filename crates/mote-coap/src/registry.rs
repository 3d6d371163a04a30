//! Service registry
//!
//! Services are the logical CoAP endpoints an application registers. Each one
//! holds a socket reference in the multiplexer, an ordered list of URI
//! registrations and its optional security, certificate and virtual socket
//! hooks. Ids are the smallest free value in `1..=126`.

use crate::handlers::{RequestHandler, SecurityHandler, VirtualSocketSink};
use mote_core::effects::Credentials;
use mote_core::{
    InterfaceId, MethodMask, MoteError, Result, ServiceId, ServiceOptions, SocketId,
};
use mote_transport::SocketCallbacks;
use std::net::SocketAddr;
use tracing::debug;

/// One path a service answers
pub struct UriRegistration {
    path: String,
    methods: MethodMask,
    handler: Box<dyn RequestHandler>,
}

impl std::fmt::Debug for UriRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UriRegistration")
            .field("path", &self.path)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl UriRegistration {
    /// Normalized path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Accepted methods
    pub fn methods(&self) -> MethodMask {
        self.methods
    }

    pub(crate) fn handler_mut(&mut self) -> &mut dyn RequestHandler {
        self.handler.as_mut()
    }
}

/// A registered logical endpoint
pub struct Service {
    id: ServiceId,
    interface: InterfaceId,
    port: u16,
    options: ServiceOptions,
    socket: SocketId,
    uris: Vec<UriRegistration>,
    security: Option<Box<dyn SecurityHandler>>,
    virtual_sink: Option<Box<dyn VirtualSocketSink>>,
    certificate: Option<Credentials>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("interface", &self.interface)
            .field("port", &self.port)
            .field("options", &self.options)
            .field("socket", &self.socket)
            .field("uris", &self.uris)
            .field("security", &self.security.is_some())
            .field("virtual_sink", &self.virtual_sink.is_some())
            .field("certificate", &self.certificate.is_some())
            .finish()
    }
}

impl Service {
    /// Service bound to an opened socket
    pub fn new(
        id: ServiceId,
        interface: InterfaceId,
        port: u16,
        options: ServiceOptions,
        socket: SocketId,
        security: Option<Box<dyn SecurityHandler>>,
    ) -> Self {
        Self {
            id,
            interface,
            port,
            options,
            socket,
            uris: Vec::new(),
            security,
            virtual_sink: None,
            certificate: None,
        }
    }

    /// Service id
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// Interface the service was initialized on
    pub fn interface(&self) -> InterfaceId {
        self.interface
    }

    /// Port requested at initialization; 0 for ephemeral
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Option flags
    pub fn options(&self) -> ServiceOptions {
        self.options
    }

    /// Socket the service holds a reference to
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// Registered URIs in registration order
    pub fn uris(&self) -> &[UriRegistration] {
        &self.uris
    }

    /// Whether a virtual send callback is installed
    pub fn has_virtual_sink(&self) -> bool {
        self.virtual_sink.is_some()
    }

    /// Register `handler` for `path`, replacing an existing registration
    pub fn register_uri(&mut self, path: &str, methods: MethodMask, handler: Box<dyn RequestHandler>) {
        let path = normalize(path);
        self.uris.retain(|uri| uri.path != path);
        debug!(service = %self.id, path = %path, methods = ?methods, "URI registered");
        self.uris.push(UriRegistration {
            path,
            methods,
            handler,
        });
    }

    /// Remove the registration for `path`
    pub fn unregister_uri(&mut self, path: &str) -> Result<()> {
        let path = normalize(path);
        let index = self
            .uris
            .iter()
            .position(|uri| uri.path == path)
            .ok_or_else(|| MoteError::not_found(format!("{} has no URI /{path}", self.id)))?;
        self.uris.remove(index);
        debug!(service = %self.id, path = %path, "URI unregistered");
        Ok(())
    }

    /// Drop every URI registration
    pub fn clear_uris(&mut self) {
        self.uris.clear();
    }

    /// Registration for a normalized path
    pub fn uri(&self, path: &str) -> Option<&UriRegistration> {
        self.uris.iter().find(|uri| uri.path == path)
    }

    pub(crate) fn uri_mut(&mut self, path: &str) -> Option<&mut UriRegistration> {
        self.uris.iter_mut().find(|uri| uri.path == path)
    }

    /// Install the virtual send callback
    pub fn set_virtual_sink(&mut self, sink: Box<dyn VirtualSocketSink>) {
        self.virtual_sink = Some(sink);
    }

    /// Use a fixed certificate for every handshake
    pub fn set_certificate(&mut self, chain: Vec<u8>, private_key: Vec<u8>) {
        self.certificate = Some(Credentials::Certificate { chain, private_key });
    }

    pub(crate) fn security_mut(&mut self) -> Option<&mut (dyn SecurityHandler + 'static)> {
        self.security.as_deref_mut()
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// All services of one endpoint
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: Vec<Service>,
}

impl ServiceRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest unused service id
    pub fn allocate_id(&self) -> Result<ServiceId> {
        (1..=ServiceId::MAX)
            .filter_map(ServiceId::new)
            .find(|id| self.services.iter().all(|service| service.id != *id))
            .ok_or_else(|| MoteError::resource_exhausted("no free service id"))
    }

    /// Add a service
    pub fn insert(&mut self, service: Service) {
        self.services.push(service);
    }

    /// Remove a service
    pub fn remove(&mut self, id: ServiceId) -> Option<Service> {
        let index = self.services.iter().position(|service| service.id == id)?;
        Some(self.services.remove(index))
    }

    /// Look up a service
    pub fn get(&self, id: ServiceId) -> Result<&Service> {
        self.services
            .iter()
            .find(|service| service.id == id)
            .ok_or_else(|| MoteError::not_found(format!("{id} is not registered")))
    }

    /// Look up a service mutably
    pub fn get_mut(&mut self, id: ServiceId) -> Result<&mut Service> {
        self.services
            .iter_mut()
            .find(|service| service.id == id)
            .ok_or_else(|| MoteError::not_found(format!("{id} is not registered")))
    }

    /// First service using `socket`
    pub fn by_socket(&self, socket: SocketId) -> Option<ServiceId> {
        self.on_socket(socket).next().map(Service::id)
    }

    /// Services using `socket`, in registration order
    pub fn on_socket(&self, socket: SocketId) -> impl Iterator<Item = &Service> {
        self.services.iter().filter(move |service| service.socket == socket)
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no service is registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// All services
    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }
}

/// Multiplexer callbacks answered from the registry
pub(crate) struct ServiceCallbacks<'a> {
    registry: &'a mut ServiceRegistry,
}

impl<'a> ServiceCallbacks<'a> {
    pub(crate) fn new(registry: &'a mut ServiceRegistry) -> Self {
        Self { registry }
    }
}

impl SocketCallbacks for ServiceCallbacks<'_> {
    fn virtual_send(&mut self, owner: ServiceId, peer: SocketAddr, data: &[u8]) -> Result<()> {
        let service = self.registry.get_mut(owner)?;
        let sink = service
            .virtual_sink
            .as_mut()
            .ok_or_else(|| MoteError::invalid(format!("{owner} has no virtual socket callback")))?;
        sink.send(owner, peer, data)
    }

    fn credentials(&mut self, owner: ServiceId, peer: SocketAddr) -> Option<Credentials> {
        let service = self.registry.get_mut(owner).ok()?;
        if let Some(certificate) = &service.certificate {
            return Some(certificate.clone());
        }
        service.security.as_mut()?.credentials(owner, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{InboundRequest, RequestDisposition};

    fn ignore() -> Box<dyn RequestHandler> {
        Box::new(|_: &InboundRequest| RequestDisposition::Ignore)
    }

    fn service(id: u8, socket: u32) -> Service {
        Service::new(
            ServiceId::new(id).unwrap(),
            0,
            5683,
            ServiceOptions::empty(),
            SocketId::from_raw(socket),
            None,
        )
    }

    #[test]
    fn test_allocate_smallest_free_id() {
        let mut registry = ServiceRegistry::new();
        assert_eq!(registry.allocate_id().unwrap().get(), 1);
        registry.insert(service(1, 1));
        registry.insert(service(3, 1));
        assert_eq!(registry.allocate_id().unwrap().get(), 2);
        registry.insert(service(2, 1));
        assert_eq!(registry.allocate_id().unwrap().get(), 4);
    }

    #[test]
    fn test_ids_exhausted() {
        let mut registry = ServiceRegistry::new();
        for id in 1..=ServiceId::MAX {
            registry.insert(service(id, 1));
        }
        assert!(registry.allocate_id().unwrap_err().is_resource_exhausted());
    }

    #[test]
    fn test_register_replaces_path() {
        let mut service = service(1, 1);
        service.register_uri("/test", MethodMask::GET, ignore());
        service.register_uri("other", MethodMask::POST, ignore());
        service.register_uri("test/", MethodMask::PUT, ignore());

        assert_eq!(service.uris().len(), 2);
        assert_eq!(service.uri("test").unwrap().methods(), MethodMask::PUT);
        assert_eq!(service.uris()[1].path(), "test");
    }

    #[test]
    fn test_unregister_unknown_path() {
        let mut service = service(1, 1);
        service.register_uri("a", MethodMask::GET, ignore());
        assert!(service.unregister_uri("b").is_err());
        service.unregister_uri("/a").unwrap();
        assert!(service.uris().is_empty());
    }

    #[test]
    fn test_by_socket_returns_first() {
        let mut registry = ServiceRegistry::new();
        registry.insert(service(2, 7));
        registry.insert(service(1, 7));
        registry.insert(service(3, 8));

        assert_eq!(registry.by_socket(SocketId::from_raw(7)).unwrap().get(), 2);
        assert_eq!(registry.on_socket(SocketId::from_raw(7)).count(), 2);
        assert!(registry.by_socket(SocketId::from_raw(9)).is_none());
    }

    #[test]
    fn test_certificate_takes_precedence() {
        struct Psk;
        impl SecurityHandler for Psk {
            fn credentials(&mut self, _: ServiceId, _: SocketAddr) -> Option<Credentials> {
                Some(Credentials::Password(b"secret".to_vec()))
            }
        }

        let secure = |id: u8| {
            Service::new(
                ServiceId::new(id).unwrap(),
                0,
                5684,
                ServiceOptions::SECURE,
                SocketId::from_raw(1),
                Some(Box::new(Psk)),
            )
        };
        let mut registry = ServiceRegistry::new();
        registry.insert(secure(1));
        registry.insert(secure(2));
        registry.insert(service(3, 2));
        registry
            .get_mut(ServiceId::new(2).unwrap())
            .unwrap()
            .set_certificate(vec![1], vec![2]);

        let peer = mote_testkit::peer(1, 5684);
        let mut callbacks = ServiceCallbacks::new(&mut registry);
        assert!(matches!(
            callbacks.credentials(ServiceId::new(1).unwrap(), peer),
            Some(Credentials::Password(_))
        ));
        assert!(matches!(
            callbacks.credentials(ServiceId::new(2).unwrap(), peer),
            Some(Credentials::Certificate { .. })
        ));
        assert!(callbacks.credentials(ServiceId::new(3).unwrap(), peer).is_none());
    }

    #[test]
    fn test_virtual_send_requires_sink() {
        let mut registry = ServiceRegistry::new();
        registry.insert(service(1, 1));
        let id = ServiceId::new(1).unwrap();
        let peer = mote_testkit::peer(1, 5683);

        assert!(ServiceCallbacks::new(&mut registry).virtual_send(id, peer, b"x").is_err());

        registry
            .get_mut(id)
            .unwrap()
            .set_virtual_sink(Box::new(|_: ServiceId, _: SocketAddr, _: &[u8]| Ok(())));
        assert!(ServiceCallbacks::new(&mut registry).virtual_send(id, peer, b"x").is_ok());
    }
}
