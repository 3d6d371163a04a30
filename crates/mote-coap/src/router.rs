//! Inbound request routing
//!
//! Only services holding a reference to the receiving socket are candidates.
//! The first one with a registration for the request path wins; a path match
//! whose method mask rejects the request is answered with 4.05 instead of
//! falling through to later services.

use crate::registry::ServiceRegistry;
use mote_core::{CoapMessage, Code, ServiceId, ServiceOptions, SocketId};

/// Routing decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Hand the request to `service`
    Matched {
        /// Service whose URI matched
        service: ServiceId,
        /// The service answers outside the secure channel
        bypass_security: bool,
    },
    /// The path exists but does not accept the method
    MethodNotAllowed {
        /// Service whose URI matched
        service: ServiceId,
    },
    /// No service on the socket knows the path
    NotFound,
}

impl Route {
    /// Error code to answer a confirmable request with, if any
    pub fn rejection_code(self) -> Option<Code> {
        match self {
            Self::Matched { .. } => None,
            Self::MethodNotAllowed { .. } => Some(Code::METHOD_NOT_ALLOWED),
            Self::NotFound => Some(Code::NOT_FOUND),
        }
    }
}

/// Route `message`, received on `socket`, to a service
pub fn resolve(registry: &ServiceRegistry, socket: SocketId, message: &CoapMessage) -> Route {
    let path = message.path();
    for service in registry.on_socket(socket) {
        let Some(uri) = service.uri(path) else {
            continue;
        };
        if !uri.methods().allows(message.code) {
            return Route::MethodNotAllowed {
                service: service.id(),
            };
        }
        return Route::Matched {
            service: service.id(),
            bypass_security: service.options().contains(ServiceOptions::SECURE_BYPASS),
        };
    }
    Route::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{InboundRequest, RequestDisposition};
    use crate::registry::Service;
    use mote_core::{MessageType, MethodMask};

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        let add = |registry: &mut ServiceRegistry, id: u8, socket: u32, options, path: &str, methods| {
            let mut service = Service::new(
                ServiceId::new(id).unwrap(),
                0,
                5683,
                options,
                SocketId::from_raw(socket),
                None,
            );
            service.register_uri(path, methods, Box::new(|_: &InboundRequest| RequestDisposition::Ignore));
            registry.insert(service);
        };
        add(&mut registry, 1, 1, ServiceOptions::empty(), "a", MethodMask::GET);
        add(&mut registry, 2, 1, ServiceOptions::SECURE_BYPASS, "b", MethodMask::GET | MethodMask::PUT);
        add(&mut registry, 3, 2, ServiceOptions::empty(), "c", MethodMask::GET);
        registry
    }

    fn request(code: Code, path: &str) -> CoapMessage {
        CoapMessage::request(MessageType::Confirmable, code, path)
    }

    #[test]
    fn test_matches_across_services_on_socket() {
        let registry = registry();
        assert_eq!(
            resolve(&registry, SocketId::from_raw(1), &request(Code::PUT, "/b")),
            Route::Matched {
                service: ServiceId::new(2).unwrap(),
                bypass_security: true
            }
        );
    }

    #[test]
    fn test_other_socket_is_not_consulted() {
        let registry = registry();
        assert_eq!(
            resolve(&registry, SocketId::from_raw(1), &request(Code::GET, "c")),
            Route::NotFound
        );
    }

    #[test]
    fn test_method_not_allowed() {
        let registry = registry();
        let route = resolve(&registry, SocketId::from_raw(1), &request(Code::POST, "a"));
        assert_eq!(
            route,
            Route::MethodNotAllowed {
                service: ServiceId::new(1).unwrap()
            }
        );
        assert_eq!(route.rejection_code(), Some(Code::METHOD_NOT_ALLOWED));
    }
}
