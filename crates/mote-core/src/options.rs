//! Service and request option bitmasks

use crate::effects::transport::AddressPreference;

bitflags::bitflags! {
    /// Options chosen when a service is initialized.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceOptions: u8 {
        /// Application-routed pseudo socket instead of a real UDP socket
        const VIRTUAL_SOCKET = 0x01;
        /// Secure the socket with the handshake engine
        const SECURE = 0x02;
        /// Bind an ephemeral port; the socket is never shared
        const EPHEMERAL_PORT = 0x04;
        /// Join the CoAP multicast groups on the service interface
        const MULTICAST_JOIN = 0x08;
        /// Bind the socket to the service interface
        const SELECT_INTERFACE = 0x10;
        /// Bypass link-layer security on the socket
        const BYPASS_LINK_SECURITY = 0x20;
        /// Answer requests without the secure channel
        const SECURE_BYPASS = 0x80;
    }
}

bitflags::bitflags! {
    /// Per-request transmission options.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestOptions: u8 {
        /// Prefer the long (global) source address
        const ADDRESS_LONG = 0x01;
        /// Prefer the short (mesh-local) source address
        const ADDRESS_SHORT = 0x02;
        /// Destination is a multicast group; responses may come from any member
        const MULTICAST = 0x04;
        /// Send without the secure channel even on a secure socket
        const SECURE_BYPASS = 0x08;
    }
}

impl RequestOptions {
    /// Source address preference these options select
    pub fn address_preference(self) -> AddressPreference {
        if self.contains(Self::ADDRESS_LONG) {
            AddressPreference::Long
        } else if self.contains(Self::ADDRESS_SHORT) {
            AddressPreference::Short
        } else {
            AddressPreference::Default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_preference_defaults() {
        assert_eq!(
            RequestOptions::empty().address_preference(),
            AddressPreference::Default
        );
        assert_eq!(
            (RequestOptions::ADDRESS_SHORT | RequestOptions::SECURE_BYPASS).address_preference(),
            AddressPreference::Short
        );
    }
}
