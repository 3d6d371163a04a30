//! Property test strategies for Mote types

use proptest::prelude::*;
use std::net::SocketAddr;

pub use proptest;

use mote_core::{Code, MessageType};

/// A handful of peers on a unique-local prefix, so collisions are likely
pub fn arb_peer() -> impl Strategy<Value = SocketAddr> {
    (1u16..4, prop_oneof![Just(5683u16), Just(5684u16)]).prop_map(|(host, port)| crate::peer(host, port))
}

/// Request message types
pub fn arb_request_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![Just(MessageType::Confirmable), Just(MessageType::NonConfirmable)]
}

/// Request methods
pub fn arb_method() -> impl Strategy<Value = Code> {
    prop_oneof![
        Just(Code::GET),
        Just(Code::POST),
        Just(Code::PUT),
        Just(Code::DELETE)
    ]
}

/// Short URI paths
pub fn arb_path() -> impl Strategy<Value = String> {
    "[a-z]{1,6}(/[a-z]{1,6}){0,2}"
}
