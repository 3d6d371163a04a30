//! Codec effect trait definitions
//!
//! The codec parses and builds CoAP messages and owns the low-level reliability
//! machinery: duplicate detection, blockwise reassembly and the retransmission
//! queue for confirmable messages.

use crate::errors::Result;
use crate::identifiers::{MessageId, Tick};
use crate::message::{CoapMessage, ParseOutcome};
use std::net::SocketAddr;

/// A message the codec wants sent again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retransmission {
    /// Message id of the retransmitted message
    pub msg_id: MessageId,
    /// Peer the message goes to
    pub destination: SocketAddr,
    /// Encoded message
    pub bytes: Vec<u8>,
}

/// CoAP codec collaborator
pub trait CodecEffects: Send {
    /// Parse inbound bytes received from `source`
    fn parse(&mut self, bytes: &[u8], source: SocketAddr) -> ParseOutcome;

    /// Encode `message` for `destination`.
    ///
    /// A zero `msg_id` is replaced with a freshly assigned id. Confirmable
    /// messages are recorded for retransmission.
    fn build(&mut self, message: &mut CoapMessage, destination: SocketAddr) -> Result<Vec<u8>>;

    /// Set the duplicate detection history length; zero disables it
    fn set_duplicate_buffer_size(&mut self, size: u8) -> Result<()>;

    /// Set the blockwise block size; zero disables blockwise transfer
    fn set_block_size(&mut self, size: u16) -> Result<()>;

    /// Set the retransmission count and initial interval
    fn set_retransmission_params(&mut self, count: u8, interval_secs: u8) -> Result<()>;

    /// Forget the retransmission record of `msg_id`, if any
    fn delete_retransmission(&mut self, msg_id: MessageId);

    /// Advance the retransmission clock and return messages due again
    fn exec(&mut self, now: Tick) -> Vec<Retransmission>;
}
