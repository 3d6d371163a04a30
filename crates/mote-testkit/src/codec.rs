//! Mock CoAP codec
//!
//! Messages travel as postcard-encoded `CoapMessage`s. The mock assigns message
//! ids from a counter, detects duplicates when a history size is configured and
//! keeps a retransmission queue for confirmable messages that follows the
//! configured count and interval with exponential backoff.

use mote_core::effects::{CodecEffects, Retransmission};
use mote_core::{CoapMessage, MessageId, MessageType, MoteError, ParseOutcome, Result, Tick};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct QueuedRetransmission {
    msg_id: MessageId,
    destination: SocketAddr,
    bytes: Vec<u8>,
    attempts: u8,
    due: Tick,
}

#[derive(Debug)]
struct CodecState {
    next_msg_id: MessageId,
    fail_builds: usize,
    built: Vec<CoapMessage>,
    parse_overrides: VecDeque<ParseOutcome>,
    history: VecDeque<(SocketAddr, MessageId)>,
    duplicate_buffer_size: u8,
    block_size: u16,
    resend_count: u8,
    resend_interval_secs: u8,
    queue: Vec<QueuedRetransmission>,
    deleted: Vec<MessageId>,
    now: Tick,
    fail_config: bool,
}

impl Default for CodecState {
    fn default() -> Self {
        Self {
            next_msg_id: 1,
            fail_builds: 0,
            built: Vec::new(),
            parse_overrides: VecDeque::new(),
            history: VecDeque::new(),
            duplicate_buffer_size: 0,
            block_size: 0,
            resend_count: 0,
            resend_interval_secs: 0,
            queue: Vec::new(),
            deleted: Vec::new(),
            now: 0,
            fail_config: false,
        }
    }
}

/// Mock codec handler; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockCodec {
    state: Arc<Mutex<CodecState>>,
}

impl MockCodec {
    /// Fresh codec with message ids starting at 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire encoding used by the mock
    pub fn encode(message: &CoapMessage) -> Vec<u8> {
        postcard::to_allocvec(message).expect("CoapMessage always serializes")
    }

    /// Decode bytes produced by `encode`
    pub fn decode(bytes: &[u8]) -> Option<CoapMessage> {
        postcard::from_bytes(bytes).ok()
    }

    /// Fail the next `count` builds
    pub fn fail_next_builds(&self, count: usize) {
        self.state.lock().fail_builds = count;
    }

    /// Make every configuration call fail
    pub fn fail_configuration(&self) {
        self.state.lock().fail_config = true;
    }

    /// Return `outcome` from the next parse instead of decoding
    pub fn push_parse_outcome(&self, outcome: ParseOutcome) {
        self.state.lock().parse_overrides.push_back(outcome);
    }

    /// Messages built so far, with their assigned ids
    pub fn built(&self) -> Vec<CoapMessage> {
        self.state.lock().built.clone()
    }

    /// Message ids whose retransmission record was deleted
    pub fn deleted_retransmissions(&self) -> Vec<MessageId> {
        self.state.lock().deleted.clone()
    }

    /// Message ids currently queued for retransmission
    pub fn queued_retransmissions(&self) -> Vec<MessageId> {
        self.state.lock().queue.iter().map(|q| q.msg_id).collect()
    }

    /// `(resend_count, resend_interval_secs)` last configured
    pub fn retransmission_params(&self) -> (u8, u8) {
        let state = self.state.lock();
        (state.resend_count, state.resend_interval_secs)
    }

    /// Duplicate history size last configured
    pub fn duplicate_buffer_size(&self) -> u8 {
        self.state.lock().duplicate_buffer_size
    }

    /// Block size last configured
    pub fn block_size(&self) -> u16 {
        self.state.lock().block_size
    }

    fn check_config(state: &CodecState) -> Result<()> {
        if state.fail_config {
            return Err(MoteError::internal("codec configuration rejected"));
        }
        Ok(())
    }
}

impl CodecEffects for MockCodec {
    fn parse(&mut self, bytes: &[u8], source: SocketAddr) -> ParseOutcome {
        let mut state = self.state.lock();
        if let Some(outcome) = state.parse_overrides.pop_front() {
            return outcome;
        }

        let Some(message) = Self::decode(bytes) else {
            return ParseOutcome::Malformed {
                reason: "not a postcard CoapMessage".to_string(),
            };
        };

        if state.duplicate_buffer_size > 0 && message.msg_type == MessageType::Confirmable {
            let key = (source, message.msg_id);
            if state.history.contains(&key) {
                return ParseOutcome::Duplicate;
            }
            state.history.push_back(key);
            while state.history.len() > usize::from(state.duplicate_buffer_size) {
                state.history.pop_front();
            }
        }

        ParseOutcome::Message(message)
    }

    fn build(&mut self, message: &mut CoapMessage, destination: SocketAddr) -> Result<Vec<u8>> {
        let mut state = self.state.lock();

        if message.msg_id == 0 {
            message.msg_id = state.next_msg_id;
            state.next_msg_id = state.next_msg_id.wrapping_add(1).max(1);
        }

        if state.fail_builds > 0 {
            state.fail_builds -= 1;
            return Err(MoteError::protocol("mock build failure"));
        }

        let bytes = Self::encode(message);
        state.built.push(message.clone());

        if message.msg_type == MessageType::Confirmable && state.resend_count > 0 {
            let due = state.now + u64::from(state.resend_interval_secs);
            state.queue.push(QueuedRetransmission {
                msg_id: message.msg_id,
                destination,
                bytes: bytes.clone(),
                attempts: 0,
                due,
            });
        }

        Ok(bytes)
    }

    fn set_duplicate_buffer_size(&mut self, size: u8) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_config(&state)?;
        state.duplicate_buffer_size = size;
        state.history.clear();
        Ok(())
    }

    fn set_block_size(&mut self, size: u16) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_config(&state)?;
        state.block_size = size;
        Ok(())
    }

    fn set_retransmission_params(&mut self, count: u8, interval_secs: u8) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_config(&state)?;
        state.resend_count = count;
        state.resend_interval_secs = interval_secs;
        Ok(())
    }

    fn delete_retransmission(&mut self, msg_id: MessageId) {
        let mut state = self.state.lock();
        state.queue.retain(|queued| queued.msg_id != msg_id);
        state.deleted.push(msg_id);
    }

    fn exec(&mut self, now: Tick) -> Vec<Retransmission> {
        let mut state = self.state.lock();
        state.now = now;
        let count = state.resend_count;
        let interval = u64::from(state.resend_interval_secs);

        let mut due = Vec::new();
        for queued in state.queue.iter_mut() {
            if queued.due <= now && queued.attempts < count {
                queued.attempts += 1;
                queued.due = now + (interval << queued.attempts);
                due.push(Retransmission {
                    msg_id: queued.msg_id,
                    destination: queued.destination,
                    bytes: queued.bytes.clone(),
                });
            }
        }
        state.queue.retain(|queued| queued.attempts < count);
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer;
    use mote_core::Code;

    #[test]
    fn test_build_assigns_ids_and_parses_back() {
        let mut codec = MockCodec::new();
        let mut message = CoapMessage::request(MessageType::NonConfirmable, Code::GET, "test");
        let bytes = codec.build(&mut message, peer(1, 5683)).unwrap();
        assert_eq!(message.msg_id, 1);

        match codec.parse(&bytes, peer(1, 5683)) {
            ParseOutcome::Message(parsed) => assert_eq!(parsed, message),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_detection() {
        let mut codec = MockCodec::new();
        codec.set_duplicate_buffer_size(4).unwrap();
        let message =
            CoapMessage::request(MessageType::Confirmable, Code::GET, "a").with_msg_id(7);
        let bytes = MockCodec::encode(&message);

        assert!(matches!(codec.parse(&bytes, peer(1, 1)), ParseOutcome::Message(_)));
        assert_eq!(codec.parse(&bytes, peer(1, 1)), ParseOutcome::Duplicate);
        assert!(matches!(codec.parse(&bytes, peer(2, 1)), ParseOutcome::Message(_)));
    }

    #[test]
    fn test_retransmission_backoff() {
        let mut codec = MockCodec::new();
        codec.set_retransmission_params(2, 2).unwrap();
        let mut message = CoapMessage::request(MessageType::Confirmable, Code::GET, "a");
        codec.build(&mut message, peer(1, 1)).unwrap();

        assert!(codec.exec(1).is_empty());
        assert_eq!(codec.exec(2).len(), 1);
        assert!(codec.exec(5).is_empty());
        assert_eq!(codec.exec(6).len(), 1);
        assert!(codec.queued_retransmissions().is_empty());
    }
}
