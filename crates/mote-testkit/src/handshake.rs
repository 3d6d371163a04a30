//! Mock handshake engine
//!
//! A toy protocol with observable behavior:
//!
//! - `connect` sends a `HELLO` flight and arms the session timer with the
//!   configured timeouts
//! - every inbound flight consumed by `continue_connecting` counts as one round;
//!   the channel is established after `rounds` of them (zero establishes on
//!   `connect`)
//! - an intermediate timer expiry re-sends the last flight; final expiry fails
//! - application records are `ENC:` + plaintext; `ALERT` is a close-notify

use mote_core::effects::{
    Credentials, HandshakeEngine, HandshakeIo, HandshakeParams, HandshakeRole, HandshakeSession,
    HandshakeStatus, ReadOutcome, TimerStatus,
};
use mote_core::{HandshakeTimeouts, MoteError, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

/// Prefix marking an application record
pub const RECORD_PREFIX: &[u8] = b"ENC:";
/// Close-notify alert bytes
pub const CLOSE_ALERT: &[u8] = b"ALERT";
/// Handshake flight bytes
pub const FLIGHT: &[u8] = b"HELLO";
/// Key block reported by established sessions
pub const KEYBLOCK: [u8; 40] = [0xAB; 40];

/// Behavior knobs for sessions created after the change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeScript {
    /// Inbound flights needed before the channel is established
    pub rounds: u32,
    /// Fail every handshake step
    pub fail: bool,
    /// Refuse to create sessions
    pub refuse_create: bool,
}

impl Default for HandshakeScript {
    fn default() -> Self {
        Self {
            rounds: 1,
            fail: false,
            refuse_create: false,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    script: HandshakeScript,
    created: Vec<HandshakeParams>,
    connects: Vec<(SocketAddr, Credentials, HandshakeTimeouts)>,
    alerts: Vec<SocketAddr>,
    dropped: Vec<SocketAddr>,
}

/// Mock handshake engine; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockHandshakeEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MockHandshakeEngine {
    /// Engine establishing after one inbound flight
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the behavior of sessions created from now on
    pub fn set_script(&self, script: HandshakeScript) {
        self.state.lock().script = script;
    }

    /// Parameters of every created session
    pub fn created(&self) -> Vec<HandshakeParams> {
        self.state.lock().created.clone()
    }

    /// Peers and credentials passed to `connect`
    pub fn connects(&self) -> Vec<(SocketAddr, Credentials, HandshakeTimeouts)> {
        self.state.lock().connects.clone()
    }

    /// Peers that were sent a close-notify
    pub fn alerts(&self) -> Vec<SocketAddr> {
        self.state.lock().alerts.clone()
    }

    /// Peers whose session context was destroyed
    pub fn dropped(&self) -> Vec<SocketAddr> {
        self.state.lock().dropped.clone()
    }

    /// Wrap plaintext as an application record
    pub fn record(plaintext: &[u8]) -> Vec<u8> {
        let mut record = RECORD_PREFIX.to_vec();
        record.extend_from_slice(plaintext);
        record
    }
}

impl HandshakeEngine for MockHandshakeEngine {
    fn create(&mut self, params: HandshakeParams) -> Result<Box<dyn HandshakeSession>> {
        let mut state = self.state.lock();
        if state.script.refuse_create {
            return Err(MoteError::resource_exhausted("mock engine refused session"));
        }
        state.created.push(params);
        Ok(Box::new(MockSession {
            engine: Arc::clone(&self.state),
            peer: params.peer,
            role: params.role,
            script: state.script,
            rounds_left: state.script.rounds,
            started: false,
            established: false,
        }))
    }
}

struct MockSession {
    engine: Arc<Mutex<EngineState>>,
    peer: SocketAddr,
    role: HandshakeRole,
    script: HandshakeScript,
    rounds_left: u32,
    started: bool,
    established: bool,
}

impl MockSession {
    fn establish(&mut self, io: &mut dyn HandshakeIo) -> HandshakeStatus {
        io.set_timer(0, 0);
        self.established = true;
        HandshakeStatus::Established
    }

    fn failed(reason: &str) -> HandshakeStatus {
        HandshakeStatus::Failed {
            reason: reason.to_string(),
        }
    }
}

impl HandshakeSession for MockSession {
    fn connect(
        &mut self,
        io: &mut dyn HandshakeIo,
        credentials: &Credentials,
        timeouts: HandshakeTimeouts,
    ) -> HandshakeStatus {
        self.started = true;
        self.engine
            .lock()
            .connects
            .push((self.peer, credentials.clone(), timeouts));

        if self.script.fail {
            return Self::failed("scripted failure");
        }

        if self.role == HandshakeRole::Server && io.recv().is_some() && self.rounds_left > 0 {
            self.rounds_left -= 1;
        }
        if self.rounds_left == 0 {
            return self.establish(io);
        }

        if io.send(FLIGHT).is_err() {
            return Self::failed("flight not sent");
        }
        io.set_timer(timeouts.min_ms, timeouts.max_ms);
        HandshakeStatus::WouldBlock
    }

    fn continue_connecting(&mut self, io: &mut dyn HandshakeIo) -> HandshakeStatus {
        if self.script.fail {
            return Self::failed("scripted failure");
        }
        if self.established {
            return HandshakeStatus::Established;
        }

        if io.recv().is_some() {
            self.rounds_left = self.rounds_left.saturating_sub(1);
            if self.rounds_left == 0 {
                return self.establish(io);
            }
            return match io.send(FLIGHT) {
                Ok(_) => HandshakeStatus::WouldBlock,
                Err(_) => Self::failed("flight not sent"),
            };
        }

        match io.timer_status() {
            TimerStatus::FinalExpired => Self::failed("handshake timeout"),
            TimerStatus::IntermediateExpired => match io.send(FLIGHT) {
                Ok(_) => HandshakeStatus::WouldBlock,
                Err(_) => Self::failed("flight not sent"),
            },
            TimerStatus::Running | TimerStatus::Cancelled => HandshakeStatus::WouldBlock,
        }
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn read(&mut self, io: &mut dyn HandshakeIo) -> ReadOutcome {
        let Some(record) = io.recv() else {
            return ReadOutcome::WouldBlock;
        };
        if record == CLOSE_ALERT {
            return ReadOutcome::PeerClosed;
        }
        match record.strip_prefix(RECORD_PREFIX) {
            Some(plaintext) => ReadOutcome::Data(plaintext.to_vec()),
            None => ReadOutcome::Failed {
                reason: "bad record".to_string(),
            },
        }
    }

    fn send_message(&mut self, io: &mut dyn HandshakeIo, payload: &[u8]) -> Result<usize> {
        if !self.established {
            return Err(MoteError::handshake("channel not established"));
        }
        io.send(&MockHandshakeEngine::record(payload))?;
        Ok(payload.len())
    }

    fn keyblock(&self) -> Option<Vec<u8>> {
        self.established.then(|| KEYBLOCK.to_vec())
    }

    fn send_close_alert(&mut self, io: &mut dyn HandshakeIo) {
        let _ = io.send(CLOSE_ALERT);
        self.engine.lock().alerts.push(self.peer);
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.engine.lock().dropped.push(self.peer);
    }
}
