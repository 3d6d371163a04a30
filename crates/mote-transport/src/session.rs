//! Secure session table
//!
//! One `SecureSession` per (socket, peer). The table enforces two limits:
//!
//! 1. At most `max_concurrent_handshakes` sessions in `HandshakeOngoing`
//! 2. At most `max_sessions` sessions in any state; when full, the closed
//!    session with the oldest last contact is evicted, and if none is closed
//!    admission fails
//!
//! State moves forward only: `HandshakeOngoing -> Ok -> Closed`, or straight
//! from `HandshakeOngoing` to `Closed`.

use crate::timer::HandshakeTimer;
use mote_core::effects::{HandshakeRole, HandshakeSession};
use mote_core::{MoteError, Result, SessionConfig, SocketId, Tick, TimerId};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Lifecycle state of a secure session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Handshake flights are being exchanged
    HandshakeOngoing,
    /// Channel established
    Ok,
    /// Channel closed; kept for LRU reclamation
    Closed,
}

impl SessionState {
    /// Whether moving to `next` is allowed
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::HandshakeOngoing, Self::Ok)
                | (Self::HandshakeOngoing, Self::Closed)
                | (Self::Ok, Self::Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HandshakeOngoing => "handshake_ongoing",
            Self::Ok => "ok",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A secure channel to one peer over one socket
pub struct SecureSession {
    pub(crate) handle: Box<dyn HandshakeSession>,
    pub(crate) state: SessionState,
    pub(crate) last_contact: Tick,
    pub(crate) timer: HandshakeTimer,
    pub(crate) timer_id: TimerId,
    pub(crate) socket: SocketId,
    pub(crate) peer: SocketAddr,
    pub(crate) local: Option<IpAddr>,
    pub(crate) role: HandshakeRole,
}

impl fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureSession")
            .field("state", &self.state)
            .field("last_contact", &self.last_contact)
            .field("timer", &self.timer)
            .field("timer_id", &self.timer_id)
            .field("socket", &self.socket)
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl SecureSession {
    /// Wrap a freshly created handshake context
    pub fn new(
        handle: Box<dyn HandshakeSession>,
        socket: SocketId,
        peer: SocketAddr,
        local: Option<IpAddr>,
        timer_id: TimerId,
        role: HandshakeRole,
        now: Tick,
    ) -> Self {
        Self {
            handle,
            state: SessionState::HandshakeOngoing,
            last_contact: now,
            timer: HandshakeTimer::default(),
            timer_id,
            socket,
            peer,
            local,
            role,
        }
    }

    /// Move to `next`, refusing illegal transitions
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MoteError::internal(format!(
                "illegal session transition {} -> {} for {}",
                self.state, next, self.peer
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Remote peer
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Socket carrying the channel
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// Timer id used for scheduler requests
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Tick of the last datagram exchanged with the peer
    pub fn last_contact(&self) -> Tick {
        self.last_contact
    }

    /// Client or server side
    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    /// Two-stage timer state
    pub fn timer(&self) -> &HandshakeTimer {
        &self.timer
    }

    pub(crate) fn touch(&mut self, now: Tick) {
        self.last_contact = self.last_contact.max(now);
    }
}

/// Bounded table of secure sessions
#[derive(Debug)]
pub struct SessionManager {
    sessions: Vec<SecureSession>,
    max_sessions: u8,
    max_concurrent_handshakes: u8,
    closed_timeout_secs: u64,
    open_timeout_secs: u64,
    ongoing_timeout_secs: u64,
}

impl SessionManager {
    /// Empty table with limits from `config`
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: Vec::new(),
            max_sessions: config.max_sessions,
            max_concurrent_handshakes: config.max_concurrent_handshakes,
            closed_timeout_secs: config.closed_timeout_secs,
            open_timeout_secs: config.open_timeout_secs,
            ongoing_timeout_secs: config.ongoing_timeout_secs,
        }
    }

    /// Change the admission limits; existing sessions are kept
    pub fn set_limits(&mut self, max_handshakes: u8, max_sessions: u8) -> Result<()> {
        if max_handshakes == 0 || max_sessions == 0 {
            return Err(MoteError::invalid("session limits must be greater than 0"));
        }
        if max_handshakes > max_sessions {
            return Err(MoteError::invalid(format!(
                "max handshakes {max_handshakes} exceeds max sessions {max_sessions}"
            )));
        }
        self.max_concurrent_handshakes = max_handshakes;
        self.max_sessions = max_sessions;
        Ok(())
    }

    /// Current `(max_handshakes, max_sessions)`
    pub fn limits(&self) -> (u8, u8) {
        (self.max_concurrent_handshakes, self.max_sessions)
    }

    /// Number of sessions in handshake
    pub fn handshakes_in_progress(&self) -> usize {
        self.sessions
            .iter()
            .filter(|session| session.state == SessionState::HandshakeOngoing)
            .count()
    }

    /// Make room for one more handshake.
    ///
    /// Returns the evicted closed session, if one had to go. The caller owns
    /// its teardown.
    pub fn admit(&mut self) -> Result<Option<SecureSession>> {
        if self.handshakes_in_progress() >= usize::from(self.max_concurrent_handshakes) {
            return Err(MoteError::resource_exhausted(format!(
                "{} handshakes already in progress",
                self.max_concurrent_handshakes
            )));
        }

        if self.sessions.len() < usize::from(self.max_sessions) {
            return Ok(None);
        }

        let oldest_closed = self
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, session)| session.state == SessionState::Closed)
            .min_by_key(|(_, session)| session.last_contact)
            .map(|(index, _)| index);

        match oldest_closed {
            Some(index) => Ok(Some(self.sessions.remove(index))),
            None => Err(MoteError::resource_exhausted(format!(
                "session table full ({} sessions, none closed)",
                self.max_sessions
            ))),
        }
    }

    /// Smallest timer id not used by a live session
    pub fn allocate_timer_id(&self) -> Result<TimerId> {
        (TimerId::MIN..=TimerId::MAX)
            .filter(|raw| !self.sessions.iter().any(|s| s.timer_id.get() == *raw))
            .find_map(TimerId::new)
            .ok_or_else(|| MoteError::resource_exhausted("no free session timer id"))
    }

    /// Add an admitted session
    pub fn insert(&mut self, session: SecureSession) {
        self.sessions.push(session);
    }

    /// Session for a peer on a socket
    pub fn find(&self, socket: SocketId, peer: SocketAddr) -> Option<&SecureSession> {
        self.sessions
            .iter()
            .find(|session| session.socket == socket && session.peer == peer)
    }

    /// Session for a peer on a socket, mutably
    pub fn find_mut(&mut self, socket: SocketId, peer: SocketAddr) -> Option<&mut SecureSession> {
        self.sessions
            .iter_mut()
            .find(|session| session.socket == socket && session.peer == peer)
    }

    /// Session owning a timer id
    pub fn by_timer(&mut self, timer_id: TimerId) -> Option<&mut SecureSession> {
        self.sessions
            .iter_mut()
            .find(|session| session.timer_id == timer_id)
    }

    /// Remove the session for a peer on a socket
    pub fn remove(&mut self, socket: SocketId, peer: SocketAddr) -> Option<SecureSession> {
        let index = self
            .sessions
            .iter()
            .position(|session| session.socket == socket && session.peer == peer)?;
        Some(self.sessions.remove(index))
    }

    /// Remove every session carried by a socket
    pub fn drain_socket(&mut self, socket: SocketId) -> Vec<SecureSession> {
        let (drained, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sessions)
            .into_iter()
            .partition(|session| session.socket == socket);
        self.sessions = kept;
        drained
    }

    /// Inactivity budget for a state, in ticks
    pub fn timeout_for(&self, state: SessionState) -> u64 {
        match state {
            SessionState::HandshakeOngoing => self.ongoing_timeout_secs,
            SessionState::Ok => self.open_timeout_secs,
            SessionState::Closed => self.closed_timeout_secs,
        }
    }

    /// Remove sessions whose inactivity budget has run out at `now`
    pub fn sweep(&mut self, now: Tick) -> Vec<SecureSession> {
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.sessions)
            .into_iter()
            .partition(|session| {
                session
                    .last_contact
                    .saturating_add(self.timeout_for(session.state))
                    <= now
            });
        self.sessions = kept;
        expired
    }

    /// Number of sessions in any state
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Iterate over sessions
    pub fn iter(&self) -> impl Iterator<Item = &SecureSession> {
        self.sessions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use mote_core::effects::{Credentials, HandshakeIo, HandshakeStatus, ReadOutcome};
    use mote_core::HandshakeTimeouts;

    struct NullSession;

    impl HandshakeSession for NullSession {
        fn connect(
            &mut self,
            _io: &mut dyn HandshakeIo,
            _credentials: &Credentials,
            _timeouts: HandshakeTimeouts,
        ) -> HandshakeStatus {
            HandshakeStatus::WouldBlock
        }

        fn continue_connecting(&mut self, _io: &mut dyn HandshakeIo) -> HandshakeStatus {
            HandshakeStatus::WouldBlock
        }

        fn is_started(&self) -> bool {
            false
        }

        fn read(&mut self, _io: &mut dyn HandshakeIo) -> ReadOutcome {
            ReadOutcome::WouldBlock
        }

        fn send_message(&mut self, _io: &mut dyn HandshakeIo, payload: &[u8]) -> Result<usize> {
            Ok(payload.len())
        }

        fn keyblock(&self) -> Option<Vec<u8>> {
            None
        }

        fn send_close_alert(&mut self, _io: &mut dyn HandshakeIo) {}
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([0xfd00, 0, 0, 0, 0, 0, 0, 1], port))
    }

    fn session(manager: &SessionManager, port: u16, state: SessionState, now: Tick) -> SecureSession {
        let timer_id = manager.allocate_timer_id().unwrap();
        let mut session = SecureSession::new(
            Box::new(NullSession),
            SocketId::from_raw(1),
            peer(port),
            None,
            timer_id,
            HandshakeRole::Server,
            now,
        );
        session.state = state;
        session
    }

    fn manager(max_handshakes: u8, max_sessions: u8) -> SessionManager {
        let mut manager = SessionManager::new(&SessionConfig::default());
        manager.set_limits(max_handshakes, max_sessions).unwrap();
        manager
    }

    #[test]
    fn test_forward_only_transitions() {
        use SessionState::*;
        assert!(HandshakeOngoing.can_transition_to(Ok));
        assert!(HandshakeOngoing.can_transition_to(Closed));
        assert!(Ok.can_transition_to(Closed));
        assert!(!Ok.can_transition_to(HandshakeOngoing));
        assert!(!Closed.can_transition_to(Ok));
        assert!(!Closed.can_transition_to(HandshakeOngoing));
        assert!(!Closed.can_transition_to(Closed));

        let manager = manager(1, 1);
        let mut s = session(&manager, 1000, Closed, 0);
        assert_matches!(s.transition(Ok), Err(MoteError::Internal { .. }));
        assert_eq!(s.state(), Closed);
    }

    #[test]
    fn test_admission_fails_when_full_and_none_closed() {
        let mut manager = manager(2, 2);
        let a = session(&manager, 1, SessionState::Ok, 0);
        manager.insert(a);
        let b = session(&manager, 2, SessionState::Ok, 0);
        manager.insert(b);

        assert_matches!(manager.admit(), Err(MoteError::ResourceExhausted { .. }));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_admission_evicts_oldest_closed() {
        let mut manager = manager(1, 3);
        let a = session(&manager, 1, SessionState::Closed, 50);
        manager.insert(a);
        let b = session(&manager, 2, SessionState::Closed, 10);
        manager.insert(b);
        let c = session(&manager, 3, SessionState::Ok, 0);
        manager.insert(c);

        let evicted = manager.admit().unwrap().unwrap();
        assert_eq!(evicted.peer(), peer(2));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_handshake_limit_independent_of_occupancy() {
        let mut manager = manager(1, 3);
        let a = session(&manager, 1, SessionState::HandshakeOngoing, 0);
        manager.insert(a);
        assert_matches!(manager.admit(), Err(MoteError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_timer_ids_smallest_free() {
        let mut manager = manager(3, 3);
        let a = session(&manager, 1, SessionState::Ok, 0);
        assert_eq!(a.timer_id().get(), 1);
        manager.insert(a);
        let b = session(&manager, 2, SessionState::Ok, 0);
        assert_eq!(b.timer_id().get(), 2);
        manager.insert(b);

        manager.remove(SocketId::from_raw(1), peer(1));
        assert_eq!(manager.allocate_timer_id().unwrap().get(), 1);
    }

    #[test]
    fn test_sweep_uses_state_budgets() {
        let config = SessionConfig {
            closed_timeout_secs: 100,
            open_timeout_secs: 50,
            ongoing_timeout_secs: 10,
            ..SessionConfig::default()
        };
        let mut manager = SessionManager::new(&config);
        let ongoing = session(&manager, 1, SessionState::HandshakeOngoing, 0);
        manager.insert(ongoing);
        let open = session(&manager, 2, SessionState::Ok, 0);
        manager.insert(open);
        let closed = session(&manager, 3, SessionState::Closed, 0);
        manager.insert(closed);

        assert!(manager.sweep(9).is_empty());
        let expired = manager.sweep(10);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].peer(), peer(1));

        assert_eq!(manager.sweep(50).len(), 1);
        assert_eq!(manager.sweep(99).len(), 0);
        assert_eq!(manager.sweep(100).len(), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_limits_validated() {
        let mut manager = SessionManager::new(&SessionConfig::default());
        assert!(manager.set_limits(0, 3).is_err());
        assert!(manager.set_limits(4, 3).is_err());
        assert!(manager.set_limits(3, 3).is_ok());
        assert_eq!(manager.limits(), (3, 3));
    }
}
