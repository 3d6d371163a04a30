//! Multiplexer behavior against the mock collaborators

use assert_matches::assert_matches;
use mote_core::effects::{Credentials, MulticastAction, SendMeta};
use mote_core::{HandshakeTimeouts, MoteError, Result, ServiceId, SessionConfig, SocketId};
use mote_testkit::handshake::{CLOSE_ALERT, FLIGHT, KEYBLOCK};
use mote_testkit::{
    init_test_tracing, local_addr, peer, HandshakeScript, ManualScheduler, MockHandshakeEngine,
    MockTransport,
};
use mote_transport::{
    Multiplexer, OutboundDatagram, SendOutcome, SessionState, SocketCallbacks, SocketSpec,
    TransportEvent, COAP_MULTICAST_GROUPS,
};
use proptest::prelude::*;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

#[derive(Default)]
struct TestCallbacks {
    sink: bool,
    virtual_sent: Vec<(ServiceId, SocketAddr, Vec<u8>)>,
    no_credentials: bool,
}

impl SocketCallbacks for TestCallbacks {
    fn virtual_send(&mut self, owner: ServiceId, peer: SocketAddr, data: &[u8]) -> Result<()> {
        if !self.sink {
            return Err(MoteError::not_found("no virtual sink"));
        }
        self.virtual_sent.push((owner, peer, data.to_vec()));
        Ok(())
    }

    fn credentials(&mut self, _owner: ServiceId, _peer: SocketAddr) -> Option<Credentials> {
        (!self.no_credentials).then(|| Credentials::PreSharedKey {
            identity: b"client".to_vec(),
            key: vec![7; 16],
        })
    }
}

struct Harness {
    mux: Multiplexer,
    transport: MockTransport,
    scheduler: ManualScheduler,
    engine: MockHandshakeEngine,
    callbacks: TestCallbacks,
}

impl Harness {
    fn new(config: SessionConfig) -> Self {
        init_test_tracing();
        let transport = MockTransport::new();
        let scheduler = ManualScheduler::new();
        let engine = MockHandshakeEngine::new();
        let mux = Multiplexer::new(
            Box::new(transport.clone()),
            Box::new(scheduler.clone()),
            Box::new(engine.clone()),
            &config,
        );
        Self {
            mux,
            transport,
            scheduler,
            engine,
            callbacks: TestCallbacks::default(),
        }
    }

    fn open(&mut self, port: u16, secure: bool) -> SocketId {
        self.mux.open(spec(port, secure)).unwrap()
    }

    fn inject(&mut self, port: u16, from: SocketAddr, bytes: &[u8]) {
        self.transport
            .inject(port, from, Some(local_addr()), bytes.to_vec());
        self.mux.poll(&mut self.callbacks);
    }

    fn send(&mut self, socket: SocketId, to: SocketAddr, payload: &[u8]) -> Result<SendOutcome> {
        self.mux.send(
            OutboundDatagram {
                socket,
                destination: to,
                payload,
                meta: SendMeta::default(),
                bypass_security: false,
            },
            &mut self.callbacks,
        )
    }
}

fn spec(port: u16, secure: bool) -> SocketSpec {
    SocketSpec {
        owner: ServiceId::new(1).unwrap(),
        port,
        ephemeral: false,
        secure,
        real: true,
        bypass_link_security: false,
        multicast_join: false,
        interface: None,
        handshake_timeouts: HandshakeTimeouts {
            min_ms: 1000,
            max_ms: 4000,
        },
    }
}

fn session_config(max_handshakes: u8, max_sessions: u8) -> SessionConfig {
    SessionConfig {
        max_sessions,
        max_concurrent_handshakes: max_handshakes,
        closed_timeout_secs: 100,
        open_timeout_secs: 50,
        ongoing_timeout_secs: 10,
        ..SessionConfig::default()
    }
}

#[test]
fn test_same_tuple_shares_one_socket() {
    let mut h = Harness::new(SessionConfig::default());
    let a = h.open(5683, false);
    let b = h.open(5683, false);

    assert_eq!(a, b);
    assert_eq!(h.mux.socket(a).unwrap().ref_count(), 2);
    assert_eq!(h.transport.opened().len(), 1);

    assert_eq!(h.mux.close(a, &mut h.callbacks).unwrap(), 1);
    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.mux.close(a, &mut h.callbacks).unwrap(), 0);
    assert_eq!(h.transport.open_count(), 0);
    assert!(h.mux.socket(a).is_none());
    assert_matches!(h.mux.close(a, &mut h.callbacks), Err(MoteError::NotFound { .. }));
}

#[test]
fn test_different_tuples_get_separate_sockets() {
    let mut h = Harness::new(SessionConfig::default());
    let plain = h.open(5683, false);
    let secure = h.open(5684, true);
    let mut virtual_spec = spec(5683, false);
    virtual_spec.real = false;
    let virtual_socket = h.mux.open(virtual_spec).unwrap();

    assert_ne!(plain, secure);
    assert_ne!(plain, virtual_socket);
    assert_eq!(h.transport.opened().len(), 2);
}

#[test]
fn test_ephemeral_sockets_never_shared() {
    let mut h = Harness::new(SessionConfig::default());
    let mut ephemeral = spec(0, false);
    ephemeral.ephemeral = true;
    let a = h.mux.open(ephemeral).unwrap();
    let b = h.mux.open(ephemeral).unwrap();

    assert_ne!(a, b);
    assert_ne!(
        h.mux.socket(a).unwrap().listen_port(),
        h.mux.socket(b).unwrap().listen_port()
    );
}

#[test]
fn test_multicast_joined_and_left_with_last_holder() {
    let mut h = Harness::new(SessionConfig::default());
    let mut multicast = spec(5683, false);
    multicast.multicast_join = true;
    multicast.interface = Some(2);
    let id = h.mux.open(multicast).unwrap();
    h.mux.open(multicast).unwrap();

    let joins = h.transport.memberships();
    assert_eq!(joins.len(), 3);
    assert!(joins
        .iter()
        .all(|(_, action, _, iface)| *action == MulticastAction::Join && *iface == 2));
    let groups: Vec<Ipv6Addr> = joins.iter().map(|(_, _, group, _)| *group).collect();
    assert_eq!(groups, COAP_MULTICAST_GROUPS.to_vec());

    h.mux.close(id, &mut h.callbacks).unwrap();
    assert_eq!(h.transport.memberships().len(), 3);
    h.mux.close(id, &mut h.callbacks).unwrap();
    let leaves: Vec<_> = h
        .transport
        .memberships()
        .into_iter()
        .filter(|(_, action, _, _)| *action == MulticastAction::Leave)
        .collect();
    assert_eq!(leaves.len(), 3);
}

#[test]
fn test_plain_receive_emits_event() {
    let mut h = Harness::new(SessionConfig::default());
    let socket = h.open(5683, false);
    h.inject(5683, peer(1, 40000), b"coap");

    assert_eq!(
        h.mux.drain_events(),
        vec![TransportEvent::Received {
            socket,
            peer: peer(1, 40000),
            local: local_addr(),
            data: b"coap".to_vec(),
        }]
    );
}

#[test]
fn test_datagram_without_destination_dropped() {
    let mut h = Harness::new(SessionConfig::default());
    h.open(5683, false);
    h.transport.inject(5683, peer(1, 1), None, b"x".to_vec());
    h.transport.inject(
        5683,
        peer(1, 1),
        Some(IpAddr::V6(mote_core::effects::transport::UNKNOWN_DESTINATION)),
        b"y".to_vec(),
    );
    h.mux.poll(&mut h.callbacks);
    assert!(h.mux.drain_events().is_empty());
}

#[test]
fn test_plain_send_carries_source_metadata() {
    let mut h = Harness::new(SessionConfig::default());
    let socket = h.open(5683, false);
    let outcome = h
        .mux
        .send(
            OutboundDatagram {
                socket,
                destination: peer(2, 5683),
                payload: b"req",
                meta: SendMeta {
                    source: Some(local_addr()),
                    ..SendMeta::default()
                },
                bypass_security: false,
            },
            &mut h.callbacks,
        )
        .unwrap();

    assert_eq!(outcome, SendOutcome::Sent(3));
    let sent = h.transport.sent();
    assert_eq!(sent[0].meta.source, Some(local_addr()));
    assert_eq!(sent[0].destination, peer(2, 5683));
}

#[test]
fn test_virtual_socket_requires_sink() {
    let mut h = Harness::new(SessionConfig::default());
    let mut virtual_spec = spec(5683, false);
    virtual_spec.real = false;
    let socket = h.mux.open(virtual_spec).unwrap();

    assert_matches!(h.send(socket, peer(1, 1), b"x"), Err(MoteError::NotFound { .. }));

    h.callbacks.sink = true;
    assert_eq!(h.send(socket, peer(1, 1), b"x").unwrap(), SendOutcome::Sent(1));
    assert_eq!(h.callbacks.virtual_sent.len(), 1);

    h.mux
        .virtual_receive(socket, peer(1, 1), b"in".to_vec(), &mut h.callbacks)
        .unwrap();
    assert_matches!(
        h.mux.next_event(),
        Some(TransportEvent::Received { data, .. }) if data == b"in"
    );
}

#[test]
fn test_client_handshake_then_encrypted_send() {
    let mut h = Harness::new(SessionConfig::default());
    let socket = h.open(5684, true);
    let server = peer(9, 5684);

    assert_eq!(h.send(socket, server, b"GET").unwrap(), SendOutcome::HandshakePending);
    assert_eq!(h.mux.session_state(socket, server), Some(SessionState::HandshakeOngoing));
    assert_eq!(h.transport.take_sent()[0].payload, FLIGHT);
    assert_eq!(h.send(socket, server, b"GET").unwrap(), SendOutcome::HandshakePending);

    h.inject(5684, server, b"server-flight");
    assert_eq!(h.mux.session_state(socket, server), Some(SessionState::Ok));
    assert_matches!(
        h.mux.next_event(),
        Some(TransportEvent::SecurityEstablished { keyblock, peer, .. })
            if keyblock == KEYBLOCK.to_vec() && peer == server
    );

    assert_eq!(h.send(socket, server, b"GET").unwrap(), SendOutcome::Sent(3));
    assert_eq!(h.transport.take_sent()[0].payload, MockHandshakeEngine::record(b"GET"));

    h.inject(5684, server, &MockHandshakeEngine::record(b"2.05"));
    assert_matches!(
        h.mux.next_event(),
        Some(TransportEvent::Received { data, .. }) if data == b"2.05"
    );
    assert!(!h.mux.socket(socket).unwrap().has_pending());
}

#[test]
fn test_server_session_on_first_datagram() {
    let mut h = Harness::new(SessionConfig::default());
    let socket = h.open(5684, true);
    let client = peer(3, 50000);

    h.inject(5684, client, b"client-hello");
    assert_eq!(h.mux.session_state(socket, client), Some(SessionState::Ok));
    assert_eq!(h.engine.connects().len(), 1);
    assert_matches!(
        h.mux.next_event(),
        Some(TransportEvent::SecurityEstablished { .. })
    );
}

#[test]
fn test_missing_credentials_rejects_session() {
    let mut h = Harness::new(SessionConfig::default());
    h.callbacks.no_credentials = true;
    let socket = h.open(5684, true);
    h.inject(5684, peer(3, 1), b"hello");
    assert!(h.mux.session_state(socket, peer(3, 1)).is_none());
    assert!(h.engine.created().is_empty());
}

#[test]
fn test_multicast_destination_dropped_on_secure_socket() {
    let mut h = Harness::new(SessionConfig::default());
    let socket = h.open(5684, true);
    h.transport.inject(
        5684,
        peer(3, 1),
        Some(IpAddr::V6(COAP_MULTICAST_GROUPS[0])),
        b"hello".to_vec(),
    );
    h.mux.poll(&mut h.callbacks);
    assert!(h.mux.session_state(socket, peer(3, 1)).is_none());
}

#[test]
fn test_admission_evicts_oldest_closed_session() {
    let mut h = Harness::new(session_config(2, 2));
    let socket = h.open(5684, true);

    h.mux.exec(1, &mut h.callbacks);
    h.inject(5684, peer(1, 1), b"hello");
    h.mux.exec(2, &mut h.callbacks);
    h.inject(5684, peer(2, 1), b"hello");

    h.mux
        .close_secure_connection(socket, peer(2, 1), &mut h.callbacks)
        .unwrap();
    h.mux
        .close_secure_connection(socket, peer(1, 1), &mut h.callbacks)
        .unwrap();
    assert_eq!(h.engine.alerts(), vec![peer(2, 1), peer(1, 1)]);

    h.inject(5684, peer(3, 1), b"hello");
    assert!(h.mux.session_state(socket, peer(1, 1)).is_none());
    assert_eq!(h.mux.session_state(socket, peer(2, 1)), Some(SessionState::Closed));
    assert_eq!(h.mux.session_state(socket, peer(3, 1)), Some(SessionState::Ok));
    assert_eq!(h.mux.sessions().len(), 2);
}

#[test]
fn test_admission_fails_when_full_and_none_closed() {
    let mut h = Harness::new(session_config(2, 2));
    let socket = h.open(5684, true);
    h.inject(5684, peer(1, 1), b"hello");
    h.inject(5684, peer(2, 1), b"hello");
    h.inject(5684, peer(3, 1), b"hello");

    assert!(h.mux.session_state(socket, peer(3, 1)).is_none());
    assert_eq!(h.mux.sessions().len(), 2);
}

#[test]
fn test_concurrent_handshake_limit() {
    let mut h = Harness::new(session_config(1, 3));
    h.engine.set_script(HandshakeScript {
        rounds: 3,
        ..HandshakeScript::default()
    });
    let socket = h.open(5684, true);
    h.inject(5684, peer(1, 1), b"hello");
    h.inject(5684, peer(2, 1), b"hello");

    assert_eq!(
        h.mux.session_state(socket, peer(1, 1)),
        Some(SessionState::HandshakeOngoing)
    );
    assert!(h.mux.session_state(socket, peer(2, 1)).is_none());
    assert_matches!(
        h.send(socket, peer(4, 1), b"x"),
        Err(MoteError::ResourceExhausted { .. })
    );
}

#[test]
fn test_handshake_timer_intermediate_then_final() {
    let mut h = Harness::new(SessionConfig::default());
    let socket = h.open(5684, true);
    let server = peer(9, 5684);

    h.send(socket, server, b"GET").unwrap();
    h.transport.take_sent();
    let timer_id = h.engine.created()[0].timer_id;
    assert_eq!(h.scheduler.armed_interval(timer_id), Some(1000));

    // 4000 ms budget in 1000 ms steps: three re-sends, then failure
    for _ in 0..3 {
        h.scheduler.take(timer_id);
        h.mux.on_timer(timer_id, &mut h.callbacks);
        assert_eq!(h.transport.take_sent()[0].payload, FLIGHT);
        assert_eq!(h.scheduler.armed_interval(timer_id), Some(1000));
    }

    h.scheduler.take(timer_id);
    h.mux.on_timer(timer_id, &mut h.callbacks);
    assert!(h.mux.session_state(socket, server).is_none());
    assert_matches!(
        h.mux.next_event(),
        Some(TransportEvent::SessionTerminated { peer, .. }) if peer == server
    );
    assert!(h.engine.dropped().contains(&server));

    // stale firing after teardown is ignored
    h.mux.on_timer(timer_id, &mut h.callbacks);
    assert!(h.mux.next_event().is_none());
}

#[test]
fn test_failed_handshake_removes_session() {
    let mut h = Harness::new(SessionConfig::default());
    h.engine.set_script(HandshakeScript {
        fail: true,
        ..HandshakeScript::default()
    });
    let socket = h.open(5684, true);
    assert_matches!(
        h.send(socket, peer(1, 1), b"x"),
        Err(MoteError::Handshake { .. })
    );
    assert!(h.mux.sessions().is_empty());
}

#[test]
fn test_peer_close_alert_closes_session() {
    let mut h = Harness::new(SessionConfig::default());
    let socket = h.open(5684, true);
    h.inject(5684, peer(1, 1), b"hello");
    h.mux.drain_events();

    h.inject(5684, peer(1, 1), CLOSE_ALERT);
    assert_eq!(h.mux.session_state(socket, peer(1, 1)), Some(SessionState::Closed));
    assert_eq!(
        h.mux.drain_events(),
        vec![TransportEvent::SessionTerminated {
            socket,
            peer: peer(1, 1)
        }]
    );

    // a new datagram from the same peer starts over
    h.inject(5684, peer(1, 1), b"hello");
    assert_eq!(h.mux.session_state(socket, peer(1, 1)), Some(SessionState::Ok));
}

#[test]
fn test_exec_sweeps_by_state() {
    let mut h = Harness::new(session_config(2, 3));
    h.engine.set_script(HandshakeScript {
        rounds: 3,
        ..HandshakeScript::default()
    });
    let socket = h.open(5684, true);
    h.inject(5684, peer(1, 1), b"hello");

    h.mux.exec(9, &mut h.callbacks);
    assert!(h.mux.session_state(socket, peer(1, 1)).is_some());
    h.mux.exec(10, &mut h.callbacks);
    assert!(h.mux.session_state(socket, peer(1, 1)).is_none());
    assert_matches!(
        h.mux.next_event(),
        Some(TransportEvent::SessionTerminated { .. })
    );
}

#[test]
fn test_socket_teardown_closes_sessions_first() {
    let mut h = Harness::new(SessionConfig::default());
    let socket = h.open(5684, true);
    h.inject(5684, peer(1, 1), b"hello");
    h.inject(5684, peer(2, 1), b"hello");
    h.mux.drain_events();
    h.transport.take_sent();

    h.mux.close(socket, &mut h.callbacks).unwrap();

    let alerts: Vec<_> = h.transport.sent().into_iter().map(|s| s.payload).collect();
    assert_eq!(alerts, vec![CLOSE_ALERT.to_vec(), CLOSE_ALERT.to_vec()]);
    assert!(h.mux.sessions().is_empty());
    assert_eq!(h.transport.closed().len(), 1);
    let terminated = h
        .mux
        .drain_events()
        .into_iter()
        .filter(|event| matches!(event, TransportEvent::SessionTerminated { .. }))
        .count();
    assert_eq!(terminated, 2);
}

#[test]
fn test_secure_bypass_sends_plaintext() {
    let mut h = Harness::new(SessionConfig::default());
    let socket = h.open(5684, true);
    let outcome = h
        .mux
        .send(
            OutboundDatagram {
                socket,
                destination: peer(1, 1),
                payload: b"plain",
                meta: SendMeta::default(),
                bypass_security: true,
            },
            &mut h.callbacks,
        )
        .unwrap();
    assert_eq!(outcome, SendOutcome::Sent(5));
    assert!(h.mux.sessions().is_empty());
    assert_eq!(h.transport.sent()[0].payload, b"plain");
}

proptest! {
    #[test]
    fn prop_socket_refcount_tracks_opens(opens in 1usize..6, secure in any::<bool>()) {
        let mut h = Harness::new(SessionConfig::default());
        let mut ids = Vec::new();
        for _ in 0..opens {
            ids.push(h.open(5683, secure));
        }
        prop_assert!(ids.iter().all(|id| *id == ids[0]));
        prop_assert_eq!(h.mux.socket(ids[0]).unwrap().ref_count() as usize, opens);

        for remaining in (0..opens).rev() {
            prop_assert_eq!(h.mux.close(ids[0], &mut h.callbacks).unwrap() as usize, remaining);
        }
        prop_assert!(h.mux.sockets().is_empty());
        prop_assert_eq!(h.transport.open_count(), 0);
    }
}
