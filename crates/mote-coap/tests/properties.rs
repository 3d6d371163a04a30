//! Transaction table properties

use mote_coap::{Endpoint, OutboundRequest, ResponseCallback, ResponseOutcome, Role};
use mote_core::{Code, EngineConfig, MessageType, ServiceOptions};
use mote_testkit::strategies::{arb_peer, arb_request_type};
use mote_testkit::{MockEffects, ScriptedRandom};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

fn counter() -> (Arc<Mutex<usize>>, ResponseCallback) {
    let fired = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&fired);
    (
        fired,
        Box::new(move |_: ResponseOutcome| *sink.lock() += 1),
    )
}

proptest! {
    #[test]
    fn prop_tokens_unique_per_peer(
        draws in prop::collection::vec(0u8..3, 1..24),
        peers in prop::collection::vec(arb_peer(), 1..12),
    ) {
        // a three-letter alphabet forces frequent collisions
        let script = draws.iter().map(|b| vec![*b; 4]).collect::<Vec<_>>();
        let effects = MockEffects::new(0);
        let mut endpoint = Endpoint::new(
            EngineConfig::testing(),
            effects.handlers_with_random(Box::new(ScriptedRandom::new(script))),
        )
        .unwrap();
        let id = endpoint.initialize(0, 5683, ServiceOptions::empty(), None).unwrap();

        for peer in &peers {
            let (_, callback) = counter();
            endpoint.request_send(
                id,
                OutboundRequest::new(*peer, MessageType::Confirmable, Code::GET, "t"),
                Some(callback),
            );
        }

        let mut tokens: BTreeMap<_, BTreeSet<Vec<u8>>> = BTreeMap::new();
        for transaction in endpoint.transactions().unwrap().iter() {
            prop_assert_eq!(transaction.role(), Role::Client);
            let fresh = tokens
                .entry(transaction.peer())
                .or_default()
                .insert(transaction.token().as_slice().to_vec());
            prop_assert!(fresh, "token reused toward {}", transaction.peer());
        }
    }

    #[test]
    fn prop_deadline_monotonic(
        sent_at in 0u64..100,
        later in 0u64..60,
        msg_type in arb_request_type(),
    ) {
        let effects = MockEffects::new(1);
        let mut endpoint = Endpoint::new(EngineConfig::testing(), effects.handlers()).unwrap();
        let id = endpoint.initialize(0, 5683, ServiceOptions::empty(), None).unwrap();
        endpoint.exec(sent_at);

        let (fired, callback) = counter();
        let msg_id = endpoint.request_send(
            id,
            OutboundRequest::new(mote_testkit::peer(1, 5683), msg_type, Code::GET, "t"),
            Some(callback),
        );
        prop_assert_ne!(msg_id, 0);
        let deadline = endpoint.transactions().unwrap().get(msg_id).unwrap().valid_until();

        let now = sent_at + later;
        endpoint.exec(now);
        if now > deadline {
            prop_assert_eq!(*fired.lock(), 1);
            prop_assert_eq!(endpoint.transaction_count(), 0);
        } else {
            prop_assert_eq!(*fired.lock(), 0);
            prop_assert_eq!(endpoint.transaction_count(), 1);
        }

        endpoint.exec(now + 1000);
        prop_assert_eq!(*fired.lock(), 1);
    }
}
