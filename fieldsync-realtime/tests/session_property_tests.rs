use fieldsync_core::{kinds, ActorId, Envelope, PresenceStatus, UserStatus};
use fieldsync_realtime::{
    ConnectionState, MessageRouter, PresenceReporter, PresenceSignal, RealtimeHealth,
    TransportSession,
};
use fieldsync_test_utils::fixtures::fast_config;
use fieldsync_test_utils::generators::arb_envelope;
use fieldsync_test_utils::MockConnector;
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn session(connector: &MockConnector) -> TransportSession {
    TransportSession::new(Arc::new(connector.clone()), MessageRouter::new(), fast_config())
}

async fn wait_for_state(session: &TransportSession, wanted: ConnectionState) {
    let mut states = session.subscribe_state();
    let reached = tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == wanted))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    assert!(reached, "session never reached {wanted:?}");
}

#[tokio::test]
async fn inbound_frames_reach_subscribers_in_order() {
    let connector = MockConnector::new();
    let session = session(&connector);
    let seen = Arc::new(Mutex::new(Vec::new()));
    session.router().subscribe_fn(kinds::HEARTBEAT, {
        let seen = seen.clone();
        move |envelope: &Envelope| {
            seen.lock().unwrap().push(envelope.data.clone());
            Ok(())
        }
    });

    session.connect(&ActorId::new("u1")).await.unwrap();
    let link = connector.last_link().unwrap();
    for n in 0..5 {
        link.push(&Envelope::new(kinds::HEARTBEAT, json!(n)));
    }
    link.push_text("not json");
    link.push(&Envelope::new(kinds::HEARTBEAT, json!(5)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().unwrap().len() < 6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), (0..6).map(|n| json!(n)).collect::<Vec<_>>());
    session.disconnect();
}

#[tokio::test]
async fn send_without_channel_is_dropped() {
    let connector = MockConnector::always_failing();
    let session = session(&connector);
    assert!(session.connect(&ActorId::new("u1")).await.is_err());
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!session.send(kinds::HEARTBEAT, json!(null)));
}

#[tokio::test]
async fn connect_twice_reuses_open_channel() {
    let connector = MockConnector::new();
    let session = session(&connector);
    session.connect(&ActorId::new("u1")).await.unwrap();
    session.connect(&ActorId::new("u1")).await.unwrap();
    assert_eq!(connector.attempts(), 1);
    session.disconnect();
}

#[tokio::test]
async fn session_gives_up_then_presence_recovers() {
    let connector = MockConnector::new();
    let session = session(&connector);
    let actor = ActorId::new("u1");
    session.connect(&actor).await.unwrap();
    let reporter = PresenceReporter::spawn(session.clone(), actor, fast_config().presence);
    let first = connector.wait_for_links(1).await;

    // Every session reconnect fails, then the server comes back.
    connector.fail_next(fast_config().reconnect.max_attempts);
    first.close();
    wait_for_state(&session, ConnectionState::Failed).await;

    let second = connector.wait_for_links(2).await;
    wait_for_state(&session, ConnectionState::Connected).await;
    assert_eq!(reporter.health(), RealtimeHealth::Healthy);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let online = second
                .sent()
                .iter()
                .filter_map(|e| e.payload::<UserStatus>().ok())
                .any(|s| s.status == PresenceStatus::Online);
            if online {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    reporter.sign_out().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn hidden_page_reports_away() {
    let connector = MockConnector::new();
    let session = session(&connector);
    let actor = ActorId::new("u1");
    session.connect(&actor).await.unwrap();
    let reporter = PresenceReporter::spawn(session.clone(), actor, fast_config().presence);
    let mut status = reporter.subscribe_status();

    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == PresenceStatus::Online))
        .await
        .unwrap()
        .unwrap();
    reporter.signal(PresenceSignal::Hidden);
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == PresenceStatus::Away))
        .await
        .unwrap()
        .unwrap();
    reporter.signal(PresenceSignal::Visible);
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| *s == PresenceStatus::Online))
        .await
        .unwrap()
        .unwrap();

    drop(status);
    reporter.sign_out().await;
}

proptest! {
    /// Every well-formed frame is delivered to each handler of its kind
    /// exactly once; other kinds see nothing.
    #[test]
    fn dispatch_reaches_every_handler_of_kind(
        envelopes in prop::collection::vec(arb_envelope(), 1..16),
        handlers in 1usize..4,
    ) {
        let router = MessageRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..handlers {
            let hits = hits.clone();
            router.subscribe_fn(kinds::HEARTBEAT, move |_: &Envelope| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let mut expected = 0;
        for envelope in &envelopes {
            let report = router.dispatch_text(&envelope.encode().unwrap());
            if envelope.kind == kinds::HEARTBEAT {
                expected += handlers;
                prop_assert_eq!(report.delivered, handlers);
            } else {
                prop_assert_eq!(report.delivered, 0);
            }
        }
        prop_assert_eq!(hits.load(Ordering::SeqCst), expected);
    }
}
