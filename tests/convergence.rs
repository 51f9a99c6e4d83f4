use pokersync::config::SyncConfig;
use pokersync::engine::{SyncEngine, SyncEvent};
use pokersync::protocol::Payload;
use pokersync::store::LocalStore;
use pokersync::transport::{BroadcastHub, BroadcastTransport, Transport};
use pokersync::types::{Role, Ticket};
use std::sync::Arc;
use std::time::Duration;

fn tickets(keys: &[&str]) -> Vec<Ticket> {
    keys.iter().map(|k| Ticket::new(*k, "")).collect()
}

fn update(keys: &[&str], timestamp: i64) -> Payload {
    Payload::UpdateIssues {
        issues: tickets(keys),
        timestamp: Some(timestamp),
        force_update: false,
    }
}

/// A raw host-tagged transport driven by the test, plus one participant engine
async fn setup() -> (Arc<BroadcastTransport>, SyncEngine, LocalStore) {
    let hub = Arc::new(BroadcastHub::new());
    let config = SyncConfig::default();

    let host = Arc::new(BroadcastTransport::new(hub.clone(), "host", config.clone()));
    host.connect("s1", "Host", true).await.unwrap();

    let store = LocalStore::in_memory();
    let transport = Arc::new(BroadcastTransport::new(hub, "p1", config.clone()));
    let engine = SyncEngine::new(transport, store.clone(), config);
    engine.start("s1", "P1", Role::Participant).await;
    (host, engine, store)
}

fn keys(store: &LocalStore) -> Vec<String> {
    store.tickets().into_iter().map(|t| t.key).collect()
}

#[tokio::test(start_paused = true)]
async fn test_shuffled_duplicated_updates_converge_on_newest() {
    let (host, engine, store) = setup().await;

    let a = update(&["A", "B"], 100);
    let b = update(&["A", "B", "C"], 200);
    let c = update(&["X", "Y", "Z"], 300);
    for payload in [c.clone(), a.clone(), b.clone(), c, a.clone(), b, a] {
        host.send(payload).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Let every redundant copy land
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(keys(&store), vec!["X", "Y", "Z"]);
    engine.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_other_order_converges_too() {
    let (host, engine, store) = setup().await;

    for payload in [
        update(&["A"], 100),
        update(&["X", "Y", "Z"], 300),
        update(&["A", "B"], 200),
        update(&["A"], 100),
    ] {
        host.send(payload).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(keys(&store), vec!["X", "Y", "Z"]);
    engine.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_forced_import_overrides_newer_list() {
    let (host, engine, store) = setup().await;

    host.send(update(&["A", "B"], 500)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    host.send(Payload::UpdateIssues {
        issues: tickets(&["NEW-1"]),
        timestamp: Some(1),
        force_update: true,
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(keys(&store), vec!["NEW-1"]);
    engine.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_empty_list_never_wipes_local_tickets() {
    let (host, engine, store) = setup().await;

    host.send(update(&["A"], 100)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    host.send(Payload::UpdateIssues {
        issues: Vec::new(),
        timestamp: Some(900),
        force_update: true,
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(keys(&store), vec!["A"]);
    engine.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_stops_after_first_accepted_update() {
    let (host, engine, _store) = setup().await;
    let scheduled = engine.pending_requests();
    assert!(scheduled > 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(engine.pending_requests() < scheduled);

    host.send(update(&["A"], 100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.pending_requests(), 0);

    // A later stale copy does not re-arm anything
    host.send(update(&["A"], 50)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(engine.pending_requests(), 0);
    engine.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reemitted_list_reaches_late_listener() {
    let (host, engine, _store) = setup().await;
    host.send(update(&["A", "B"], 100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Subscribed after the first application; the re-emits still arrive
    let mut events = engine.subscribe();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let mut updates = 0;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::IssuesUpdated(list) = event {
            assert_eq!(list.len(), 2);
            updates += 1;
        }
    }
    assert!(updates >= 1);
    engine.teardown().await;
}
