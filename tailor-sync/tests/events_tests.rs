use pretty_assertions::assert_eq;
use serde_json::json;
use tailor_sync::{NetworkMonitor, SyncEventBus, SyncEventKind};

#[tokio::test]
async fn subscribers_receive_their_kind_only() {
    let bus = SyncEventBus::new();
    let mut updates = bus.subscribe(SyncEventKind::DataUpdated);
    let mut favorites = bus.subscribe(SyncEventKind::FavoritesUpdated);

    assert_eq!(bus.publish(SyncEventKind::DataUpdated, json!({ "n": 1 })), 1);

    let event = updates.recv().await.unwrap();
    assert_eq!(event.kind, SyncEventKind::DataUpdated);
    assert_eq!(event.data, json!({ "n": 1 }));
    assert!(favorites.try_recv().is_err());
}

#[tokio::test]
async fn every_subscriber_gets_a_copy() {
    let bus = SyncEventBus::new();
    let mut a = bus.subscribe(SyncEventKind::StorageWarning);
    let mut b = bus.subscribe(SyncEventKind::StorageWarning);

    assert_eq!(bus.publish(SyncEventKind::StorageWarning, json!(95.0)), 2);
    assert_eq!(a.recv().await.unwrap().data, json!(95.0));
    assert_eq!(b.recv().await.unwrap().data, json!(95.0));
}

#[test]
fn events_before_subscribing_are_not_replayed() {
    let bus = SyncEventBus::new();
    assert_eq!(bus.publish(SyncEventKind::DeviceLoggedOut, json!(null)), 0);
    let mut rx = bus.subscribe(SyncEventKind::DeviceLoggedOut);
    assert!(rx.try_recv().is_err());
}

#[test]
fn dropped_receivers_are_pruned() {
    let bus = SyncEventBus::new();
    let rx = bus.subscribe(SyncEventKind::CrossTabUpdate);
    let _kept = bus.subscribe(SyncEventKind::CrossTabUpdate);
    assert_eq!(bus.subscriber_count(SyncEventKind::CrossTabUpdate), 2);

    drop(rx);
    assert_eq!(bus.subscriber_count(SyncEventKind::CrossTabUpdate), 1);
    assert_eq!(bus.publish(SyncEventKind::CrossTabUpdate, json!({})), 1);
}

#[test]
fn clones_share_subscribers() {
    let bus = SyncEventBus::new();
    let mut rx = bus.subscribe(SyncEventKind::DataUpdated);
    bus.clone().publish(SyncEventKind::DataUpdated, json!("x"));
    assert_eq!(rx.try_recv().unwrap().data, json!("x"));
}

#[test]
fn event_kinds_use_kebab_case_names() {
    let bus = SyncEventBus::new();
    let mut rx = bus.subscribe(SyncEventKind::FavoritesUpdated);
    bus.publish(SyncEventKind::FavoritesUpdated, json!([]));
    let event = rx.try_recv().unwrap();
    assert_eq!(
        serde_json::to_value(&event).unwrap(),
        json!({ "type": "favorites-updated", "data": [] })
    );
}

// --- Network monitor ---

#[tokio::test]
async fn network_monitor_wakes_watchers_on_transition_only() {
    let network = NetworkMonitor::new(false);
    let mut rx = network.subscribe();

    assert!(!network.set_online(false));
    assert!(!rx.has_changed().unwrap());

    assert!(network.set_online(true));
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
    assert!(network.clone().is_online());
}
