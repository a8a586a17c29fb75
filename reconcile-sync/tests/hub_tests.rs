use reconcile_sync::{DataStore, SubscriptionHub, SynchronizedData};
use reconcile_types::{DataSource, SourceKind, Timestamp};
use serde_json::{Value, json};
use std::time::Duration;

fn commit(store: &mut DataStore<Value>, n: i64) -> SynchronizedData<Value> {
    store.commit("k", json!(n), DataSource::new(SourceKind::Api), Timestamp::now())
}

fn make_store() -> DataStore<Value> {
    DataStore::new(Duration::from_secs(30), 0)
}

// ── Delivery ─────────────────────────────────────────────────────

#[tokio::test]
async fn subscribers_receive_commits_in_order() {
    let mut store = make_store();
    let mut hub = SubscriptionHub::new();
    let mut sub = hub.subscribe("k", "ui");

    for n in 0..3 {
        let value = commit(&mut store, n);
        assert_eq!(hub.notify("k", &value), 1);
    }

    for n in 0..3 {
        assert_eq!(sub.recv().await.unwrap().data, json!(n));
    }
    assert!(sub.try_recv().is_none());
    assert_eq!(sub.key(), "k");
    assert_eq!(sub.subscriber_id(), "ui");
}

#[test]
fn notify_only_reaches_subscribers_of_that_key() {
    let mut store = make_store();
    let mut hub = SubscriptionHub::new();
    let mut on_k = hub.subscribe("k", "a");
    let mut on_other = hub.subscribe("other", "b");

    let value = commit(&mut store, 1);
    hub.notify("k", &value);

    assert!(on_k.try_recv().is_some());
    assert!(on_other.try_recv().is_none());
    assert_eq!(hub.notify("nobody", &value), 0);
}

#[test]
fn resubscribing_replaces_previous_handle() {
    let mut store = make_store();
    let mut hub = SubscriptionHub::new();
    let mut old = hub.subscribe("k", "ui");
    let mut new = hub.subscribe("k", "ui");

    let value = commit(&mut store, 1);
    assert_eq!(hub.notify("k", &value), 1);
    assert!(new.try_recv().is_some());
    assert!(old.try_recv().is_none());
}

// ── Unsubscribe & pruning ────────────────────────────────────────

#[test]
fn unsubscribe_stops_delivery() {
    let mut store = make_store();
    let mut hub = SubscriptionHub::new();
    let mut sub = hub.subscribe("k", "ui");

    assert!(hub.unsubscribe("k", "ui"));
    assert!(!hub.unsubscribe("k", "ui"));

    let value = commit(&mut store, 1);
    assert_eq!(hub.notify("k", &value), 0);
    assert!(sub.try_recv().is_none());
}

#[test]
fn dropped_subscriptions_are_pruned() {
    let mut store = make_store();
    let mut hub = SubscriptionHub::new();
    let _kept = hub.subscribe("k", "a");
    let dropped = hub.subscribe("k", "b");
    drop(dropped);

    assert_eq!(hub.subscriber_count(), 1);
    let value = commit(&mut store, 1);
    assert_eq!(hub.notify("k", &value), 1);
    assert_eq!(hub.subscribers("k"), vec!["a".to_string()]);
}

#[test]
fn closed_subscription_drains_buffered_commits() {
    let mut store = make_store();
    let mut hub = SubscriptionHub::new();
    let mut sub = hub.subscribe("k", "ui");

    let value = commit(&mut store, 1);
    hub.notify("k", &value);
    sub.close();

    assert_eq!(sub.try_recv().unwrap().data, json!(1));
    assert_eq!(hub.subscriber_count(), 0);
}
