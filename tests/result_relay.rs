//! Result relay emission guarantees

use policy_sync::{PolicyKey, ResultRelay};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

async fn emit_counted(
    relay: &ResultRelay,
    key: &PolicyKey,
    scope: &str,
    message: &str,
    counter: &AtomicUsize,
) -> bool {
    relay
        .relay(key, scope, message, || async {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_emit_suppress_evict_reemit() {
    let relay = ResultRelay::new();
    let key = PolicyKey::new("cluster1", "root.parent");
    let counter = AtomicUsize::new(0);

    assert!(emit_counted(&relay, &key, "a", "Pending; waiting", &counter).await);
    assert!(!emit_counted(&relay, &key, "a", "Pending; waiting", &counter).await);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    assert!(relay.evict_if_recorded(&key, "a", "Pending; waiting"));
    assert!(relay.is_empty());

    assert!(emit_counted(&relay, &key, "a", "Pending; waiting", &counter).await);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_changed_message_is_emitted() {
    let relay = ResultRelay::new();
    let key = PolicyKey::new("cluster1", "root.parent");
    let counter = AtomicUsize::new(0);

    emit_counted(&relay, &key, "a", "Pending; waiting", &counter).await;
    emit_counted(&relay, &key, "a", "Compliant; ok", &counter).await;
    emit_counted(&relay, &key, "a", "Pending; waiting", &counter).await;

    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(relay.len(), 1);
}

#[tokio::test]
async fn test_scopes_and_subjects_are_independent() {
    let relay = ResultRelay::new();
    let first = PolicyKey::new("cluster1", "root.first");
    let second = PolicyKey::new("cluster1", "root.second");
    let counter = AtomicUsize::new(0);

    emit_counted(&relay, &first, "a", "Compliant; ok", &counter).await;
    emit_counted(&relay, &first, "b", "Compliant; ok", &counter).await;
    emit_counted(&relay, &second, "a", "Compliant; ok", &counter).await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(relay.len(), 3);

    assert_eq!(relay.evict_subject(&first), 2);
    assert_eq!(relay.len(), 1);
    assert!(relay.is_duplicate(&second, "a", "Compliant; ok"));
}

#[tokio::test]
async fn test_stale_record_does_not_evict_newer_message() {
    let relay = ResultRelay::new();
    let key = PolicyKey::new("cluster1", "root.parent");
    let counter = AtomicUsize::new(0);

    emit_counted(&relay, &key, "a", "Compliant; ok", &counter).await;

    assert!(!relay.evict_if_recorded(&key, "a", "Pending; waiting"));
    assert!(relay.is_duplicate(&key, "a", "Compliant; ok"));
}

#[tokio::test]
async fn test_failed_emission_is_not_recorded() {
    let relay = ResultRelay::new();
    let key = PolicyKey::new("cluster1", "root.parent");

    let result = relay
        .relay(&key, "a", "Compliant; ok", || async {
            Err::<(), String>("sink unavailable".to_string())
        })
        .await;
    assert_eq!(result, Err("sink unavailable".to_string()));
    assert!(relay.is_empty());
}

#[tokio::test]
async fn test_concurrent_relays_share_state() {
    let relay: Arc<ResultRelay> = Arc::new(ResultRelay::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for index in 0..8 {
        let relay = relay.clone();
        let counter = counter.clone();
        handles.push(tokio::spawn(async move {
            let key = PolicyKey::new("cluster1", format!("root.p{}", index % 4));
            emit_counted(&relay, &key, "a", "Compliant; ok", &counter).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(relay.len(), 4);
    assert!(counter.load(Ordering::SeqCst) >= 4);
}
