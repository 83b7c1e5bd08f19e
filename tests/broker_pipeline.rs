//! Broker Pipeline Tests
//!
//! - Deliveries reach every socket in change feed order
//! - Replaces surface as deletes followed by updates
//! - Subscriptions that fail to evaluate are force-unsubscribed
//! - Unsubscribing or dropping a socket stops its pushes

mod common;

use aerolive::errors::LiveError;
use aerolive::registry::QueryId;
use aerolive::streamer::PushMessage;
use common::{collect_until, engine, identity, next_delivery, object, quiet_for, update_ids};
use serde_json::json;

// =============================================================================
// Ordering
// =============================================================================

/// Every socket sees the same changes with strictly increasing markers.
#[tokio::test]
async fn test_deliveries_follow_feed_order() {
    let engine = engine().await;
    let alice = identity("alice");

    let mut sockets = Vec::new();
    for _ in 0..3 {
        let (session, mut rx) = engine.register(alice.clone()).unwrap();
        engine
            .subscribe(session.id(), &json!({}), None, &alice, Some(QueryId::from("all")))
            .await
            .unwrap();
        next_delivery(&mut rx).await;
        sockets.push((session, rx));
    }

    let mut created = Vec::new();
    for n in 0..10 {
        let id = engine
            .create(object(&alice, json!({"n": n})), &alice)
            .await
            .unwrap();
        created.push(id.to_string());
    }

    for (_, rx) in sockets.iter_mut() {
        let mut markers = Vec::new();
        let mut seen = Vec::new();
        while seen.len() < created.len() {
            let delivery = next_delivery(rx).await;
            markers.push(delivery.marker);
            seen.extend(delivery.messages.iter().flat_map(update_ids));
        }
        assert_eq!(seen, created);
        assert!(markers.windows(2).all(|w| w[0] < w[1]));
    }
    engine.shutdown().await.unwrap();
}

// =============================================================================
// Replace Semantics
// =============================================================================

/// A replace that still matches is pushed as a delete then an update.
#[tokio::test]
async fn test_replace_pushes_delete_then_update() {
    let engine = engine().await;
    let alice = identity("alice");
    let (session, mut rx) = engine.register(alice.clone()).unwrap();
    engine
        .subscribe(session.id(), &json!({"kind": "note"}), None, &alice, Some(QueryId::from("notes")))
        .await
        .unwrap();
    next_delivery(&mut rx).await;

    let id = engine
        .create(object(&alice, json!({"kind": "note", "v": 1})), &alice)
        .await
        .unwrap();
    next_delivery(&mut rx).await;

    engine
        .replace(&id, object(&alice, json!({"kind": "note", "v": 2})), &json!({}), &alice)
        .await
        .unwrap();
    let delivery = next_delivery(&mut rx).await;
    assert_eq!(delivery.messages.len(), 2);
    match (&delivery.messages[0], &delivery.messages[1]) {
        (PushMessage::Deletes { results, .. }, PushMessage::Updates { results: updated, .. }) => {
            assert_eq!(results, &vec![id.clone()]);
            assert_eq!(updated[0]["v"], json!(2));
            assert_eq!(updated[0]["_id"], json!(id.as_str()));
        }
        other => panic!("unexpected {:?}", other),
    }

    // Leaving the query's result set is a delete only
    engine
        .replace(&id, object(&alice, json!({"kind": "draft"})), &json!({}), &alice)
        .await
        .unwrap();
    let delivery = next_delivery(&mut rx).await;
    assert!(matches!(
        delivery.messages.as_slice(),
        [PushMessage::Deletes { .. }]
    ));

    // Entering it again is an update only
    engine
        .replace(&id, object(&alice, json!({"kind": "note", "v": 3})), &json!({}), &alice)
        .await
        .unwrap();
    let delivery = next_delivery(&mut rx).await;
    assert!(matches!(
        delivery.messages.as_slice(),
        [PushMessage::Updates { historical: false, .. }]
    ));
    engine.shutdown().await.unwrap();
}

/// Removing a matching object pushes its id as a delete.
#[tokio::test]
async fn test_remove_pushes_delete() {
    let engine = engine().await;
    let alice = identity("alice");
    let (session, mut rx) = engine.register(alice.clone()).unwrap();
    engine
        .subscribe(session.id(), &json!({}), None, &alice, None)
        .await
        .unwrap();
    next_delivery(&mut rx).await;

    let id = engine
        .create(object(&alice, json!({"n": 1})), &alice)
        .await
        .unwrap();
    next_delivery(&mut rx).await;
    engine.remove(&id, &alice).await.unwrap();

    match &next_delivery(&mut rx).await.messages[0] {
        PushMessage::Deletes { results, .. } => assert_eq!(results, &vec![id]),
        other => panic!("unexpected {:?}", other),
    }
    engine.shutdown().await.unwrap();
}

// =============================================================================
// Eviction
// =============================================================================

/// A subscription that exhausts its evaluation budget is dropped with an error.
#[tokio::test]
async fn test_budget_exhaustion_evicts_subscription() {
    let engine = engine().await;
    let alice = identity("alice");
    let (session, mut rx) = engine.register(alice.clone()).unwrap();

    engine
        .subscribe(
            session.id(),
            &json!({"xs": {"$in": [-1, -2, -3]}}),
            None,
            &alice,
            Some(QueryId::from("heavy")),
        )
        .await
        .unwrap();
    engine
        .subscribe(session.id(), &json!({}), None, &alice, Some(QueryId::from("light")))
        .await
        .unwrap();
    // Two empty backfill pages
    collect_until(&mut rx, |m| m.len() >= 2).await;

    let xs: Vec<i64> = (0..40_000).collect();
    engine
        .create(object(&alice, json!({"xs": xs})), &alice)
        .await
        .unwrap();

    let messages = collect_until(&mut rx, |m| m.len() >= 2).await;
    let heavy = messages
        .iter()
        .find(|m| m.query_id() == &QueryId::from("heavy"))
        .unwrap();
    assert!(heavy.is_error());
    assert!(messages
        .iter()
        .any(|m| m.query_id() == &QueryId::from("light") && !m.is_error()));

    let active = engine.list_active(session.id()).unwrap();
    assert!(!active.contains(&QueryId::from("heavy")));
    assert!(active.contains(&QueryId::from("light")));
    assert_eq!(engine.metrics().evictions, 1);

    // The evicted query id is free again
    engine
        .subscribe(session.id(), &json!({}), None, &alice, Some(QueryId::from("heavy")))
        .await
        .unwrap();
    engine.shutdown().await.unwrap();
}

// =============================================================================
// Teardown
// =============================================================================

/// Unsubscribing stops pushes for that query only.
#[tokio::test]
async fn test_unsubscribe_stops_pushes() {
    let engine = engine().await;
    let alice = identity("alice");
    let (session, mut rx) = engine.register(alice.clone()).unwrap();
    let q = QueryId::from("q");
    engine
        .subscribe(session.id(), &json!({}), None, &alice, Some(q.clone()))
        .await
        .unwrap();
    next_delivery(&mut rx).await;

    engine.unsubscribe(session.id(), &q, &alice).await.unwrap();
    engine
        .create(object(&alice, json!({"n": 1})), &alice)
        .await
        .unwrap();
    assert!(quiet_for(&mut rx, 150).await);

    assert!(matches!(
        engine.unsubscribe(session.id(), &q, &alice).await,
        Err(LiveError::NotFound(_))
    ));
    engine.shutdown().await.unwrap();
}

/// Another identity cannot touch a socket's subscriptions.
#[tokio::test]
async fn test_foreign_caller_cannot_unsubscribe() {
    let engine = engine().await;
    let alice = identity("alice");
    let (session, _rx) = engine.register(alice.clone()).unwrap();
    let q = QueryId::from("q");
    engine
        .subscribe(session.id(), &json!({}), None, &alice, Some(q.clone()))
        .await
        .unwrap();

    assert!(matches!(
        engine.unsubscribe(session.id(), &q, &identity("mallory")).await,
        Err(LiveError::Forbidden(_))
    ));
    assert!(engine.list_active(session.id()).unwrap().contains(&q));
    engine.shutdown().await.unwrap();
}

/// Dropping a socket session retracts everything it subscribed to.
#[tokio::test]
async fn test_dropped_socket_is_torn_down() {
    let engine = engine().await;
    let alice = identity("alice");
    let (session, mut rx) = engine.register(alice.clone()).unwrap();
    let socket_id = session.id().clone();
    engine
        .subscribe(&socket_id, &json!({}), None, &alice, None)
        .await
        .unwrap();
    next_delivery(&mut rx).await;

    drop(session);
    assert!(matches!(
        engine.list_active(&socket_id),
        Err(LiveError::NotFound(_))
    ));
    // The registry released its sender
    assert!(rx.recv().await.is_none());

    // Other sockets keep working
    let (other, mut other_rx) = engine.register(alice.clone()).unwrap();
    engine
        .subscribe(other.id(), &json!({}), None, &alice, None)
        .await
        .unwrap();
    next_delivery(&mut other_rx).await;
    let id = engine
        .create(object(&alice, json!({"n": 1})), &alice)
        .await
        .unwrap();
    assert_eq!(
        update_ids(&next_delivery(&mut other_rx).await.messages[0]),
        vec![id.to_string()]
    );
    engine.shutdown().await.unwrap();
}
