use super::*;
use crate::test_utils::open_connection;

#[tokio::test]
async fn test_send_to_reaches_every_connection() {
    let registry = ConnectionRegistry::new();

    let (handle_a, mut rx_a) = open_connection();
    let (handle_b, mut rx_b) = open_connection();
    registry.add("7", handle_a).await;
    registry.add("7", handle_b).await;

    assert_eq!(registry.send_to("7", "payload").await, 2);
    assert_eq!(rx_a.recv().await.unwrap(), "payload");
    assert_eq!(rx_b.recv().await.unwrap(), "payload");
}

#[tokio::test]
async fn test_remove_shrinks_fan_out() {
    let registry = ConnectionRegistry::new();

    let (handle_a, _rx_a) = open_connection();
    let (handle_b, _rx_b) = open_connection();
    let removed_id = handle_b.id();
    registry.add("7", handle_a).await;
    registry.add("7", handle_b).await;
    assert_eq!(registry.send_to("7", "x").await, 2);

    registry.remove("7", removed_id).await;
    assert_eq!(registry.send_to("7", "x").await, 1);
}

#[tokio::test]
async fn test_empty_identity_is_deleted() {
    let registry = ConnectionRegistry::new();

    let (handle, _rx) = open_connection();
    let id = handle.id();
    registry.add("7", handle).await;
    assert_eq!(registry.stats().await.identity_count, 1);

    registry.remove("7", id).await;
    let stats = registry.stats().await;
    assert_eq!(stats.identity_count, 0);
    assert_eq!(stats.connection_count, 0);
}

#[tokio::test]
async fn test_remove_everywhere() {
    let registry = ConnectionRegistry::new();

    // same physical connection registered under two identities
    let (handle, _rx) = open_connection();
    let id = handle.id();
    registry.add("7", handle.clone()).await;
    registry.add("8", handle).await;
    let (other, _rx_other) = open_connection();
    registry.add("8", other).await;

    registry.remove_everywhere(id).await;

    let stats = registry.stats().await;
    assert_eq!(stats.identity_count, 1);
    assert_eq!(stats.connection_count, 1);
    assert_eq!(registry.send_to("7", "x").await, 0);
    assert_eq!(registry.send_to("8", "x").await, 1);
}

#[tokio::test]
async fn test_send_to_unknown_identity_returns_zero() {
    let registry = ConnectionRegistry::new();
    assert_eq!(registry.send_to("nobody", "x").await, 0);
}

#[tokio::test]
async fn test_broken_connections_are_pruned_on_send() {
    let registry = ConnectionRegistry::new();

    let (alive, mut rx_alive) = open_connection();
    let (broken, rx_broken) = open_connection();
    registry.add("7", alive).await;
    registry.add("7", broken).await;

    // simulate a disconnect racing the send
    drop(rx_broken);

    assert_eq!(registry.send_to("7", "hello").await, 1);
    assert_eq!(rx_alive.recv().await.unwrap(), "hello");

    // the dead handle is gone, not just skipped
    assert_eq!(registry.stats().await.connection_count, 1);
}

#[tokio::test]
async fn test_all_sends_failing_deletes_identity() {
    let registry = ConnectionRegistry::new();

    let (handle, rx) = open_connection();
    registry.add("7", handle).await;
    drop(rx);

    assert_eq!(registry.send_to("7", "x").await, 0);
    assert_eq!(registry.stats().await.identity_count, 0);
}

#[tokio::test]
async fn test_concurrent_connect_disconnect_send() {
    use std::sync::Arc;

    let registry = Arc::new(ConnectionRegistry::new());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            let identity = format!("user-{}", i % 2);
            for _ in 0..25 {
                let (handle, rx) = open_connection();
                let id = handle.id();
                registry.add(&identity, handle).await;
                registry.send_to(&identity, "tick").await;
                drop(rx);
                registry.remove(&identity, id).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stats = registry.stats().await;
    assert_eq!(stats.identity_count, 0);
    assert_eq!(stats.connection_count, 0);
}
