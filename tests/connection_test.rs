//! Connection manager integration tests.

mod common;

use std::time::Duration;

use common::{connect, connection_config, StubConnector};
use persistence_kit::errors::DataError;
use persistence_kit::infra::ConnectionState;

#[tokio::test]
async fn test_concurrent_sessions_respect_pool_capacity() {
    let connector = StubConnector::default();
    let manager = connect(&connector, connection_config()).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            let session = manager.get_session().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
            session.release().await;
            Ok::<_, DataError>(())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(connector.peak() <= 3, "peak was {}", connector.peak());
    let status = manager.get_pool_status().unwrap();
    assert_eq!(status.in_use, 0);
    assert!(status.idle <= 2);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_times_out() {
    let connector = StubConnector::default();
    let config = connection_config()
        .with_pool_size(1, 0)
        .with_pool_timeout(Duration::from_millis(50));
    let manager = connect(&connector, config).await;

    let held = manager.get_session().await.unwrap();
    let err = manager.get_session().await.err().unwrap();
    assert!(matches!(err, DataError::Connection { .. }));
    assert!(err.is_transient());

    held.release().await;
    let again = manager.get_session().await.unwrap();
    again.release().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_execute_query_returns_rows() {
    let connector = StubConnector::default();
    let manager = connect(&connector, connection_config()).await;
    connector.answer_rows(vec![serde_json::json!({"n": 1})]);

    let rows = manager
        .execute_query("SELECT 1 AS n", vec![])
        .await
        .unwrap();

    assert_eq!(rows, vec![serde_json::json!({"n": 1})]);
    let health = manager.get_health_status();
    assert!(health.healthy);
    assert_eq!(health.database, "postgres");
    assert_eq!(health.metrics.total_queries, 1);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_after_max_retries() {
    let connector = StubConnector::default();
    let manager = connect(&connector, connection_config()).await;

    connector.set_down(true);
    assert!(!manager.perform_health_check().await);

    let err = manager.reconnect().await.err().unwrap();
    assert!(matches!(err, DataError::Connection { retries: 3, .. }));
    assert_eq!(manager.state(), ConnectionState::Error);
    assert_eq!(manager.retry_count(), 3);
    assert!(manager.get_session().await.is_err());

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restores_service() {
    let connector = StubConnector::default();
    let manager = connect(&connector, connection_config()).await;

    connector.set_down(true);
    assert!(!manager.perform_health_check().await);
    connector.set_down(false);

    manager.reconnect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.retry_count(), 0);

    let session = manager.get_session().await.unwrap();
    session.ping().await.unwrap();
    session.release().await;
    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_outstanding_sessions() {
    let connector = StubConnector::default();
    let manager = connect(&connector, connection_config()).await;

    let session = manager.get_session().await.unwrap();
    let handle = session.handle();
    assert!(handle.is_open().await);

    manager.shutdown().await;

    assert!(!handle.is_open().await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(connector.open(), 0);
    drop(session);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_from_spawned_task() {
    let connector = StubConnector::default();
    let manager = connect(&connector, connection_config()).await;

    let reconnecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.reconnect().await })
    };

    reconnecting.await.unwrap().unwrap();
    assert!(manager.is_connected());
    let session = manager.get_session().await.unwrap();
    session.release().await;
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_reconnect_stays_down() {
    let connector = StubConnector::default();
    let manager = connect(&connector, connection_config()).await;
    connector.set_connect_delay(Duration::from_millis(500));

    let reconnecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.reconnect().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.shutdown().await;

    assert!(reconnecting.await.unwrap().is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.get_pool_status().is_none());
    assert_eq!(connector.open(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_busy_pool_survives_health_interval() {
    let connector = StubConnector::default();
    let manager = connect(&connector, connection_config()).await;

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(manager.get_session().await.unwrap());
    }
    tokio::time::sleep(Duration::from_secs(32)).await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.retry_count(), 0);

    for session in held {
        session.release().await;
    }
    let a = manager.get_session().await.unwrap();
    let b = manager.get_session().await.unwrap();
    assert!(connector.peak() <= 3, "peak was {}", connector.peak());

    a.release().await;
    b.release().await;
    manager.shutdown().await;
}
