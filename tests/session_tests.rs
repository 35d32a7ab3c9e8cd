/// Session tests
///
/// Tests for transaction state, dispose semantics and fail-fast behavior
/// of pooled sessions.
/// Run with: cargo test --test session_tests
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use geopool::{ConnectionConfig, MemoryBackend, PoolError, SessionPool};

fn test_config() -> ConnectionConfig {
    ConnectionConfig::new("sde_user", "secret")
        .min_connections(0)
        .max_connections(3)
        .acquire_timeout(Duration::from_millis(200))
}

async fn test_pool(backend: &MemoryBackend) -> SessionPool {
    SessionPool::new(test_config(), Arc::new(backend.clone()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_transaction_begin_commit() {
    let backend = MemoryBackend::new();
    let pool = test_pool(&backend).await;

    let mut lease = pool.session().await.unwrap();
    let session = lease.session();

    tokio_test::assert_ok!(session.start_transaction().await);
    assert!(session.is_transaction_active());
    tokio_test::assert_ok!(session.commit_transaction().await);
    assert!(!session.is_transaction_active());

    lease.dispose().await.unwrap();
}

#[tokio::test]
async fn test_rollback_always_clears_transaction_state() {
    let backend = MemoryBackend::new();
    let pool = test_pool(&backend).await;
    let lease = pool.session().await.unwrap();

    // successful rollback
    lease.session().start_transaction().await.unwrap();
    lease.session().rollback_transaction().await.unwrap();
    assert!(!lease.session().is_transaction_active());

    // failed rollback still clears the flag
    lease.session().start_transaction().await.unwrap();
    backend.fail_next_rollback();
    assert!(lease.session().rollback_transaction().await.is_err());
    assert!(!lease.session().is_transaction_active());
}

#[tokio::test]
async fn test_commit_failure_leaves_transaction_open() {
    let backend = MemoryBackend::new();
    let pool = test_pool(&backend).await;
    let lease = pool.session().await.unwrap();

    lease.session().start_transaction().await.unwrap();
    backend.fail_next_commit();
    assert!(lease.session().commit_transaction().await.is_err());
    // intentionally not cleared: the native transaction state is unknown
    assert!(lease.session().is_transaction_active());

    lease.session().rollback_transaction().await.unwrap();
}

#[tokio::test]
async fn test_dispose_with_open_transaction_fails() {
    let backend = MemoryBackend::new();
    let pool = test_pool(&backend).await;

    let mut lease = pool.session().await.unwrap();
    lease.session().start_transaction().await.unwrap();

    let err = lease.dispose().await.unwrap_err();
    assert!(matches!(err, PoolError::IllegalState(_)));
    // not returned to the pool
    assert_eq!(pool.in_use_count(), 1);
    assert_eq!(pool.available_count(), 0);

    // after rolling back, disposing works and the session is recycled
    lease.session().rollback_transaction().await.unwrap();
    lease.dispose().await.unwrap();
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(pool.available_count(), 1);
}

#[tokio::test]
async fn test_passivated_session_handle_fails_fast() {
    let backend = MemoryBackend::new();
    let pool = test_pool(&backend).await;

    let mut lease = pool.session().await.unwrap();
    let handle = lease.handle();
    lease.dispose().await.unwrap();

    assert!(handle.is_passivated());
    let err = handle.issue(|c| c.ping()).await.unwrap_err();
    assert!(matches!(err, PoolError::IllegalState(_)));
    let err = handle.start_transaction().await.unwrap_err();
    assert!(matches!(err, PoolError::IllegalState(_)));
}

#[tokio::test]
async fn test_double_dispose_is_an_error() {
    let backend = MemoryBackend::new();
    let pool = test_pool(&backend).await;

    let mut lease = pool.session().await.unwrap();
    lease.dispose().await.unwrap();
    assert!(lease.is_disposed());
    let err = lease.dispose().await.unwrap_err();
    assert!(matches!(err, PoolError::IllegalState(_)));
}

#[tokio::test]
async fn test_metadata_accessors_surface_not_found() {
    let backend = MemoryBackend::new().with_table(
        "roads",
        vec![geopool::ColumnDef::new("id", geopool::CellType::Int32)],
        vec![],
    );
    let pool = test_pool(&backend).await;
    let lease = pool.session().await.unwrap();

    assert_eq!(lease.session().table("roads").await.unwrap().name, "roads");
    let err = lease.session().table("rivers").await.unwrap_err();
    assert!(matches!(err, PoolError::NotFound(_)));
    let err = lease.session().layer("rivers").await.unwrap_err();
    assert!(matches!(err, PoolError::NotFound(_)));
}

#[tokio::test]
async fn test_prepared_query_executes_later() {
    let backend = MemoryBackend::new().with_table(
        "roads",
        vec![
            geopool::ColumnDef::new("id", geopool::CellType::Int32),
            geopool::ColumnDef::new("name", geopool::CellType::Text),
        ],
        vec![vec![
            geopool::CellValue::Int32(1),
            geopool::CellValue::Text("main st".into()),
        ]],
    );
    let pool = test_pool(&backend).await;
    let lease = pool.session().await.unwrap();
    let session = lease.session();

    let cursor = session
        .prepare_query(&geopool::QuerySpec::new("roads"))
        .await
        .unwrap();
    // fetching before execution is a native protocol error
    assert!(matches!(
        session.fetch(cursor, None).await.unwrap_err(),
        PoolError::Native { .. }
    ));

    session.execute_prepared(cursor).await.unwrap();
    let row = session.fetch(cursor, None).await.unwrap().expect("one row");
    assert_eq!(
        row.value_by_name("name"),
        Some(&geopool::CellValue::Text("main st".into()))
    );
    assert!(session.fetch(cursor, None).await.unwrap().is_none());
    session.close_cursor(cursor).await.unwrap();
}
