/// Version state tests
///
/// Tests the two-path child-state creation used for concurrent versioned
/// edits: prefer a direct child of the parent; fall back to a sibling
/// merged from the contended parent.
/// Run with: cargo test --test versioning_tests
use std::sync::Arc;
use std::time::Duration;

use geopool::{ConnectionConfig, MemoryBackend, PoolError, SessionLease, SessionPool, StateId};

fn test_config() -> ConnectionConfig {
    ConnectionConfig::new("sde_user", "secret")
        .min_connections(0)
        .max_connections(2)
        .acquire_timeout(Duration::from_millis(200))
}

async fn lease_for(backend: &MemoryBackend) -> SessionLease {
    let pool = SessionPool::new(test_config(), Arc::new(backend.clone()))
        .await
        .unwrap();
    pool.session().await.unwrap()
}

#[tokio::test]
async fn test_closable_parent_gets_a_direct_child() {
    let backend = MemoryBackend::new();
    let root = backend.add_state(None, "sde_user", &[1]);
    let parent = backend.add_state(Some(root), "sde_user", &[1, 2]);

    let lease = lease_for(&backend).await;
    let child = lease.session().create_child_state(parent).await.unwrap();

    assert_eq!(child.parent, Some(parent));
    assert_eq!(backend.state_content(child.id), vec![1, 2]);
}

#[tokio::test]
async fn test_contended_parent_gets_a_merged_sibling() {
    let backend = MemoryBackend::new();
    let root = backend.add_state(None, "sde_user", &[1]);
    let parent = backend.add_state(Some(root), "sde_user", &[1, 2, 3]);
    backend.set_state_in_use(parent, true);

    let lease = lease_for(&backend).await;
    let child = lease.session().create_child_state(parent).await.unwrap();

    // branched from the grandparent, then converged with the parent
    assert_eq!(child.parent, Some(root));
    assert_eq!(backend.state_content(child.id), vec![1, 2, 3]);
    // the contended parent itself is untouched
    assert_eq!(backend.state_content(parent), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_foreign_owned_parent_gets_a_merged_sibling() {
    let backend = MemoryBackend::new();
    let root = backend.add_state(None, "sde_user", &[7]);
    let parent = backend.add_state(Some(root), "dbo", &[7, 8]);

    let lease = lease_for(&backend).await;
    let child = lease.session().create_child_state(parent).await.unwrap();

    assert_eq!(child.parent, Some(root));
    assert_eq!(backend.state_content(child.id), vec![7, 8]);
}

#[tokio::test]
async fn test_contended_root_state_surfaces_the_native_error() {
    let backend = MemoryBackend::new();
    let root = backend.add_state(None, "sde_user", &[1]);
    backend.set_state_in_use(root, true);

    let lease = lease_for(&backend).await;
    let err = lease
        .session()
        .create_child_state(root)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Native { .. }));
}

#[tokio::test]
async fn test_version_lookup() {
    let backend = MemoryBackend::new();
    let state = backend.add_state(None, "sde_user", &[]);
    let backend = backend.with_version("DEFAULT", state);

    let lease = lease_for(&backend).await;
    let version = lease.session().version("DEFAULT").await.unwrap();
    assert_eq!(version.state_id, state);

    let err = lease.session().version("missing").await.unwrap_err();
    assert!(matches!(err, PoolError::NotFound(_)));
}

#[tokio::test]
async fn test_unknown_state_is_a_native_error() {
    let backend = MemoryBackend::new();
    let lease = lease_for(&backend).await;
    let err = lease
        .session()
        .create_child_state(StateId(999))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Native { .. }));
}
