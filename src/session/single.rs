use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::{PoolError, Result};
use crate::native::Connector;

use super::config::ConnectionConfig;
use super::lease::SessionLease;
use super::pool::SessionPool;
use super::registry::SessionProvider;
use super::Session;

/// A pool bound to exactly one connection.
///
/// Spatial database connections are expensive to establish; edit
/// workflows that want a single long-lived, mostly-read handle use this
/// pool to avoid recycling it between callers. Every `get_session`
/// returns the identical underlying session wrapped in a retain-lease, so
/// disposing a lease never returns or destroys the session, and only one
/// write session is ever in flight for the configuration.
pub struct SingleSessionPool {
    inner: SessionPool,
    cached: Mutex<Option<Arc<Session>>>,
}

impl std::fmt::Debug for SingleSessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleSessionPool").finish_non_exhaustive()
    }
}

impl SingleSessionPool {
    /// Requires `max_connections == 1`; anything else is a configuration
    /// error, not a value to silently clamp.
    pub async fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        if config.max_connections != 1 {
            return Err(PoolError::Config(format!(
                "single-connection pool requires max_connections == 1, got {}",
                config.max_connections
            )));
        }
        // The session is created lazily on first checkout, not at pool
        // construction.
        let inner = SessionPool::new(config.min_connections(0), connector).await?;
        Ok(Self {
            inner,
            cached: Mutex::new(None),
        })
    }

    /// Lend the cached session, creating it on first use.
    pub async fn get_session(&self, transactional: bool) -> Result<SessionLease> {
        let mut cached = self.cached.lock().await;
        if self.inner.is_closed() {
            return Err(PoolError::IllegalState("pool is closed".to_string()));
        }
        let session = match cached.as_ref() {
            Some(session) => Arc::clone(session),
            None => {
                let lease = self.inner.get_session(transactional).await?;
                let session = lease.into_retained();
                debug!(
                    "single-connection pool caching session {} permanently",
                    session.id()
                );
                *cached = Some(Arc::clone(&session));
                session
            }
        };
        Ok(SessionLease::retained(session))
    }

    pub async fn session(&self) -> Result<SessionLease> {
        self.get_session(true).await
    }

    /// Destroy the cached session and close the underlying pool.
    pub async fn close(&self) {
        let mut cached = self.cached.lock().await;
        if let Some(session) = cached.take() {
            session.force_disposed();
            session.close_native().await;
        }
        self.inner.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size()
    }

    pub fn available_count(&self) -> usize {
        self.inner.available_count()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.in_use_count()
    }
}

#[async_trait]
impl SessionProvider for SingleSessionPool {
    async fn get_session(&self, transactional: bool) -> Result<SessionLease> {
        SingleSessionPool::get_session(self, transactional).await
    }

    async fn close(&self) {
        SingleSessionPool::close(self).await;
    }

    fn pool_size(&self) -> usize {
        SingleSessionPool::pool_size(self)
    }

    fn available_count(&self) -> usize {
        SingleSessionPool::available_count(self)
    }

    fn in_use_count(&self) -> usize {
        SingleSessionPool::in_use_count(self)
    }

    fn is_closed(&self) -> bool {
        SingleSessionPool::is_closed(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::memory::MemoryBackend;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::new("sde_user", "secret").max_connections(1)
    }

    #[tokio::test]
    async fn test_rejects_wider_pools() {
        let backend = MemoryBackend::new();
        let err = SingleSessionPool::new(
            test_config().max_connections(2),
            Arc::new(backend),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[tokio::test]
    async fn test_session_is_created_lazily() {
        let backend = MemoryBackend::new();
        let pool = SingleSessionPool::new(test_config(), Arc::new(backend.clone()))
            .await
            .unwrap();

        assert_eq!(backend.total_connects(), 0);
        let _lease = pool.session().await.unwrap();
        assert_eq!(backend.total_connects(), 1);
    }

    #[tokio::test]
    async fn test_same_session_every_time() {
        let backend = MemoryBackend::new();
        let pool = SingleSessionPool::new(test_config(), Arc::new(backend.clone()))
            .await
            .unwrap();

        let first = pool.session().await.unwrap();
        let second = pool.session().await.unwrap();
        assert!(Arc::ptr_eq(&first.handle(), &second.handle()));
        assert_eq!(backend.total_connects(), 1);
    }

    #[tokio::test]
    async fn test_dispose_is_a_no_op() {
        let backend = MemoryBackend::new();
        let pool = SingleSessionPool::new(test_config(), Arc::new(backend.clone()))
            .await
            .unwrap();

        let mut lease = pool.session().await.unwrap();
        lease.dispose().await.unwrap();
        // still usable after dispose, and the connection survived
        assert!(lease.session().issue(|c| c.ping()).await.is_ok());
        assert_eq!(backend.live_connections(), 1);
    }
}
