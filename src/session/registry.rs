use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::Result;
use crate::native::Connector;

use super::config::ConnectionConfig;
use super::lease::SessionLease;
use super::pool::SessionPool;
use super::single::SingleSessionPool;

/// The pool contract: lend sessions, report counters, close.
///
/// Implemented by [`SessionPool`] and [`SingleSessionPool`]; the registry
/// hands pools out behind this trait so callers do not depend on which
/// flavor a configuration selected.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Borrow a session, waiting up to the configured timeout.
    /// `transactional` hints whether the caller intends to open a
    /// transaction.
    async fn get_session(&self, transactional: bool) -> Result<SessionLease>;

    /// Shorthand for `get_session(true)`.
    async fn session(&self) -> Result<SessionLease> {
        self.get_session(true).await
    }

    /// Drain and close the pool. Idempotent.
    async fn close(&self);

    fn pool_size(&self) -> usize;
    fn available_count(&self) -> usize;
    fn in_use_count(&self) -> usize;
    fn is_closed(&self) -> bool;
}

/// Process-scoped registry of pools, keyed by connection configuration.
///
/// An explicit object owned by the host application rather than a global:
/// construct one, share it, and ask it for pools. `create_pool` is
/// idempotent per configuration, so every caller with the same config
/// shares the same pool (and therefore the same connection bound).
pub struct PoolRegistry {
    connector: Arc<dyn Connector>,
    pools: Mutex<HashMap<ConnectionConfig, Arc<dyn SessionProvider>>>,
}

impl PoolRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the pool for a configuration.
    ///
    /// `max_connections == 1` selects the single-connection pool, which
    /// permanently caches one session; anything larger gets the bounded
    /// pool.
    pub async fn create_pool(&self, config: &ConnectionConfig) -> Result<Arc<dyn SessionProvider>> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(config) {
            return Ok(Arc::clone(pool));
        }

        let provider: Arc<dyn SessionProvider> = if config.max_connections == 1 {
            info!(
                "creating single-connection pool for {}",
                config.server_label()
            );
            Arc::new(SingleSessionPool::new(config.clone(), Arc::clone(&self.connector)).await?)
        } else {
            info!(
                "creating session pool for {} (min {}, max {})",
                config.server_label(),
                config.min_connections,
                config.max_connections
            );
            Arc::new(SessionPool::new(config.clone(), Arc::clone(&self.connector)).await?)
        };
        pools.insert(config.clone(), Arc::clone(&provider));
        Ok(provider)
    }

    /// The already-created pool for a configuration, if any.
    pub async fn pool(&self, config: &ConnectionConfig) -> Option<Arc<dyn SessionProvider>> {
        self.pools.lock().await.get(config).cloned()
    }

    /// Close every registered pool and forget them.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.pools.lock().await.drain().collect();
        for (_, pool) in drained {
            pool.close().await;
        }
    }
}
