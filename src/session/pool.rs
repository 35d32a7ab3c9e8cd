use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::core::{PoolError, Result};
use crate::native::Connector;

use super::config::ConnectionConfig;
use super::lease::SessionLease;
use super::registry::SessionProvider;
use super::{ReleaseOutcome, Session};

/// How many times session creation is retried, and only for the native
/// transient allocation failure. The count is field lore, not a derived
/// constant; treat it as a tunable.
pub(crate) const CONNECT_RETRY_ATTEMPTS: usize = 3;

/// Poll interval while waiting for a session to come back to the pool.
const ACQUIRE_POLL: Duration = Duration::from_millis(10);

struct PoolState {
    idle: VecDeque<Arc<Session>>,
    in_use: usize,
    closed: bool,
    next_session_id: u64,
}

/// Shared pool internals. Leases hold an `Arc` to this so sessions can be
/// checked back in from both the async dispose path and `Drop`.
pub(crate) struct PoolInner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect and wrap a new session. Retries only the known spurious
    /// allocation error; everything else surfaces immediately, stamped
    /// with the server identity.
    fn create_session(&self, id: u64) -> Result<Arc<Session>> {
        let mut attempt = 1;
        let conn = loop {
            match self.connector.connect(&self.config) {
                Ok(conn) => break conn,
                Err(e) if e.is_transient_alloc() && attempt < CONNECT_RETRY_ATTEMPTS => {
                    debug!(
                        "transient allocation failure connecting to {} (attempt {}/{}): {}",
                        self.config.server_label(),
                        attempt,
                        CONNECT_RETRY_ATTEMPTS,
                        e
                    );
                    attempt += 1;
                }
                Err(e) => {
                    return Err(PoolError::Native {
                        code: e.code,
                        message: format!(
                            "connecting to {}: {}",
                            self.config.server_label(),
                            e.message
                        ),
                    });
                }
            }
        };
        debug!("session {} connected to {}", id, self.config.server_label());
        Ok(Arc::new(Session::new(id, conn, &self.config)))
    }

    /// Pre-create sessions up to `min_connections`.
    fn warm_up(&self) -> Result<()> {
        loop {
            let id = {
                let mut st = self.state();
                if st.idle.len() + st.in_use >= self.config.min_connections {
                    return Ok(());
                }
                st.next_session_id += 1;
                st.next_session_id
            };
            let session = self.create_session(id)?;
            self.state().idle.push_back(session);
        }
    }

    pub(crate) async fn get_session(self: Arc<Self>, transactional: bool) -> Result<SessionLease> {
        enum Plan {
            Lend(Arc<Session>),
            Create(u64),
            Full,
        }

        let deadline = Instant::now() + self.config.acquire_timeout;
        loop {
            let plan = {
                let mut st = self.state();
                if st.closed {
                    return Err(PoolError::IllegalState("pool is closed".to_string()));
                }
                if let Some(session) = st.idle.pop_back() {
                    st.in_use += 1;
                    Plan::Lend(session)
                } else if st.idle.len() + st.in_use < self.config.max_connections {
                    st.in_use += 1;
                    st.next_session_id += 1;
                    Plan::Create(st.next_session_id)
                } else {
                    Plan::Full
                }
            };

            match plan {
                Plan::Lend(session) => {
                    if session.activate().is_err() {
                        // disposed while idle; skip it
                        self.state().in_use -= 1;
                        continue;
                    }
                    if let Err(e) = session.test_server().await {
                        warn!(
                            "session {} failed liveness probe, discarding: {}",
                            session.id(),
                            e
                        );
                        session.force_disposed();
                        session.close_native().await;
                        self.state().in_use -= 1;
                        continue;
                    }
                    debug!(
                        "lending recycled session {} (transactional: {})",
                        session.id(),
                        transactional
                    );
                    return Ok(SessionLease::pooled(session, Arc::clone(&self)));
                }
                Plan::Create(id) => match self.create_session(id).and_then(|session| {
                    session.activate()?;
                    Ok(session)
                }) {
                    Ok(session) => {
                        debug!(
                            "lending new session {} (transactional: {})",
                            id, transactional
                        );
                        return Ok(SessionLease::pooled(session, Arc::clone(&self)));
                    }
                    Err(e) => {
                        self.state().in_use -= 1;
                        return Err(e);
                    }
                },
                Plan::Full => {
                    if Instant::now() >= deadline {
                        let st = self.state();
                        return Err(PoolError::ResourceExhausted(format!(
                            "too many connections in use ({}/{})",
                            st.in_use, self.config.max_connections
                        )));
                    }
                    sleep(ACQUIRE_POLL).await;
                }
            }
        }
    }

    /// Check a session back in after its lease released an activation.
    /// An error means the session was not released (transaction still
    /// active) and the lease keeps it.
    pub(crate) async fn check_in(&self, session: Arc<Session>) -> Result<()> {
        match session.release()? {
            ReleaseOutcome::StillHeld => Ok(()),
            ReleaseOutcome::Recycle => {
                let destroy = {
                    let mut st = self.state();
                    st.in_use -= 1;
                    if st.closed {
                        true
                    } else {
                        st.idle.push_back(Arc::clone(&session));
                        false
                    }
                };
                if destroy {
                    session.force_disposed();
                    session.close_native().await;
                }
                Ok(())
            }
            ReleaseOutcome::Destroy => {
                self.state().in_use -= 1;
                info!(
                    "session {} crossed the auto-close threshold after {} risky operations; \
                     closing its connection",
                    session.id(),
                    session.risky_op_count()
                );
                session.close_native().await;
                Ok(())
            }
        }
    }

    /// Synchronous check-in for drop paths. Errors are logged instead of
    /// surfaced; an unreleasable session (active transaction) is destroyed
    /// because nobody is left to finish the transaction.
    pub(crate) fn check_in_now(&self, session: Arc<Session>) {
        match session.release() {
            Ok(ReleaseOutcome::StillHeld) => {}
            Ok(ReleaseOutcome::Recycle) => {
                let destroy = {
                    let mut st = self.state();
                    st.in_use -= 1;
                    if st.closed {
                        true
                    } else {
                        st.idle.push_back(Arc::clone(&session));
                        false
                    }
                };
                if destroy {
                    session.force_disposed();
                    session.close_native_now();
                }
            }
            Ok(ReleaseOutcome::Destroy) => {
                self.state().in_use -= 1;
                info!(
                    "session {} crossed the auto-close threshold after {} risky operations; \
                     closing its connection",
                    session.id(),
                    session.risky_op_count()
                );
                session.close_native_now();
            }
            Err(e) => {
                warn!(
                    "session {} dropped while unreleasable ({}); destroying its connection",
                    session.id(),
                    e
                );
                session.force_disposed();
                session.close_native_now();
                self.state().in_use -= 1;
            }
        }
    }

    pub(crate) async fn close(&self) {
        let drained = {
            let mut st = self.state();
            if st.closed {
                return;
            }
            st.closed = true;
            std::mem::take(&mut st.idle)
        };
        for session in drained {
            session.force_disposed();
            session.close_native().await;
        }
        info!("session pool for {} closed", self.config.server_label());
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub(crate) fn available_count(&self) -> usize {
        self.state().idle.len()
    }

    pub(crate) fn in_use_count(&self) -> usize {
        self.state().in_use
    }

    pub(crate) fn pool_size(&self) -> usize {
        let st = self.state();
        st.idle.len() + st.in_use
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

/// A bounded pool of sessions for one connection configuration.
///
/// Sessions are lent under a min/max policy with a bounded wait:
/// an idle session is recycled when available, a new one is created while
/// below `max_connections`, and otherwise the caller blocks up to
/// `acquire_timeout` before getting a resource-exhausted error.
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create a pool and warm it to `min_connections`.
    pub async fn new(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate().map_err(PoolError::Config)?;
        let inner = Arc::new(PoolInner {
            config,
            connector,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_use: 0,
                closed: false,
                next_session_id: 0,
            }),
        });
        inner.warm_up()?;
        info!(
            "session pool ready for {} ({} warmed, max {})",
            inner.config.server_label(),
            inner.available_count(),
            inner.config.max_connections
        );
        Ok(Self { inner })
    }

    /// Borrow a session, waiting up to the configured timeout.
    ///
    /// `transactional` is a caller hint; the pool currently lends the
    /// same way for both but records it for tracing.
    pub async fn get_session(&self, transactional: bool) -> Result<SessionLease> {
        Arc::clone(&self.inner).get_session(transactional).await
    }

    /// Shorthand for `get_session(true)`.
    pub async fn session(&self) -> Result<SessionLease> {
        self.get_session(true).await
    }

    /// Drain and close every idle session and refuse further lending.
    /// Idempotent; in-use sessions are destroyed as they come back.
    pub async fn close(&self) {
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

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let available = self.inner.available_count();
        let in_use = self.inner.in_use_count();
        PoolStats {
            total_sessions: available + in_use,
            available_sessions: available,
            in_use_sessions: in_use,
            max_sessions: self.inner.config().max_connections,
        }
    }
}

#[async_trait]
impl SessionProvider for SessionPool {
    async fn get_session(&self, transactional: bool) -> Result<SessionLease> {
        SessionPool::get_session(self, transactional).await
    }

    async fn close(&self) {
        SessionPool::close(self).await;
    }

    fn pool_size(&self) -> usize {
        SessionPool::pool_size(self)
    }

    fn available_count(&self) -> usize {
        SessionPool::available_count(self)
    }

    fn in_use_count(&self) -> usize {
        SessionPool::in_use_count(self)
    }

    fn is_closed(&self) -> bool {
        SessionPool::is_closed(self)
    }
}

/// Session pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub available_sessions: usize,
    pub in_use_sessions: usize,
    pub max_sessions: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} in use, {} available, max {}",
            self.in_use_sessions, self.total_sessions, self.available_sessions, self.max_sessions
        )
    }
}
