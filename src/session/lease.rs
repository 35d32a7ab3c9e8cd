use std::sync::Arc;

use tracing::warn;

use crate::core::{PoolError, Result};

use super::pool::PoolInner;
use super::Session;

/// How a lease hands its session back when disposed.
///
/// Composition instead of subclassing: the single-connection pool lends
/// retain-leases over its permanently cached session, while the bounded
/// pool lends return-leases.
pub(crate) enum DisposePolicy {
    /// Release the activation and check the session back into the pool.
    Return(Arc<PoolInner>),
    /// Dispose is a no-op; the session outlives every lease.
    Retain,
}

/// A borrowed session.
///
/// Returns the session to its pool when dropped. Prefer calling
/// [`SessionLease::dispose`] explicitly: it can close the native
/// connection asynchronously and it surfaces the illegal-state error when
/// a transaction is still open, which `Drop` can only log.
pub struct SessionLease {
    session: Option<Arc<Session>>,
    policy: DisposePolicy,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("has_session", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionLease {
    pub(crate) fn pooled(session: Arc<Session>, pool: Arc<PoolInner>) -> Self {
        Self {
            session: Some(session),
            policy: DisposePolicy::Return(pool),
        }
    }

    pub(crate) fn retained(session: Arc<Session>) -> Self {
        Self {
            session: Some(session),
            policy: DisposePolicy::Retain,
        }
    }

    /// Access the borrowed session.
    pub fn session(&self) -> &Session {
        self.session
            .as_deref()
            .expect("Session already returned to pool")
    }

    /// A shared handle to the borrowed session. The handle does not keep
    /// the session active: once every lease is disposed the session
    /// passivates and operations on the handle fail fast.
    pub fn handle(&self) -> Arc<Session> {
        Arc::clone(
            self.session
                .as_ref()
                .expect("Session already returned to pool"),
        )
    }

    /// Give the session back.
    ///
    /// Fails with an illegal-state error when a transaction is still in
    /// progress; the lease then still holds the session so the caller can
    /// commit or roll back and dispose again. Disposing twice is an
    /// error. For retain-leases this is a no-op by design.
    pub async fn dispose(&mut self) -> Result<()> {
        match &self.policy {
            DisposePolicy::Retain => Ok(()),
            DisposePolicy::Return(pool) => {
                let pool = Arc::clone(pool);
                let session = self.session.take().ok_or_else(|| {
                    PoolError::IllegalState("session already disposed".to_string())
                })?;
                match pool.check_in(Arc::clone(&session)).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.session = Some(session);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Whether this lease still holds its session.
    pub fn is_disposed(&self) -> bool {
        self.session.is_none()
    }

    /// Detach the session from the lease without returning it to any
    /// pool. Used by the single-connection pool to cache its session
    /// permanently.
    pub(crate) fn into_retained(mut self) -> Arc<Session> {
        self.session
            .take()
            .expect("Session already returned to pool")
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            match &self.policy {
                DisposePolicy::Retain => {}
                DisposePolicy::Return(pool) => {
                    if session.is_transaction_active() {
                        warn!(
                            "session {} lease dropped with an active transaction; \
                             use dispose() after commit or rollback",
                            session.id()
                        );
                    }
                    pool.check_in_now(session);
                }
            }
        }
    }
}
