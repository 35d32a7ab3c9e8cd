pub mod config;
pub mod lease;
pub mod pool;
pub mod registry;
pub mod row;
pub mod single;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::core::{PoolError, Result};
use crate::native::{
    ColumnDef, CursorId, LayerDef, NativeConnection, NativeResult, QuerySpec, StateDef, StateId,
    TableDef, VersionDef,
};

use config::ConnectionConfig;
use row::{GeometryDecoder, PassthroughGeometry, RowSnapshot};

/// Bound on the per-session table/layer metadata caches.
const METADATA_CACHE_CAP: usize = 64;

/// Session lifecycle, folded into one tagged state so the reference count
/// and the passivation flag can never disagree.
///
/// State transitions:
/// ```text
/// Passivated ──activate──> Active(1) ──activate──> Active(n+1)
///     ^                        │
///     └────────release─────────┘ (at zero refs; or Disposed when the
///                                 session is destroyed instead)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Sitting idle in the pool; every public operation fails fast.
    Passivated,
    /// Lent out, with the number of outstanding activations.
    Active(usize),
    /// Native connection gone; terminal.
    Disposed,
}

struct SessionState {
    lifecycle: Lifecycle,
    transaction_active: bool,
}

/// What the pool should do with a session whose last activation was
/// released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseOutcome {
    /// Other activations remain; nothing to do.
    StillHeld,
    /// Passivated; put it back on the idle queue.
    Recycle,
    /// Crossed the auto-close threshold; close the native connection and
    /// let the pool grow a replacement lazily.
    Destroy,
}

/// A serialized wrapper around exactly one native connection.
///
/// The native handle is single-threaded; the session guarantees exclusive
/// access by funnelling every operation through [`Session::issue`], which
/// holds an internal lock for the duration of the command. Sessions are
/// created and recycled by pools; callers receive them inside a
/// [`lease::SessionLease`].
pub struct Session {
    id: u64,
    server: String,
    conn: AsyncMutex<Box<dyn NativeConnection>>,
    state: Mutex<SessionState>,
    risky_ops: AtomicUsize,
    auto_close_threshold: usize,
    idle_probe_interval: Duration,
    last_round_trip: Mutex<Instant>,
    table_cache: Mutex<LruCache<String, TableDef>>,
    layer_cache: Mutex<LruCache<String, LayerDef>>,
}

fn cache_cap() -> NonZeroUsize {
    NonZeroUsize::new(METADATA_CACHE_CAP).unwrap_or(NonZeroUsize::MIN)
}

impl Session {
    pub(crate) fn new(id: u64, conn: Box<dyn NativeConnection>, config: &ConnectionConfig) -> Self {
        Self {
            id,
            server: config.server_label(),
            conn: AsyncMutex::new(conn),
            state: Mutex::new(SessionState {
                lifecycle: Lifecycle::Passivated,
                transaction_active: false,
            }),
            risky_ops: AtomicUsize::new(0),
            auto_close_threshold: config.auto_close_threshold,
            idle_probe_interval: config.idle_probe_interval,
            last_round_trip: Mutex::new(Instant::now()),
            table_cache: Mutex::new(LruCache::new(cache_cap())),
            layer_cache: Mutex::new(LruCache::new(cache_cap())),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_live(&self) -> Result<()> {
        match self.lock_state().lifecycle {
            Lifecycle::Active(_) => Ok(()),
            Lifecycle::Passivated => Err(PoolError::IllegalState(format!(
                "session {} is passivated",
                self.id
            ))),
            Lifecycle::Disposed => Err(PoolError::IllegalState(format!(
                "session {} is disposed",
                self.id
            ))),
        }
    }

    /// Issue a unit of work against the native connection.
    ///
    /// The only way any native operation happens. The closure gets
    /// exclusive access to the handle for the duration of the call and
    /// must not retain it. Native failures are mapped into
    /// [`PoolError::Native`].
    pub async fn issue<R, F>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&mut dyn NativeConnection) -> NativeResult<R>,
    {
        self.ensure_live()?;
        let mut guard = self.conn.lock().await;
        let out = op(&mut **guard);
        drop(guard);
        *self
            .last_round_trip
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        out.map_err(PoolError::from)
    }

    /// Probe the server, but only if the session has been idle long
    /// enough that staleness is plausible. Avoids a network round trip on
    /// every pool checkout while still catching dead connections.
    pub async fn test_server(&self) -> Result<()> {
        let idle = self
            .last_round_trip
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if idle <= self.idle_probe_interval {
            return Ok(());
        }
        debug!("session {} idle for {:?}, probing server", self.id, idle);
        self.issue(|c| c.ping()).await
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub async fn start_transaction(&self) -> Result<()> {
        self.ensure_live()?;
        if self.lock_state().transaction_active {
            return Err(PoolError::IllegalState(format!(
                "session {} already has a transaction in progress",
                self.id
            )));
        }
        self.issue(|c| c.begin()).await?;
        self.lock_state().transaction_active = true;
        Ok(())
    }

    /// Commit the current transaction. On native failure the transaction
    /// flag is left set: the native state is unknown and must not be
    /// silently cleared.
    pub async fn commit_transaction(&self) -> Result<()> {
        self.ensure_live()?;
        if !self.lock_state().transaction_active {
            return Err(PoolError::IllegalState(format!(
                "session {} has no transaction in progress",
                self.id
            )));
        }
        self.issue(|c| c.commit()).await?;
        self.lock_state().transaction_active = false;
        Ok(())
    }

    /// Roll back the current transaction. The transaction flag is cleared
    /// unconditionally, even when the native rollback fails, so callers
    /// are never stuck holding a session that claims to be mid-transaction.
    pub async fn rollback_transaction(&self) -> Result<()> {
        self.ensure_live()?;
        if !self.lock_state().transaction_active {
            return Err(PoolError::IllegalState(format!(
                "session {} has no transaction in progress",
                self.id
            )));
        }
        let result = self.issue(|c| c.rollback()).await;
        self.lock_state().transaction_active = false;
        result
    }

    pub fn is_transaction_active(&self) -> bool {
        self.lock_state().transaction_active
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Table metadata, from the per-session cache when possible.
    pub async fn table(&self, name: &str) -> Result<TableDef> {
        self.ensure_live()?;
        {
            let mut cache = self
                .table_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(table) = cache.get(name) {
                return Ok(table.clone());
            }
        }
        let table = self
            .issue(|c| c.table(name))
            .await
            .map_err(|e| remap_lookup(name, e))?;
        self.table_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(name.to_string(), table.clone());
        Ok(table)
    }

    /// Layer metadata, from the per-session cache when possible.
    pub async fn layer(&self, name: &str) -> Result<LayerDef> {
        self.ensure_live()?;
        {
            let mut cache = self
                .layer_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(layer) = cache.get(name) {
                return Ok(layer.clone());
            }
        }
        let layer = self
            .issue(|c| c.layer(name))
            .await
            .map_err(|e| remap_lookup(name, e))?;
        self.layer_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(name.to_string(), layer.clone());
        Ok(layer)
    }

    pub async fn describe(&self, table: &str) -> Result<Vec<ColumnDef>> {
        self.issue(|c| c.describe(table))
            .await
            .map_err(|e| remap_lookup(table, e))
    }

    pub async fn layers(&self) -> Result<Vec<LayerDef>> {
        self.issue(|c| c.layers()).await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Open and execute a query cursor.
    ///
    /// Counts toward the auto-close threshold: preparing a query is the
    /// operation known to grow native-side memory over the life of a
    /// connection, so sessions that do it a lot get their connection
    /// replaced.
    pub async fn create_and_execute_query(&self, spec: &QuerySpec) -> Result<CursorId> {
        self.ensure_live()?;
        self.risky_ops.fetch_add(1, Ordering::Relaxed);
        self.issue(|c| c.open_query(spec)).await
    }

    /// Open a query cursor without executing it. Counts toward the
    /// auto-close threshold, same as `create_and_execute_query`.
    pub async fn prepare_query(&self, spec: &QuerySpec) -> Result<CursorId> {
        self.ensure_live()?;
        self.risky_ops.fetch_add(1, Ordering::Relaxed);
        self.issue(|c| c.prepare_query(spec)).await
    }

    pub async fn execute_prepared(&self, cursor: CursorId) -> Result<()> {
        self.issue(move |c| c.execute_prepared(cursor)).await
    }

    pub async fn close_cursor(&self, cursor: CursorId) -> Result<()> {
        self.issue(move |c| c.close_cursor(cursor)).await
    }

    /// Fetch the next row from a cursor. Returns `Ok(None)` at the end of
    /// the cursor; otherwise a snapshot with repeated/already-fetched
    /// columns merged from `previous`.
    pub async fn fetch(
        &self,
        cursor: CursorId,
        previous: Option<&RowSnapshot>,
    ) -> Result<Option<RowSnapshot>> {
        self.fetch_with_decoder(cursor, previous, &PassthroughGeometry)
            .await
    }

    /// `fetch` with a caller-supplied geometry decoder for the designated
    /// geometry column.
    pub async fn fetch_with_decoder(
        &self,
        cursor: CursorId,
        previous: Option<&RowSnapshot>,
        geometry: &dyn GeometryDecoder,
    ) -> Result<Option<RowSnapshot>> {
        match self.issue(move |c| c.fetch(cursor)).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(RowSnapshot::from_raw(raw, previous, geometry)?)),
        }
    }

    // ------------------------------------------------------------------
    // Version states
    // ------------------------------------------------------------------

    pub async fn version(&self, name: &str) -> Result<VersionDef> {
        self.issue(|c| c.version(name))
            .await
            .map_err(|e| remap_lookup(name, e))
    }

    pub async fn state(&self, id: StateId) -> Result<StateDef> {
        self.issue(move |c| c.state(id)).await
    }

    pub async fn close_state(&self, id: StateId) -> Result<()> {
        self.issue(move |c| c.close_state(id)).await
    }

    pub async fn merge_states(&self, target: StateId, source: StateId) -> Result<()> {
        self.issue(move |c| c.merge_states(target, source)).await
    }

    /// Create a new child state for versioned editing.
    ///
    /// Two paths: close the parent so it can directly parent the new
    /// state; if the parent cannot be closed because it is open in
    /// another stream or owned by another principal, branch from the
    /// parent's parent instead and merge the contended parent in, so both
    /// states converge on equivalent content.
    pub async fn create_child_state(&self, parent: StateId) -> Result<StateDef> {
        self.issue(move |c| {
            let parent_def = c.state(parent)?;
            let real_parent = match c.close_state(parent) {
                Ok(()) => parent,
                Err(e) if e.is_state_in_use() || e.is_permission_denied() => {
                    match parent_def.parent {
                        Some(grandparent) => grandparent,
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            };
            let child = c.create_state(real_parent)?;
            if real_parent != parent {
                c.merge_states(child.id, parent)?;
            }
            c.state(child.id)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Lifecycle (driven by the pools)
    // ------------------------------------------------------------------

    /// Take an activation: passivated sessions become active, active
    /// sessions gain a reference. Called by the pool immediately before
    /// lending.
    pub(crate) fn activate(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.lifecycle = match state.lifecycle {
            Lifecycle::Passivated => Lifecycle::Active(1),
            Lifecycle::Active(n) => Lifecycle::Active(n + 1),
            Lifecycle::Disposed => {
                return Err(PoolError::IllegalState(format!(
                    "session {} is disposed",
                    self.id
                )));
            }
        };
        Ok(())
    }

    /// Drop an activation. At zero references the session either
    /// passivates for recycling or, past the auto-close threshold, is
    /// flagged for destruction. Fails without releasing when a
    /// transaction is still active: the caller must commit or roll back
    /// first.
    pub(crate) fn release(&self) -> Result<ReleaseOutcome> {
        let mut state = self.lock_state();
        match state.lifecycle {
            Lifecycle::Disposed => Err(PoolError::IllegalState(format!(
                "session {} is already disposed",
                self.id
            ))),
            Lifecycle::Passivated => Err(PoolError::IllegalState(format!(
                "session {} is not active",
                self.id
            ))),
            Lifecycle::Active(n) if n > 1 => {
                state.lifecycle = Lifecycle::Active(n - 1);
                Ok(ReleaseOutcome::StillHeld)
            }
            Lifecycle::Active(_) => {
                if state.transaction_active {
                    return Err(PoolError::IllegalState(format!(
                        "session {} still has a transaction in progress; \
                         commit or roll back before disposing",
                        self.id
                    )));
                }
                if self.risky_ops.load(Ordering::Relaxed) >= self.auto_close_threshold {
                    state.lifecycle = Lifecycle::Disposed;
                    Ok(ReleaseOutcome::Destroy)
                } else {
                    state.lifecycle = Lifecycle::Passivated;
                    Ok(ReleaseOutcome::Recycle)
                }
            }
        }
    }

    /// Mark the session terminally dead, whatever state it was in.
    pub(crate) fn force_disposed(&self) {
        self.lock_state().lifecycle = Lifecycle::Disposed;
    }

    /// Close the native connection, reporting failures at debug level
    /// only; by this point the session is already disposed.
    pub(crate) async fn close_native(&self) {
        let mut guard = self.conn.lock().await;
        if let Err(e) = guard.close() {
            debug!("session {} native close failed: {}", self.id, e);
        }
    }

    /// Synchronous best-effort variant for drop paths. The connection
    /// itself releases server resources when dropped, so a missed close
    /// here only loses the error report.
    pub(crate) fn close_native_now(&self) {
        if let Ok(mut guard) = self.conn.try_lock() {
            if let Err(e) = guard.close() {
                debug!("session {} native close failed: {}", self.id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server identity this session is connected to, for diagnostics.
    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn reference_count(&self) -> usize {
        match self.lock_state().lifecycle {
            Lifecycle::Active(n) => n,
            _ => 0,
        }
    }

    pub fn is_passivated(&self) -> bool {
        self.lock_state().lifecycle == Lifecycle::Passivated
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_state().lifecycle == Lifecycle::Disposed
    }

    /// How many risky operations this session has performed.
    pub fn risky_op_count(&self) -> usize {
        self.risky_ops.load(Ordering::Relaxed)
    }
}

fn remap_lookup(name: &str, err: PoolError) -> PoolError {
    match err {
        PoolError::Native { code, message } => {
            PoolError::for_lookup(name, crate::native::NativeError::new(code, message))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::memory::MemoryBackend;
    use crate::native::Connector;

    fn test_session(backend: &MemoryBackend) -> Session {
        let config = ConnectionConfig::new("sde_user", "secret").auto_close_threshold(3);
        let conn = backend.connect(&config).expect("connect");
        let session = Session::new(1, conn, &config);
        session.activate().expect("activate");
        session
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let backend = MemoryBackend::new();
        let session = test_session(&backend);

        assert!(!session.is_transaction_active());
        session.start_transaction().await.unwrap();
        assert!(session.is_transaction_active());
        session.commit_transaction().await.unwrap();
        assert!(!session.is_transaction_active());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let backend = MemoryBackend::new();
        let session = test_session(&backend);

        session.start_transaction().await.unwrap();
        let err = session.start_transaction().await.unwrap_err();
        assert!(matches!(err, PoolError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_transaction_flag() {
        let backend = MemoryBackend::new();
        let session = test_session(&backend);

        session.start_transaction().await.unwrap();
        backend.fail_next_commit();
        assert!(session.commit_transaction().await.is_err());
        assert!(session.is_transaction_active());
    }

    #[tokio::test]
    async fn test_rollback_failure_clears_transaction_flag() {
        let backend = MemoryBackend::new();
        let session = test_session(&backend);

        session.start_transaction().await.unwrap();
        backend.fail_next_rollback();
        assert!(session.rollback_transaction().await.is_err());
        assert!(!session.is_transaction_active());
    }

    #[tokio::test]
    async fn test_release_with_transaction_fails() {
        let backend = MemoryBackend::new();
        let session = test_session(&backend);

        session.start_transaction().await.unwrap();
        let err = session.release().unwrap_err();
        assert!(matches!(err, PoolError::IllegalState(_)));
        assert_eq!(session.reference_count(), 1);

        session.rollback_transaction().await.unwrap();
        assert_eq!(session.release().unwrap(), ReleaseOutcome::Recycle);
    }

    #[tokio::test]
    async fn test_passivated_session_fails_fast() {
        let backend = MemoryBackend::new();
        let session = test_session(&backend);

        assert_eq!(session.release().unwrap(), ReleaseOutcome::Recycle);
        assert!(session.is_passivated());
        let err = session.issue(|c| c.ping()).await.unwrap_err();
        assert!(matches!(err, PoolError::IllegalState(_)));
    }

    #[tokio::test]
    async fn test_activation_counting() {
        let backend = MemoryBackend::new();
        let session = test_session(&backend);

        session.activate().unwrap();
        assert_eq!(session.reference_count(), 2);
        assert_eq!(session.release().unwrap(), ReleaseOutcome::StillHeld);
        assert_eq!(session.reference_count(), 1);
        assert_eq!(session.release().unwrap(), ReleaseOutcome::Recycle);
        assert_eq!(session.reference_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_close_threshold_forces_destroy() {
        let backend = MemoryBackend::new().with_table(
            "parcels",
            vec![crate::native::ColumnDef::new("id", crate::core::CellType::Int32)],
            vec![],
        );
        let session = test_session(&backend);

        let spec = QuerySpec::new("parcels");
        for _ in 0..3 {
            session.prepare_query(&spec).await.unwrap();
        }
        assert_eq!(session.risky_op_count(), 3);
        assert_eq!(session.release().unwrap(), ReleaseOutcome::Destroy);
        assert!(session.is_disposed());
    }

    #[tokio::test]
    async fn test_metadata_cache_hits_skip_native_lookup() {
        let backend = MemoryBackend::new().with_table(
            "parcels",
            vec![crate::native::ColumnDef::new("id", crate::core::CellType::Int32)],
            vec![],
        );
        let session = test_session(&backend);

        let first = session.table("parcels").await.unwrap();
        let second = session.table("parcels").await.unwrap();
        assert_eq!(first, second);

        let err = session.table("missing").await.unwrap_err();
        assert!(matches!(err, PoolError::NotFound(_)));
    }
}
