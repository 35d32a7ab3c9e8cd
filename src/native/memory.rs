//! In-memory implementation of the native client interface.
//!
//! Backs the pool subsystem with an in-process store so the whole stack is
//! exercisable without a spatial database server: scripted rows with fetch
//! statuses, a version-state tree with contention flags, and failure
//! injection for connect, liveness and transaction verbs.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::CellValue;
use crate::session::config::ConnectionConfig;

use super::{
    codes, ColumnDef, Connector, CursorId, LayerDef, NativeConnection, NativeError, NativeResult,
    QuerySpec, RawCell, RawRow, StateDef, StateId, TableDef, VersionDef,
};

struct MemTable {
    def: TableDef,
    geometry_column: Option<usize>,
    rows: Vec<Vec<RawCell>>,
}

struct MemState {
    parent: Option<StateId>,
    owner: String,
    open: bool,
    in_use: bool,
    content: BTreeSet<i64>,
}

#[derive(Default)]
struct BackendState {
    tables: HashMap<String, MemTable>,
    layers: HashMap<String, LayerDef>,
    versions: HashMap<String, StateId>,
    states: HashMap<StateId, MemState>,
    next_state: i64,

    connect_failures: VecDeque<NativeError>,
    ping_failures: usize,
    commit_failures: usize,
    rollback_failures: usize,

    live_connections: usize,
    peak_connections: usize,
    total_connects: usize,
}

/// Shared in-memory "server". Cloning shares the same state, so a backend
/// handed to a pool can still be inspected and scripted from a test.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
}

fn lock(state: &Arc<Mutex<BackendState>>) -> MutexGuard<'_, BackendState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with scripted raw rows. Row cells are served
    /// verbatim, statuses included, in registration order per cursor.
    pub fn with_raw_table(
        self,
        name: &str,
        columns: Vec<ColumnDef>,
        geometry_column: Option<usize>,
        rows: Vec<Vec<RawCell>>,
    ) -> Self {
        let def = TableDef {
            name: name.to_string(),
            columns,
            row_id_column: None,
        };
        lock(&self.state).tables.insert(
            name.to_string(),
            MemTable {
                def,
                geometry_column,
                rows,
            },
        );
        self
    }

    /// Register a table whose rows are all plain fresh values.
    pub fn with_table(
        self,
        name: &str,
        columns: Vec<ColumnDef>,
        rows: Vec<Vec<CellValue>>,
    ) -> Self {
        let raw = rows
            .into_iter()
            .map(|row| row.into_iter().map(RawCell::fresh).collect())
            .collect();
        self.with_raw_table(name, columns, None, raw)
    }

    pub fn with_layer(self, layer: LayerDef) -> Self {
        lock(&self.state).layers.insert(layer.name.clone(), layer);
        self
    }

    pub fn with_version(self, name: &str, state: StateId) -> Self {
        lock(&self.state).versions.insert(name.to_string(), state);
        self
    }

    /// Create a state node directly on the server, bypassing any
    /// connection. Returns the new id.
    pub fn add_state(&self, parent: Option<StateId>, owner: &str, content: &[i64]) -> StateId {
        let mut st = lock(&self.state);
        st.next_state += 1;
        let id = StateId(st.next_state);
        st.states.insert(
            id,
            MemState {
                parent,
                owner: owner.to_string(),
                open: true,
                in_use: false,
                content: content.iter().copied().collect(),
            },
        );
        id
    }

    /// Flag a state as opened by another stream, so closing it fails.
    pub fn set_state_in_use(&self, id: StateId, in_use: bool) {
        if let Some(s) = lock(&self.state).states.get_mut(&id) {
            s.in_use = in_use;
        }
    }

    pub fn state_content(&self, id: StateId) -> Vec<i64> {
        lock(&self.state)
            .states
            .get(&id)
            .map(|s| s.content.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn state_parent(&self, id: StateId) -> Option<StateId> {
        lock(&self.state).states.get(&id).and_then(|s| s.parent)
    }

    /// Fail the next `n` connect attempts with the given code.
    pub fn fail_connects(&self, n: usize, code: i32) {
        let mut st = lock(&self.state);
        for _ in 0..n {
            st.connect_failures
                .push_back(NativeError::new(code, "injected connect failure"));
        }
    }

    pub fn fail_next_pings(&self, n: usize) {
        lock(&self.state).ping_failures = n;
    }

    pub fn fail_next_commit(&self) {
        lock(&self.state).commit_failures += 1;
    }

    pub fn fail_next_rollback(&self) {
        lock(&self.state).rollback_failures += 1;
    }

    pub fn live_connections(&self) -> usize {
        lock(&self.state).live_connections
    }

    /// High-water mark of simultaneously live connections.
    pub fn peak_connections(&self) -> usize {
        lock(&self.state).peak_connections
    }

    pub fn total_connects(&self) -> usize {
        lock(&self.state).total_connects
    }
}

impl Connector for MemoryBackend {
    fn connect(&self, config: &ConnectionConfig) -> NativeResult<Box<dyn NativeConnection>> {
        let mut st = lock(&self.state);
        if let Some(err) = st.connect_failures.pop_front() {
            return Err(err);
        }
        st.total_connects += 1;
        st.live_connections += 1;
        st.peak_connections = st.peak_connections.max(st.live_connections);
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            user: config.username.clone(),
            cursors: HashMap::new(),
            next_cursor: 0,
            in_transaction: false,
            closed: false,
        }))
    }
}

struct Cursor {
    columns: Arc<[String]>,
    geometry_column: Option<usize>,
    rows: VecDeque<Vec<RawCell>>,
    executed: bool,
}

pub struct MemoryConnection {
    state: Arc<Mutex<BackendState>>,
    user: String,
    cursors: HashMap<u64, Cursor>,
    next_cursor: u64,
    in_transaction: bool,
    closed: bool,
}

impl MemoryConnection {
    fn open(&mut self, spec: &QuerySpec, executed: bool) -> NativeResult<CursorId> {
        let st = lock(&self.state);
        let table = st.tables.get(&spec.table).ok_or_else(|| {
            NativeError::new(codes::TABLE_NOT_FOUND, format!("table {}", spec.table))
        })?;

        let all_names: Vec<String> = table.def.columns.iter().map(|c| c.name.clone()).collect();
        let (indexes, names): (Vec<usize>, Vec<String>) = if spec.columns.is_empty() {
            ((0..all_names.len()).collect(), all_names)
        } else {
            let mut idx = Vec::with_capacity(spec.columns.len());
            for wanted in &spec.columns {
                let pos = all_names.iter().position(|n| n == wanted).ok_or_else(|| {
                    NativeError::new(codes::COLUMN_NOT_FOUND, format!("column {}", wanted))
                })?;
                idx.push(pos);
            }
            (idx, spec.columns.clone())
        };

        let geometry_column = table
            .geometry_column
            .and_then(|g| indexes.iter().position(|&i| i == g));
        let rows = table
            .rows
            .iter()
            .map(|row| indexes.iter().map(|&i| row[i].clone()).collect())
            .collect();
        drop(st);

        self.next_cursor += 1;
        let id = self.next_cursor;
        self.cursors.insert(
            id,
            Cursor {
                columns: names.into(),
                geometry_column,
                rows,
                executed,
            },
        );
        Ok(CursorId(id))
    }

    fn cursor_mut(&mut self, cursor: CursorId) -> NativeResult<&mut Cursor> {
        self.cursors
            .get_mut(&cursor.0)
            .ok_or_else(|| NativeError::new(codes::INVALID_CURSOR, format!("{}", cursor)))
    }
}

impl NativeConnection for MemoryConnection {
    fn ping(&mut self) -> NativeResult<()> {
        let mut st = lock(&self.state);
        if st.ping_failures > 0 {
            st.ping_failures -= 1;
            return Err(NativeError::new(codes::NET_FAILURE, "server unreachable"));
        }
        Ok(())
    }

    fn begin(&mut self) -> NativeResult<()> {
        if self.in_transaction {
            return Err(NativeError::new(
                codes::TRANSACTION_FAILURE,
                "transaction already open",
            ));
        }
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> NativeResult<()> {
        let mut st = lock(&self.state);
        if st.commit_failures > 0 {
            st.commit_failures -= 1;
            return Err(NativeError::new(codes::TRANSACTION_FAILURE, "commit rejected"));
        }
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> NativeResult<()> {
        let mut st = lock(&self.state);
        if st.rollback_failures > 0 {
            st.rollback_failures -= 1;
            return Err(NativeError::new(
                codes::TRANSACTION_FAILURE,
                "rollback rejected",
            ));
        }
        self.in_transaction = false;
        Ok(())
    }

    fn describe(&mut self, table: &str) -> NativeResult<Vec<ColumnDef>> {
        lock(&self.state)
            .tables
            .get(table)
            .map(|t| t.def.columns.clone())
            .ok_or_else(|| NativeError::new(codes::TABLE_NOT_FOUND, format!("table {}", table)))
    }

    fn table(&mut self, name: &str) -> NativeResult<TableDef> {
        lock(&self.state)
            .tables
            .get(name)
            .map(|t| t.def.clone())
            .ok_or_else(|| NativeError::new(codes::TABLE_NOT_FOUND, format!("table {}", name)))
    }

    fn layer(&mut self, name: &str) -> NativeResult<LayerDef> {
        lock(&self.state)
            .layers
            .get(name)
            .cloned()
            .ok_or_else(|| NativeError::new(codes::LAYER_NOT_FOUND, format!("layer {}", name)))
    }

    fn layers(&mut self) -> NativeResult<Vec<LayerDef>> {
        let mut layers: Vec<LayerDef> = lock(&self.state).layers.values().cloned().collect();
        layers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(layers)
    }

    fn open_query(&mut self, spec: &QuerySpec) -> NativeResult<CursorId> {
        self.open(spec, true)
    }

    fn prepare_query(&mut self, spec: &QuerySpec) -> NativeResult<CursorId> {
        self.open(spec, false)
    }

    fn execute_prepared(&mut self, cursor: CursorId) -> NativeResult<()> {
        self.cursor_mut(cursor)?.executed = true;
        Ok(())
    }

    fn fetch(&mut self, cursor: CursorId) -> NativeResult<Option<RawRow>> {
        let c = self.cursor_mut(cursor)?;
        if !c.executed {
            return Err(NativeError::new(
                codes::INVALID_CURSOR,
                "cursor prepared but not executed",
            ));
        }
        Ok(c.rows.pop_front().map(|cells| RawRow {
            columns: Arc::clone(&c.columns),
            cells,
            geometry_column: c.geometry_column,
        }))
    }

    fn close_cursor(&mut self, cursor: CursorId) -> NativeResult<()> {
        self.cursors
            .remove(&cursor.0)
            .map(|_| ())
            .ok_or_else(|| NativeError::new(codes::INVALID_CURSOR, format!("{}", cursor)))
    }

    fn version(&mut self, name: &str) -> NativeResult<VersionDef> {
        lock(&self.state)
            .versions
            .get(name)
            .map(|&state_id| VersionDef {
                name: name.to_string(),
                state_id,
            })
            .ok_or_else(|| NativeError::new(codes::VERSION_NOT_FOUND, format!("version {}", name)))
    }

    fn state(&mut self, id: StateId) -> NativeResult<StateDef> {
        lock(&self.state)
            .states
            .get(&id)
            .map(|s| StateDef {
                id,
                parent: s.parent,
                owner: s.owner.clone(),
                open: s.open,
            })
            .ok_or_else(|| NativeError::new(codes::STATE_NOT_FOUND, format!("{}", id)))
    }

    fn create_state(&mut self, parent: StateId) -> NativeResult<StateDef> {
        let mut st = lock(&self.state);
        let content = st
            .states
            .get(&parent)
            .map(|p| p.content.clone())
            .ok_or_else(|| NativeError::new(codes::STATE_NOT_FOUND, format!("{}", parent)))?;
        st.next_state += 1;
        let id = StateId(st.next_state);
        st.states.insert(
            id,
            MemState {
                parent: Some(parent),
                owner: self.user.clone(),
                open: true,
                in_use: false,
                content,
            },
        );
        Ok(StateDef {
            id,
            parent: Some(parent),
            owner: self.user.clone(),
            open: true,
        })
    }

    fn close_state(&mut self, id: StateId) -> NativeResult<()> {
        let mut st = lock(&self.state);
        let state = st
            .states
            .get_mut(&id)
            .ok_or_else(|| NativeError::new(codes::STATE_NOT_FOUND, format!("{}", id)))?;
        if state.in_use {
            return Err(NativeError::new(
                codes::STATE_IN_USE,
                format!("{} is open in another stream", id),
            ));
        }
        if state.owner != self.user {
            return Err(NativeError::new(
                codes::NO_PERMISSIONS,
                format!("{} is owned by {}", id, state.owner),
            ));
        }
        state.open = false;
        Ok(())
    }

    fn merge_states(&mut self, target: StateId, source: StateId) -> NativeResult<()> {
        let mut st = lock(&self.state);
        let source_content = st
            .states
            .get(&source)
            .map(|s| s.content.clone())
            .ok_or_else(|| NativeError::new(codes::STATE_NOT_FOUND, format!("{}", source)))?;
        let target_state = st
            .states
            .get_mut(&target)
            .ok_or_else(|| NativeError::new(codes::STATE_NOT_FOUND, format!("{}", target)))?;
        target_state.content.extend(source_content);
        Ok(())
    }

    fn close(&mut self) -> NativeResult<()> {
        if !self.closed {
            self.closed = true;
            lock(&self.state).live_connections -= 1;
        }
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
