//! Interface to the native spatial database client library.
//!
//! The pool subsystem never talks to the server directly; it owns opaque
//! connection handles behind the [`NativeConnection`] trait and issues
//! narrow operations against them. Real deployments back this trait with
//! the vendor client; [`memory::MemoryBackend`] backs it with an in-process
//! store for tests and local development.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::core::{CellType, CellValue};
use crate::session::config::ConnectionConfig;

/// Error codes surfaced by the native client. The subset the pool layer
/// reacts to; everything else is carried through verbatim.
pub mod codes {
    /// Network round trip failed or the server went away.
    pub const NET_FAILURE: i32 = -10;
    /// Transient allocation failure inside the client's shared memory
    /// arena. The only creation error class the pool retries.
    pub const OUT_OF_CLIENT_MEMORY: i32 = -21;
    /// The authenticated principal may not touch the object.
    pub const NO_PERMISSIONS: i32 = -97;
    /// Cursor id is unknown or the cursor was not executed yet.
    pub const INVALID_CURSOR: i32 = -52;
    /// Transaction verb rejected by the server.
    pub const TRANSACTION_FAILURE: i32 = -60;
    pub const TABLE_NOT_FOUND: i32 = -37;
    pub const COLUMN_NOT_FOUND: i32 = -38;
    pub const LAYER_NOT_FOUND: i32 = -42;
    pub const VERSION_NOT_FOUND: i32 = -44;
    pub const STATE_NOT_FOUND: i32 = -45;
    /// A version state is open in another stream and cannot be closed.
    pub const STATE_IN_USE: i32 = -290;
    /// A version state has no parent to fall back to.
    pub const STATE_NO_PARENT: i32 = -291;
}

/// Failure reported by the native client, with the original code preserved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("code {code}: {message}")]
pub struct NativeError {
    pub code: i32,
    pub message: String,
}

impl NativeError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The spurious allocation error that warrants a connect retry.
    pub fn is_transient_alloc(&self) -> bool {
        self.code == codes::OUT_OF_CLIENT_MEMORY
    }

    pub fn is_state_in_use(&self) -> bool {
        self.code == codes::STATE_IN_USE
    }

    pub fn is_permission_denied(&self) -> bool {
        self.code == codes::NO_PERMISSIONS
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code,
            codes::TABLE_NOT_FOUND
                | codes::COLUMN_NOT_FOUND
                | codes::LAYER_NOT_FOUND
                | codes::VERSION_NOT_FOUND
                | codes::STATE_NOT_FOUND
        )
    }
}

pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Identifies an open cursor on one connection. Only meaningful on the
/// connection that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(pub u64);

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cursor_{}", self.0)
    }
}

/// Identifies a version state on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub i64);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state_{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: CellType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: CellType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Table metadata as returned by the native describe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub row_id_column: Option<String>,
}

/// Spatial layer metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDef {
    pub name: String,
    pub geometry_column: String,
    pub srid: i32,
}

/// A named version pointing at its current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDef {
    pub name: String,
    pub state_id: StateId,
}

/// A version state node: a checkpoint in the state tree used for
/// branching and merging edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDef {
    pub id: StateId,
    pub parent: Option<StateId>,
    pub owner: String,
    pub open: bool,
}

/// What to read: a table and an optional column projection (empty means
/// every column). Filter translation happens in layers above this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub table: String,
    pub columns: Vec<String>,
}

impl QuerySpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }
}

/// Per-column fetch indicator reported by the native cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// The value was read from the server on this fetch.
    Fresh,
    /// The value was already fetched on a previous row and the driver did
    /// not resend it; the caller fills it from the previous snapshot.
    AlreadyFetched,
    /// The row repeats the previous feature for this column.
    Repeated,
    Null,
}

/// One cell as it comes off the wire: status, decoded value, and the raw
/// byte stream the driver exposes for character columns it mis-reports as
/// null.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCell {
    pub status: FetchStatus,
    pub value: CellValue,
    pub pending_bytes: Option<Vec<u8>>,
}

impl RawCell {
    pub fn fresh(value: CellValue) -> Self {
        Self {
            status: FetchStatus::Fresh,
            value,
            pending_bytes: None,
        }
    }

    pub fn null() -> Self {
        Self {
            status: FetchStatus::Null,
            value: CellValue::Null,
            pending_bytes: None,
        }
    }

    /// Null-flagged cell that still carries streamable text content.
    pub fn null_with_stream(bytes: Vec<u8>) -> Self {
        Self {
            status: FetchStatus::Null,
            value: CellValue::Null,
            pending_bytes: Some(bytes),
        }
    }

    pub fn already_fetched() -> Self {
        Self {
            status: FetchStatus::AlreadyFetched,
            value: CellValue::Null,
            pending_bytes: None,
        }
    }

    pub fn repeated() -> Self {
        Self {
            status: FetchStatus::Repeated,
            value: CellValue::Null,
            pending_bytes: None,
        }
    }
}

/// One row as produced by a native fetch, before snapshotting.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub columns: Arc<[String]>,
    pub cells: Vec<RawCell>,
    /// Index of the designated geometry column, if the query has one.
    pub geometry_column: Option<usize>,
}

/// Creates native connections for one configuration.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> NativeResult<Box<dyn NativeConnection>>;
}

/// A live connection to the spatial database.
///
/// The handle is single-threaded: callers must guarantee exclusive access
/// for the duration of every call. The session layer enforces this with a
/// mutex held across each issued command. Implementations are expected to
/// release server resources when dropped; `close` exists so shutdown
/// errors can be observed.
pub trait NativeConnection: Send {
    /// Lightweight liveness probe, a server round trip.
    fn ping(&mut self) -> NativeResult<()>;

    fn begin(&mut self) -> NativeResult<()>;
    fn commit(&mut self) -> NativeResult<()>;
    fn rollback(&mut self) -> NativeResult<()>;

    fn describe(&mut self, table: &str) -> NativeResult<Vec<ColumnDef>>;
    fn table(&mut self, name: &str) -> NativeResult<TableDef>;
    fn layer(&mut self, name: &str) -> NativeResult<LayerDef>;
    fn layers(&mut self) -> NativeResult<Vec<LayerDef>>;

    /// Open a cursor and execute it immediately.
    fn open_query(&mut self, spec: &QuerySpec) -> NativeResult<CursorId>;
    /// Open a cursor without executing, so constraints can be attached
    /// before `execute_prepared`.
    fn prepare_query(&mut self, spec: &QuerySpec) -> NativeResult<CursorId>;
    fn execute_prepared(&mut self, cursor: CursorId) -> NativeResult<()>;
    /// `None` signals end of cursor.
    fn fetch(&mut self, cursor: CursorId) -> NativeResult<Option<RawRow>>;
    fn close_cursor(&mut self, cursor: CursorId) -> NativeResult<()>;

    fn version(&mut self, name: &str) -> NativeResult<VersionDef>;
    fn state(&mut self, id: StateId) -> NativeResult<StateDef>;
    fn create_state(&mut self, parent: StateId) -> NativeResult<StateDef>;
    fn close_state(&mut self, id: StateId) -> NativeResult<()>;
    fn merge_states(&mut self, target: StateId, source: StateId) -> NativeResult<()>;

    fn close(&mut self) -> NativeResult<()>;
}
