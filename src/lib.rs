//! Bounded session pooling and serialized access for expensive native
//! connections to a remote spatial database.
//!
//! Many concurrent callers are multiplexed over a small set of
//! single-threaded native connections: a pool lends sessions under a
//! min/max policy with a bounded wait, each session serializes every
//! operation against its connection, and row snapshots decouple fetched
//! values from cursor lifetime. Sessions that perform too many
//! leak-prone operations get their connection replaced instead of
//! recycled.
//!
//! ```no_run
//! use std::sync::Arc;
//! use geopool::{
//!     ConnectionConfig, MemoryBackend, PoolRegistry, QuerySpec, SessionProvider,
//! };
//!
//! # async fn demo() -> geopool::Result<()> {
//! let registry = PoolRegistry::new(Arc::new(MemoryBackend::new()));
//! let config = ConnectionConfig::new("sde_user", "secret")
//!     .host("gis.example.com")
//!     .instance("production");
//!
//! let pool = registry.create_pool(&config).await?;
//! let mut lease = pool.session().await?;
//!
//! let cursor = lease.session()
//!     .create_and_execute_query(&QuerySpec::new("roads"))
//!     .await?;
//! while let Some(row) = lease.session().fetch(cursor, None).await? {
//!     println!("{:?}", row.value_by_name("name"));
//! }
//!
//! lease.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod native;
pub mod session;

// Re-export main types for convenience
pub use crate::core::{CellType, CellValue, PoolError, Result};

// Re-export the native interface consumed beneath the pool
pub use native::{
    codes, memory::MemoryBackend, ColumnDef, Connector, CursorId, FetchStatus, LayerDef,
    NativeConnection, NativeError, NativeResult, QuerySpec, RawCell, RawRow, StateDef, StateId,
    TableDef, VersionDef,
};

// Re-export the session/pool API
pub use session::{
    config::ConnectionConfig,
    lease::SessionLease,
    pool::{PoolStats, SessionPool},
    registry::{PoolRegistry, SessionProvider},
    row::{GeometryDecoder, PassthroughGeometry, RowSnapshot},
    single::SingleSessionPool,
    Session,
};
