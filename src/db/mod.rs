//! Database access layer.
//!
//! - [`registry`]: per-execution-context bindings of logical names to live connections
//! - [`statement_cache`]: compiled statements shared across contexts, keyed by connection
//! - [`facade`]: the [`Db`] entry point tying both together
//! - [`connection`]: the driver seam the facade is generic over
//! - [`driver`]: sqlx-backed connections for PostgreSQL, MySQL and SQLite

pub mod batch;
pub mod connection;
pub mod driver;
pub mod facade;
#[macro_use]
pub mod macros;
pub mod params;
pub mod registry;
pub mod rows;
pub mod sql;
pub mod statement_cache;
pub mod types;

pub use batch::Batch;
pub use connection::{
    BoundParam, Connection, ConnectionId, ConnectionSource, ExecOutcome, FetchStrategy,
    LargeObjectError, PreparedStatement, ROW_BY_ROW_FETCH_SIZE, RowCursor, StatementConfig,
};
pub use driver::{DbConnection, DbPool, DbStatement, DriverConfig};
pub use facade::{Db, NO_GENERATED_KEY};
pub use registry::{BoundConnection, ConnectionRegistry, DEFAULT_CONNECTION_NAME, ExecutionContext};
pub use rows::RowStream;
pub use statement_cache::StatementCache;
