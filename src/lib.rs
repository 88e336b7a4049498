//! litedb: a lightweight SQL access facade.
//!
//! Callers bind named connections into an explicit [`ExecutionContext`] and run
//! queries, inserts, transactions and batches through [`Db`] without passing
//! connection handles around. Compiled insert statements are cached per
//! connection in a cache shared by every context.
//!
//! ```no_run
//! use litedb::{Db, DbConnection, ExecutionContext, params};
//!
//! # async fn demo() -> litedb::error::DbResult<()> {
//! let db: Db<DbConnection> = Db::default();
//! let mut ctx = ExecutionContext::new();
//! db.open_url(&mut ctx, "sqlite::memory:").await?;
//! db.exec(&mut ctx, "CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT)").await?;
//! let id = db.exec_insert(&mut ctx, "INSERT INTO t(name) VALUES(?)", "id", &params!["Alice"]).await?;
//! let rows = db.find_all(&mut ctx, "SELECT * FROM t WHERE id = ?", &params![id]).await?;
//! db.close(&mut ctx).await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod models;

pub use config::{Config, Settings};
pub use db::{Db, DbConnection, ExecutionContext, RowStream};
pub use error::DbError;
