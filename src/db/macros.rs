//! Helper macros.
//!
//! `impl_db_dispatch!` generates the per-backend match over a `DbConnection`
//! while keeping each arm linear and readable; `params!` builds a positional
//! parameter list from heterogeneous Rust values.

/// Macro for generating backend dispatch match arms over [`DbConnection`](crate::db::DbConnection).
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(conn, {
///     MySql(c) => do_mysql(c),
///     Postgres(c) => do_postgres(c),
///     SQLite(c) => do_sqlite(c),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::driver::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

/// Build a `Vec<SqlParam>` from values convertible into [`SqlParam`](crate::models::SqlParam).
///
/// ```
/// use litedb::params;
/// use litedb::models::SqlParam;
///
/// let p = params!["Alice", 42, None::<i64>];
/// assert_eq!(p, vec![SqlParam::from("Alice"), SqlParam::Int(42), SqlParam::Null]);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::models::SqlParam>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::models::SqlParam::from($value)),+]
    };
}

pub use impl_db_dispatch;
pub use params;
