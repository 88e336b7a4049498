//! Parameter binding utilities for database queries.
//!
//! This module provides functions to bind `SqlParam` and `BoundParam` values to
//! database-specific query objects, positionally and in order.

use crate::db::connection::BoundParam;
use crate::models::SqlParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;
type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;
type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(query: MySqlQuery<'q>, param: &'q SqlParam) -> MySqlQuery<'q> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::String(v) => query.bind(v.as_str()),
        SqlParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(query: PgQuery<'q>, param: &'q SqlParam) -> PgQuery<'q> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::String(v) => query.bind(v.as_str()),
        SqlParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: SqliteQuery<'q>,
    param: &'q SqlParam,
) -> SqliteQuery<'q> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::String(v) => query.bind(v.as_str()),
        SqlParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

pub(crate) fn bind_mysql<'q>(query: MySqlQuery<'q>, param: &'q BoundParam) -> MySqlQuery<'q> {
    match param {
        BoundParam::Value(v) => bind_mysql_param(query, v),
        BoundParam::LargeObject(bytes) => query.bind(bytes.as_slice()),
    }
}

pub(crate) fn bind_postgres<'q>(query: PgQuery<'q>, param: &'q BoundParam) -> PgQuery<'q> {
    match param {
        BoundParam::Value(v) => bind_postgres_param(query, v),
        BoundParam::LargeObject(bytes) => query.bind(bytes.as_slice()),
    }
}

pub(crate) fn bind_sqlite<'q>(query: SqliteQuery<'q>, param: &'q BoundParam) -> SqliteQuery<'q> {
    match param {
        BoundParam::Value(v) => bind_sqlite_param(query, v),
        BoundParam::LargeObject(bytes) => query.bind(bytes.as_slice()),
    }
}
