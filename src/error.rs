//! Error types for litedb.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! The taxonomy is deliberately small: connection setup, binding misuse,
//! operational failures (always carrying the SQL and parameters that were being
//! executed), and argument validation that happens before the backend is touched.

use crate::models::SqlParam;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Failed to connect to {url}: {message}")]
    Initialization { url: String, message: String },

    #[error(
        "Connection '{name}' is already bound in this context. Close or detach the previous connection first; this usually indicates a logic error."
    )]
    DuplicateBinding { name: String },

    #[error("{message}{}", query_context(.sql.as_deref(), .params))]
    Access {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        sql: Option<String>,
        params: Vec<String>,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl DbError {
    /// Create an initialization error for the given (masked) target.
    pub fn initialization(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Initialization {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a duplicate binding error.
    pub fn duplicate_binding(name: impl Into<String>) -> Self {
        Self::DuplicateBinding { name: name.into() }
    }

    /// Create an access error without query context.
    pub fn access(message: impl Into<String>) -> Self {
        Self::Access {
            message: message.into(),
            sql_state: None,
            sql: None,
            params: Vec::new(),
        }
    }

    /// Error raised when an operation needs a connection that is not bound.
    pub fn not_bound(name: &str, action: &str) -> Self {
        Self::access(format!(
            "Cannot {action}: there is no connection '{name}' in this context, are you sure you opened it?"
        ))
    }

    /// Wrap a native failure with the query and parameters being executed.
    pub fn query_failed(err: sqlx::Error, sql: &str, params: &[SqlParam]) -> Self {
        let sql_state = sql_state_of(&err);
        Self::Access {
            message: err.to_string(),
            sql_state,
            sql: Some(sql.to_string()),
            params: params.iter().map(ToString::to_string).collect(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// True for failures raised before anything was sent to the backend.
    pub fn is_argument_error(&self) -> bool {
        matches!(self, Self::InvalidInput { .. })
    }

    /// SQL text attached to an access error, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Access { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }

    /// Backend SQLSTATE attached to an access error, if the driver reported one.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Access { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }
}

/// Convert sqlx errors that happen outside of a specific query.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let sql_state = sql_state_of(&err);
        DbError::Access {
            message: err.to_string(),
            sql_state,
            sql: None,
            params: Vec::new(),
        }
    }
}

fn sql_state_of(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.to_string()),
        _ => None,
    }
}

fn query_context(sql: Option<&str>, params: &[String]) -> String {
    let Some(sql) = sql else {
        return String::new();
    };
    if params.is_empty() {
        format!(", query: {sql}")
    } else {
        format!(", query: {sql}, params: {}", params.join(", "))
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
