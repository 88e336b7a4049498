//! Configuration handling for litedb.
//!
//! The library itself recognizes a single option, [`Settings::log_exceptions`].
//! The command-line front end adds connection and logging options, all of which
//! can also come from the environment.

use crate::db::DEFAULT_CONNECTION_NAME;
use crate::format::OutputFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const LOG_EXCEPTIONS_ENV: &str = "LITEDB_LOG_EXCEPTIONS";

/// Options read by the access facade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    /// Log execution failures (with SQL and parameters) at error level before
    /// propagating them.
    pub log_exceptions: bool,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            log_exceptions: lookup(LOG_EXCEPTIONS_ENV)
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Command-line configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "litedb")]
#[command(author, version, about = "Run SQL against PostgreSQL, MySQL or SQLite", long_about = None)]
pub struct Config {
    /// Connection URL, e.g. sqlite:data.db or postgres://localhost/app
    #[arg(short, long, value_name = "URL", env = "LITEDB_URL")]
    pub url: String,

    /// User name; overrides the one in the URL
    #[arg(long, env = "LITEDB_USER")]
    pub user: Option<String>,

    /// Password; overrides the one in the URL
    #[arg(long, env = "LITEDB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Logical connection name
    #[arg(long, default_value = DEFAULT_CONNECTION_NAME)]
    pub name: String,

    /// Log failed statements with their parameters
    #[arg(long, env = LOG_EXCEPTIONS_ENV)]
    pub log_exceptions: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LITEDB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "LITEDB_JSON_LOGS")]
    pub json_logs: bool,

    /// Output format for query results
    #[arg(short, long, value_enum, default_value = "json")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    pub fn settings(&self) -> Settings {
        Settings {
            log_exceptions: self.log_exceptions,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a SELECT and print the rows
    Query {
        sql: String,
        /// Positional parameters
        params: Vec<String>,
    },
    /// Run a DML/DDL statement and print the affected row count
    Exec { sql: String, params: Vec<String> },
    /// Run an INSERT and print the generated key (-1 when none)
    Insert {
        sql: String,
        /// Column holding the generated key
        #[arg(long, default_value = "id")]
        key: String,
        params: Vec<String>,
    },
    /// Count the rows of a table
    Count {
        table: String,
        /// WHERE clause; "*" counts every row
        #[arg(long = "where", default_value = "*")]
        filter: String,
        params: Vec<String>,
    },
    /// Run a file of ';'-separated statements in one transaction
    Script { file: PathBuf },
}
