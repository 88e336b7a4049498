//! litedb command-line front end.
//!
//! Opens one named connection, runs a single command against it and closes it.

use clap::Parser;
use litedb::config::{Command, Config};
use litedb::db::sql::split_statements;
use litedb::db::{Db, DbConnection, DriverConfig, ExecutionContext};
use litedb::error::{DbError, DbResult};
use litedb::format::format_rows;
use litedb::models::SqlParam;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging. Logs go to stderr so command
/// output on stdout stays clean.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn parse_params(raw: &[String]) -> Vec<SqlParam> {
    raw.iter().map(|p| SqlParam::parse_literal(p)).collect()
}

async fn run(
    db: &Db<DbConnection>,
    ctx: &mut ExecutionContext<DbConnection>,
    config: &Config,
) -> DbResult<String> {
    match &config.command {
        Command::Query { sql, params } => {
            let start = Instant::now();
            let rows = db.find_all(ctx, sql, &parse_params(params)).await?;
            Ok(format_rows(
                config.format,
                &rows,
                start.elapsed().as_millis() as u64,
            ))
        }
        Command::Exec { sql, params } => {
            let rows = if params.is_empty() {
                db.exec(ctx, sql).await?
            } else {
                db.exec_with(ctx, sql, &parse_params(params)).await?
            };
            Ok(format!("{rows} rows affected"))
        }
        Command::Insert { sql, key, params } => {
            let id = db.exec_insert(ctx, sql, key, &parse_params(params)).await?;
            Ok(id.to_string())
        }
        Command::Count {
            table,
            filter,
            params,
        } => {
            let count = db
                .count_where(ctx, table, filter, &parse_params(params))
                .await?;
            Ok(count.to_string())
        }
        Command::Script { file } => run_script(db, ctx, file).await,
    }
}

/// Run every statement of a script in one transaction.
async fn run_script(
    db: &Db<DbConnection>,
    ctx: &mut ExecutionContext<DbConnection>,
    file: &Path,
) -> DbResult<String> {
    let script = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| DbError::invalid_input(format!("Cannot read {}: {e}", file.display())))?;
    let statements = split_statements(&script)?;

    db.open_transaction(ctx).await?;
    let mut total = 0;
    for (index, statement) in statements.iter().enumerate() {
        match db.exec(ctx, statement).await {
            Ok(rows) => total += rows,
            Err(e) => {
                error!(statement = index + 1, error = %e, "Script failed, rolling back");
                if let Err(rollback) = db.rollback_transaction(ctx).await {
                    error!(error = %rollback, "Rollback failed");
                }
                return Err(e);
            }
        }
    }
    db.commit_transaction(ctx).await?;
    Ok(format!(
        "{} statements executed, {total} rows affected",
        statements.len()
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();
    init_tracing(&config);

    info!("Starting litedb v{}", env!("CARGO_PKG_VERSION"));

    let db: Db<DbConnection> = Db::new(config.settings()).named(config.name.clone());
    let mut ctx = ExecutionContext::with_label("cli");
    let source = DriverConfig::from_url(config.url.clone())?
        .with_credentials(config.user.clone(), config.password.clone());
    db.open_with(&mut ctx, &source).await?;

    let result = run(&db, &mut ctx, &config).await;
    db.close(&mut ctx).await;

    match result {
        Ok(output) => {
            println!("{output}");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            Err(e.into())
        }
    }
}
