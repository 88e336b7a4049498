//! Failure-path tests for the access facade using a scripted connection.
//!
//! A real backend rarely fails on demand, so these tests drive the facade
//! through an in-memory `Connection` whose behavior is configured per test and
//! whose calls are recorded for inspection.

use futures_util::StreamExt;
use futures_util::stream;
use litedb::config::Settings;
use litedb::db::{
    BoundParam, Connection, ConnectionSource, Db, ExecOutcome, ExecutionContext, LargeObjectError,
    NO_GENERATED_KEY, PreparedStatement, ROW_BY_ROW_FETCH_SIZE, RowCursor, StatementConfig,
};
use litedb::error::DbError;
use litedb::models::{DatabaseType, Row, SqlParam};
use litedb::params;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug)]
enum LobBehavior {
    Supported,
    Unsupported,
    Unimplemented,
    BindFails,
}

#[derive(Clone, Copy, Debug)]
enum KeyBehavior {
    Generated(i64),
    Missing,
    Fails,
}

#[derive(Clone, Debug)]
struct Script {
    db_type: DatabaseType,
    lob: LobBehavior,
    key: KeyBehavior,
    fail_close: bool,
    fail_statement_close: bool,
    /// Execution fails when the first parameter equals this value.
    fail_on: Option<SqlParam>,
    rows: usize,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            db_type: DatabaseType::SQLite,
            lob: LobBehavior::Supported,
            key: KeyBehavior::Generated(42),
            fail_close: false,
            fail_statement_close: false,
            fail_on: None,
            rows: 3,
        }
    }
}

#[derive(Default, Debug)]
struct Calls {
    prepares: Vec<(String, StatementConfig)>,
    executions: Vec<Vec<BoundParam>>,
    fetch_configs: Vec<StatementConfig>,
    transaction: Vec<&'static str>,
    statements_cleared: bool,
    closed: bool,
}

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Calls>>,
    statements_closed: Arc<AtomicUsize>,
    cursors_released: Arc<AtomicUsize>,
}

impl Recorder {
    fn calls(&self) -> std::sync::MutexGuard<'_, Calls> {
        self.calls.lock().unwrap()
    }
}

struct MockConnection {
    script: Script,
    recorder: Recorder,
}

struct MockStatement {
    sql: String,
    key_column: Option<String>,
    fail_close: bool,
    closed: Arc<AtomicUsize>,
}

impl PreparedStatement for MockStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn key_column(&self) -> Option<&str> {
        self.key_column.as_deref()
    }

    fn close(self) -> Result<(), sqlx::Error> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            Err(sqlx::Error::Protocol("statement close failed".into()))
        } else {
            Ok(())
        }
    }
}

/// Counts a cursor release when the stream owning it is dropped.
struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl Connection for MockConnection {
    type Statement = MockStatement;

    fn database_type(&self) -> DatabaseType {
        self.script.db_type
    }

    async fn prepare(
        &mut self,
        sql: &str,
        config: &StatementConfig,
    ) -> Result<MockStatement, sqlx::Error> {
        self.recorder
            .calls()
            .prepares
            .push((sql.to_string(), config.clone()));
        Ok(MockStatement {
            sql: sql.to_string(),
            key_column: config.generated_key.clone(),
            fail_close: self.script.fail_statement_close,
            closed: Arc::clone(&self.recorder.statements_closed),
        })
    }

    async fn execute(
        &mut self,
        _statement: &MockStatement,
        params: &[BoundParam],
    ) -> Result<ExecOutcome, sqlx::Error> {
        self.recorder.calls().executions.push(params.to_vec());
        if let (Some(fail_on), Some(BoundParam::Value(first))) =
            (&self.script.fail_on, params.first())
        {
            if fail_on == first {
                return Err(sqlx::Error::Protocol("scripted execution failure".into()));
            }
        }
        let generated_key = match self.script.key {
            KeyBehavior::Generated(key) => Ok(Some(key)),
            KeyBehavior::Missing => Ok(None),
            KeyBehavior::Fails => Err(sqlx::Error::ColumnNotFound("id".into())),
        };
        Ok(ExecOutcome {
            rows_affected: 1,
            generated_key,
        })
    }

    async fn execute_unprepared(&mut self, _sql: &str) -> Result<u64, sqlx::Error> {
        Ok(0)
    }

    fn fetch<'c>(
        &'c mut self,
        _sql: &'c str,
        _params: &'c [SqlParam],
        config: &StatementConfig,
    ) -> RowCursor<'c> {
        self.recorder.calls().fetch_configs.push(config.clone());
        let guard = ReleaseGuard(Arc::clone(&self.recorder.cursors_released));
        let rows: Vec<Result<Row, sqlx::Error>> = (0..self.script.rows)
            .map(|i| {
                let mut row = Row::new();
                row.insert("n".into(), json!(i));
                Ok(row)
            })
            .collect();
        stream::iter(rows)
            .map(move |row| {
                let _ = &guard;
                row
            })
            .boxed()
    }

    fn create_large_object(&mut self, bytes: &[u8]) -> Result<BoundParam, LargeObjectError> {
        match self.script.lob {
            LobBehavior::Supported => Ok(BoundParam::LargeObject(bytes.to_vec())),
            LobBehavior::Unsupported => Err(LargeObjectError::Unsupported),
            LobBehavior::Unimplemented => Err(LargeObjectError::Unimplemented),
            LobBehavior::BindFails => Err(LargeObjectError::Bind(sqlx::Error::Protocol(
                "cannot bind".into(),
            ))),
        }
    }

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        self.recorder.calls().transaction.push("begin");
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        self.recorder.calls().transaction.push("commit");
        Err(sqlx::Error::Protocol("commit refused".into()))
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        self.recorder.calls().transaction.push("rollback");
        Ok(())
    }

    async fn clear_statements(&mut self) -> Result<(), sqlx::Error> {
        self.recorder.calls().statements_cleared = true;
        Ok(())
    }

    async fn close(self) -> Result<(), sqlx::Error> {
        self.recorder.calls().closed = true;
        if self.script.fail_close {
            Err(sqlx::Error::Protocol("close failed".into()))
        } else {
            Ok(())
        }
    }
}

struct MockSource {
    script: Script,
    recorder: Recorder,
    fail: bool,
}

impl ConnectionSource for MockSource {
    type Connection = MockConnection;

    async fn acquire(&self) -> Result<MockConnection, sqlx::Error> {
        if self.fail {
            return Err(sqlx::Error::PoolTimedOut);
        }
        Ok(MockConnection {
            script: self.script.clone(),
            recorder: self.recorder.clone(),
        })
    }

    fn describe(&self) -> String {
        "mock://primary".to_string()
    }
}

fn bound(script: Script) -> (Db<MockConnection>, ExecutionContext<MockConnection>, Recorder) {
    let recorder = Recorder::default();
    let db = Db::new(Settings {
        log_exceptions: true,
    });
    let mut ctx = ExecutionContext::new();
    db.attach(
        &mut ctx,
        MockConnection {
            script,
            recorder: recorder.clone(),
        },
    )
    .unwrap();
    (db, ctx, recorder)
}

#[tokio::test]
async fn test_open_failure_is_initialization_error() {
    let db: Db<MockConnection> = Db::default();
    let mut ctx = ExecutionContext::new();
    let source = MockSource {
        script: Script::default(),
        recorder: Recorder::default(),
        fail: true,
    };
    let err = db.open_with(&mut ctx, &source).await.unwrap_err();
    match err {
        DbError::Initialization { url, .. } => assert_eq!(url, "mock://primary"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!db.has_connection(&ctx));
}

#[tokio::test]
async fn test_open_rejects_duplicate_before_acquiring() {
    let (db, mut ctx, _) = bound(Script::default());
    let source = MockSource {
        script: Script::default(),
        recorder: Recorder::default(),
        fail: true,
    };
    // a failing source proves acquire is never reached
    let err = db.open_with(&mut ctx, &source).await.unwrap_err();
    assert!(matches!(err, DbError::DuplicateBinding { .. }));
    db.close(&mut ctx).await;
}

#[tokio::test]
async fn test_close_failure_never_raises_and_always_unbinds() {
    let (db, mut ctx, recorder) = bound(Script {
        fail_close: true,
        fail_statement_close: true,
        ..Script::default()
    });
    db.exec_insert(&mut ctx, "INSERT INTO t(a) VALUES(?)", "id", &params![1])
        .await
        .unwrap();

    db.close(&mut ctx).await;
    assert!(!db.has_connection(&ctx));
    assert!(recorder.calls().closed);
    // the cached statement was closed despite failing
    assert_eq!(recorder.statements_closed.load(Ordering::SeqCst), 1);
    assert_eq!(db.cache().connection_count(), 0);
}

#[tokio::test]
async fn test_detach_does_not_close_connection() {
    let (db, mut ctx, recorder) = bound(Script::default());
    db.exec_insert(&mut ctx, "INSERT INTO t(a) VALUES(?)", "id", &params![1])
        .await
        .unwrap();
    let conn = db.detach(&mut ctx).await.unwrap();
    assert!(!recorder.calls().closed);
    assert!(recorder.calls().statements_cleared);
    assert_eq!(recorder.statements_closed.load(Ordering::SeqCst), 1);
    assert_eq!(conn.database_type(), DatabaseType::SQLite);
}

#[tokio::test]
async fn test_dropped_context_evicts_cached_statements() {
    let (db, mut ctx, recorder) = bound(Script::default());
    db.exec_insert(&mut ctx, "INSERT INTO t(a) VALUES(?)", "id", &params![1])
        .await
        .unwrap();
    assert_eq!(db.cache().connection_count(), 1);

    drop(ctx);
    assert_eq!(db.cache().connection_count(), 0);
    assert_eq!(recorder.statements_closed.load(Ordering::SeqCst), 1);
    assert!(!recorder.calls().closed);
}

#[tokio::test]
async fn test_exec_insert_recompiles_for_other_key_column() {
    let (db, mut ctx, recorder) = bound(Script::default());
    let sql = "INSERT INTO t(a) VALUES(?)";
    db.exec_insert(&mut ctx, sql, "id", &params![1]).await.unwrap();
    db.exec_insert(&mut ctx, sql, "id", &params![2]).await.unwrap();
    db.exec_insert(&mut ctx, sql, "serial_no", &params![3])
        .await
        .unwrap();

    let keys: Vec<Option<String>> = recorder
        .calls()
        .prepares
        .iter()
        .map(|(_, config)| config.generated_key.clone())
        .collect();
    assert_eq!(keys, vec![Some("id".to_string()), Some("serial_no".to_string())]);
    // the replaced statement was released, the new one is cached in its place
    assert_eq!(recorder.statements_closed.load(Ordering::SeqCst), 1);
    db.close(&mut ctx).await;
    assert_eq!(recorder.statements_closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_exec_insert_prepares_once_per_connection() {
    let (db, mut ctx, recorder) = bound(Script::default());
    let sql = "INSERT INTO t(a) VALUES(?)";
    for n in 0..5 {
        let key = db
            .exec_insert(&mut ctx, sql, "id", &params![n])
            .await
            .unwrap();
        assert_eq!(key, 42);
    }
    {
        let calls = recorder.calls();
        assert_eq!(calls.prepares.len(), 1);
        assert_eq!(calls.prepares[0].1.generated_key.as_deref(), Some("id"));
        assert_eq!(calls.executions.len(), 5);
    }
    db.close(&mut ctx).await;
}

#[tokio::test]
async fn test_key_extraction_failure_yields_sentinel() {
    for behavior in [KeyBehavior::Missing, KeyBehavior::Fails] {
        let (db, mut ctx, _) = bound(Script {
            key: behavior,
            ..Script::default()
        });
        let key = db
            .exec_insert(&mut ctx, "INSERT INTO t(a) VALUES(?)", "id", &params![1])
            .await
            .unwrap();
        assert_eq!(key, NO_GENERATED_KEY, "{behavior:?}");
        db.close(&mut ctx).await;
    }
}

#[tokio::test]
async fn test_bytes_bound_as_large_object_when_supported() {
    let (db, mut ctx, recorder) = bound(Script::default());
    db.exec_insert(
        &mut ctx,
        "INSERT INTO t(a, b) VALUES(?, ?)",
        "id",
        &params!["x", vec![1u8, 2, 3]],
    )
    .await
    .unwrap();
    assert_eq!(
        recorder.calls().executions[0],
        vec![
            BoundParam::Value(SqlParam::from("x")),
            BoundParam::LargeObject(vec![1, 2, 3]),
        ]
    );
    db.close(&mut ctx).await;
}

#[tokio::test]
async fn test_bytes_fall_back_to_plain_value_on_each_lob_failure() {
    for lob in [
        LobBehavior::Unsupported,
        LobBehavior::Unimplemented,
        LobBehavior::BindFails,
    ] {
        let (db, mut ctx, recorder) = bound(Script {
            lob,
            ..Script::default()
        });
        db.exec_insert(
            &mut ctx,
            "INSERT INTO t(b) VALUES(?)",
            "id",
            &params![vec![9u8]],
        )
        .await
        .unwrap();
        assert_eq!(
            recorder.calls().executions[0],
            vec![BoundParam::Value(SqlParam::Bytes(vec![9]))],
            "{lob:?}"
        );
        db.close(&mut ctx).await;
    }
}

#[tokio::test]
async fn test_mysql_queries_stream_row_by_row() {
    let (db, mut ctx, recorder) = bound(Script {
        db_type: DatabaseType::MySQL,
        ..Script::default()
    });
    let rows = db.find_all(&mut ctx, "SELECT n FROM t", &[]).await.unwrap();
    assert_eq!(rows.len(), 3);

    let calls = recorder.calls();
    let config = &calls.fetch_configs[0];
    assert!(config.forward_only);
    assert!(config.read_only);
    assert_eq!(config.fetch_size, Some(ROW_BY_ROW_FETCH_SIZE));
    drop(calls);
    db.close(&mut ctx).await;
}

#[tokio::test]
async fn test_other_dialects_use_default_fetch() {
    for db_type in [DatabaseType::PostgreSQL, DatabaseType::SQLite] {
        let (db, mut ctx, recorder) = bound(Script {
            db_type,
            ..Script::default()
        });
        db.find_all(&mut ctx, "SELECT n FROM t", &[]).await.unwrap();
        assert_eq!(recorder.calls().fetch_configs[0], StatementConfig::default());
        db.close(&mut ctx).await;
    }
}

#[tokio::test]
async fn test_stream_releases_cursor_exactly_once() {
    let (db, mut ctx, recorder) = bound(Script {
        rows: 10,
        ..Script::default()
    });

    // exhausted
    db.find_all(&mut ctx, "SELECT n FROM t", &[]).await.unwrap();
    assert_eq!(recorder.cursors_released.load(Ordering::SeqCst), 1);

    // aborted early, then dropped
    {
        let mut rows = db.find(&mut ctx, "SELECT n FROM t", &[]).unwrap();
        rows.next().await.unwrap().unwrap();
        rows.abort();
        assert_eq!(recorder.cursors_released.load(Ordering::SeqCst), 2);
    }
    assert_eq!(recorder.cursors_released.load(Ordering::SeqCst), 2);

    // abandoned without abort
    {
        let mut rows = db.find(&mut ctx, "SELECT n FROM t", &[]).unwrap();
        rows.next().await.unwrap().unwrap();
    }
    assert_eq!(recorder.cursors_released.load(Ordering::SeqCst), 3);

    // never polled
    drop(db.find(&mut ctx, "SELECT n FROM t", &[]).unwrap());
    assert_eq!(recorder.cursors_released.load(Ordering::SeqCst), 4);
    db.close(&mut ctx).await;
}

#[tokio::test]
async fn test_exec_with_closes_statement_on_failure() {
    let (db, mut ctx, recorder) = bound(Script {
        fail_on: Some(SqlParam::Int(13)),
        ..Script::default()
    });
    let err = db
        .exec_with(&mut ctx, "DELETE FROM t WHERE id = ?", &params![13])
        .await
        .unwrap_err();
    assert_eq!(err.sql(), Some("DELETE FROM t WHERE id = ?"));
    assert!(err.to_string().contains("scripted execution failure"));
    assert_eq!(recorder.statements_closed.load(Ordering::SeqCst), 1);

    assert_eq!(
        db.exec_with(&mut ctx, "DELETE FROM t WHERE id = ?", &params![1])
            .await
            .unwrap(),
        1
    );
    assert_eq!(recorder.statements_closed.load(Ordering::SeqCst), 2);
    db.close(&mut ctx).await;
}

#[tokio::test]
async fn test_transaction_failures_are_access_errors() {
    let (db, mut ctx, recorder) = bound(Script::default());
    db.open_transaction(&mut ctx).await.unwrap();
    let err = db.commit_transaction(&mut ctx).await.unwrap_err();
    assert!(matches!(err, DbError::Access { .. }));
    assert_eq!(err.sql(), Some("COMMIT"));
    db.rollback_transaction(&mut ctx).await.unwrap();
    assert_eq!(recorder.calls().transaction, vec!["begin", "commit", "rollback"]);
    db.close(&mut ctx).await;

    let err = db.open_transaction(&mut ctx).await.unwrap_err();
    assert!(err.to_string().contains("open transaction"));
}

#[tokio::test]
async fn test_batch_failure_clears_queue() {
    let (db, mut ctx, recorder) = bound(Script {
        fail_on: Some(SqlParam::from("bad")),
        ..Script::default()
    });
    let mut batch = db
        .start_batch(&mut ctx, "INSERT INTO t(a) VALUES(?)")
        .await
        .unwrap();
    for value in ["a", "bad", "c"] {
        db.add_batch(&mut batch, params![value]).unwrap();
    }
    let err = db.execute_batch(&mut ctx, &mut batch).await.unwrap_err();
    assert!(err.to_string().contains("params: bad"));
    assert!(batch.is_empty());
    // units after the failing one were not attempted
    assert_eq!(recorder.calls().executions.len(), 2);

    db.add_batch(&mut batch, params!["d"]).unwrap();
    db.add_batch(&mut batch, params!["e"]).unwrap();
    assert_eq!(
        db.execute_batch(&mut ctx, &mut batch).await.unwrap(),
        vec![1, 1]
    );
    batch.close();
    assert_eq!(recorder.statements_closed.load(Ordering::SeqCst), 1);
    db.close(&mut ctx).await;
}

#[tokio::test]
async fn test_batch_bound_to_its_connection() {
    let (db, mut ctx, _) = bound(Script::default());
    let mut batch = db
        .start_batch(&mut ctx, "INSERT INTO t(a) VALUES(?)")
        .await
        .unwrap();
    db.add_batch(&mut batch, params![1]).unwrap();

    // rebind the name to a different connection
    let conn = db.detach(&mut ctx).await.unwrap();
    db.attach(&mut ctx, conn).unwrap();

    let err = db.execute_batch(&mut ctx, &mut batch).await.unwrap_err();
    assert!(matches!(err, DbError::Access { .. }));
    batch.close();
    db.close(&mut ctx).await;
}

#[tokio::test]
async fn test_named_facades_are_independent_bindings() {
    let recorder = Recorder::default();
    let db: Db<MockConnection> = Db::default();
    let other = db.named("other");
    let mut ctx = ExecutionContext::new();
    let source = MockSource {
        script: Script::default(),
        recorder: recorder.clone(),
        fail: false,
    };
    db.open_with(&mut ctx, &source).await.unwrap();
    other.open_with(&mut ctx, &source).await.unwrap();
    assert_eq!(
        db.connections(&ctx),
        vec!["default".to_string(), "other".to_string()]
    );

    other.close(&mut ctx).await;
    assert!(db.has_connection(&ctx));
    assert!(!other.has_connection(&ctx));
    db.close(&mut ctx).await;
}
