//! Statement-shape checks performed before anything reaches the backend.
//!
//! The facade only needs coarse answers: is this a SELECT, is this an INSERT,
//! and does it carry placeholders. Those are answered from the
//! [sqlparser](https://docs.rs/sqlparser/) token stream rather than a full
//! parse, so dialect-specific syntax the parser does not know still passes,
//! while keywords and `?` characters inside string literals, quoted
//! identifiers and comments are never mistaken for the real thing.

use crate::error::{DbError, DbResult};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};

/// Error messages for each validation failure.
mod error_messages {
    pub const EMPTY: &str = "Empty SQL statement";
    pub const NOT_SELECT: &str = "query must be a 'select' query";
    pub const NOT_INSERT: &str = "this method is only for inserts";
    pub const SELECT_IN_DML: &str = "expected DML, but got a select query";
    pub const NOT_PARAMETRIZED: &str = "query must be parametrized";
    pub const PARAMS_WITHOUT_PLACEHOLDERS: &str =
        "parameters were passed, but the query does not have placeholders: (?)";
}

/// Coarse description of a SQL statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlShape {
    /// First keyword of the statement, skipping comments and opening parentheses.
    pub leading: Option<Keyword>,
    pub has_select: bool,
    pub has_insert: bool,
    /// True when a data-modifying keyword appears anywhere in the statement.
    pub has_write: bool,
    pub has_returning: bool,
    /// Number of `?` / `$n` placeholder tokens.
    pub placeholders: usize,
}

impl SqlShape {
    /// SELECT-class statements return rows: `SELECT`, `VALUES`, or a `WITH`
    /// query whose body does not modify data.
    pub fn is_select_class(&self) -> bool {
        match self.leading {
            Some(Keyword::SELECT) | Some(Keyword::VALUES) => true,
            Some(Keyword::WITH) => !self.has_write,
            _ => false,
        }
    }
}

/// Tokenize `sql` and summarize it.
pub fn inspect(sql: &str) -> DbResult<SqlShape> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| DbError::invalid_input(format!("Failed to tokenize SQL: {e}")))?;

    let mut shape = SqlShape::default();
    let mut seen_token = false;
    for token in &tokens {
        match token {
            Token::Whitespace(_) => continue,
            Token::LParen if !seen_token => continue,
            Token::Word(word) if word.quote_style.is_none() => {
                if shape.leading.is_none() && !seen_token {
                    shape.leading = Some(word.keyword);
                }
                match word.keyword {
                    Keyword::SELECT => shape.has_select = true,
                    Keyword::INSERT => {
                        shape.has_insert = true;
                        shape.has_write = true;
                    }
                    Keyword::UPDATE | Keyword::DELETE | Keyword::MERGE | Keyword::REPLACE => {
                        shape.has_write = true
                    }
                    Keyword::RETURNING => shape.has_returning = true,
                    _ => {}
                }
            }
            Token::Placeholder(p) if p.starts_with('?') || p.starts_with('$') => {
                shape.placeholders += 1
            }
            _ => {}
        }
        seen_token = true;
    }

    if !seen_token {
        return Err(DbError::invalid_input(error_messages::EMPTY));
    }
    Ok(shape)
}

/// Split a script into statements at top-level semicolons. Blank statements
/// are dropped.
pub fn split_statements(script: &str) -> DbResult<Vec<String>> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, script)
        .tokenize()
        .map_err(|e| DbError::invalid_input(format!("Failed to tokenize SQL: {e}")))?;

    let mut statements = Vec::new();
    let mut current = String::new();
    for token in tokens {
        if token == Token::SemiColon {
            push_statement(&mut statements, &mut current);
        } else {
            current.push_str(&token.to_string());
        }
    }
    push_statement(&mut statements, &mut current);
    Ok(statements)
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = std::mem::take(current);
    if inspect(&statement).is_ok() {
        statements.push(statement.trim().to_string());
    }
}

/// Validate a statement passed to `find`.
pub fn ensure_query(sql: &str, param_count: usize) -> DbResult<SqlShape> {
    let shape = inspect(sql)?;
    if param_count > 0 && shape.placeholders == 0 {
        return Err(DbError::invalid_input(
            error_messages::PARAMS_WITHOUT_PLACEHOLDERS,
        ));
    }
    if !shape.has_select {
        return Err(DbError::invalid_input(error_messages::NOT_SELECT));
    }
    Ok(shape)
}

/// Validate a statement passed to `exec_insert`.
pub fn ensure_insert(sql: &str) -> DbResult<SqlShape> {
    let shape = inspect(sql)?;
    if !shape.has_insert {
        return Err(DbError::invalid_input(error_messages::NOT_INSERT));
    }
    Ok(shape)
}

/// Validate a statement passed to `exec`/`exec_with`. Parametrized statements
/// must contain at least one placeholder.
pub fn ensure_dml(sql: &str, parametrized: bool) -> DbResult<SqlShape> {
    let shape = inspect(sql)?;
    if shape.is_select_class() {
        return Err(DbError::invalid_input(error_messages::SELECT_IN_DML));
    }
    if parametrized && shape.placeholders == 0 {
        return Err(DbError::invalid_input(error_messages::NOT_PARAMETRIZED));
    }
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_detected_case_insensitively() {
        let shape = inspect("  select * from t").unwrap();
        assert_eq!(shape.leading, Some(Keyword::SELECT));
        assert!(shape.has_select);
        assert!(shape.is_select_class());
    }

    #[test]
    fn test_with_query_is_select_class() {
        let shape = inspect("WITH x AS (SELECT 1 AS a) SELECT a FROM x").unwrap();
        assert!(shape.is_select_class());
    }

    #[test]
    fn test_with_insert_is_not_select_class() {
        let shape = inspect("WITH x AS (SELECT 1) INSERT INTO t SELECT * FROM x").unwrap();
        assert!(!shape.is_select_class());
        assert!(shape.has_insert);
    }

    #[test]
    fn test_parenthesized_select() {
        assert!(inspect("(SELECT 1) UNION (SELECT 2)").unwrap().is_select_class());
    }

    #[test]
    fn test_placeholders_counted() {
        assert_eq!(inspect("SELECT * FROM t WHERE a = ? AND b = ?").unwrap().placeholders, 2);
        assert_eq!(inspect("SELECT * FROM t WHERE a = $1").unwrap().placeholders, 1);
    }

    #[test]
    fn test_question_mark_in_literal_is_not_placeholder() {
        let shape = inspect("SELECT * FROM t WHERE name = 'who?'").unwrap();
        assert_eq!(shape.placeholders, 0);
    }

    #[test]
    fn test_keyword_in_comment_or_literal_ignored() {
        let shape = inspect("-- select\nDELETE FROM t WHERE note = 'select'").unwrap();
        assert!(!shape.has_select);
        assert_eq!(shape.leading, Some(Keyword::DELETE));
    }

    #[test]
    fn test_returning_detected() {
        assert!(inspect("INSERT INTO t(a) VALUES(1) RETURNING id").unwrap().has_returning);
        assert!(!inspect("INSERT INTO t(a) VALUES('returning')").unwrap().has_returning);
    }

    #[test]
    fn test_split_statements() {
        let script = "CREATE TABLE t(a TEXT);\n-- comment only\n;INSERT INTO t VALUES('x;y');\n";
        let statements = split_statements(script).unwrap();
        assert_eq!(
            statements,
            vec![
                "CREATE TABLE t(a TEXT)".to_string(),
                "INSERT INTO t VALUES('x;y')".to_string(),
            ]
        );
    }

    #[test]
    fn test_empty_sql_rejected() {
        assert!(inspect("   ").unwrap_err().is_argument_error());
        assert!(inspect("/* nothing */").unwrap_err().is_argument_error());
    }

    #[test]
    fn test_ensure_query() {
        assert!(ensure_query("SELECT 1", 0).is_ok());
        assert!(ensure_query("DELETE FROM t", 0).unwrap_err().is_argument_error());
        assert!(ensure_query("SELECT * FROM t", 1).unwrap_err().is_argument_error());
        assert!(ensure_query("SELECT * FROM t WHERE id = ?", 1).is_ok());
    }

    #[test]
    fn test_ensure_insert() {
        assert!(ensure_insert("insert into t(name) values(?)").is_ok());
        assert!(ensure_insert("UPDATE t SET a = 1").unwrap_err().is_argument_error());
    }

    #[test]
    fn test_ensure_dml() {
        assert!(ensure_dml("SELECT 1", false).unwrap_err().is_argument_error());
        assert!(ensure_dml("CREATE TABLE t(id INTEGER)", false).is_ok());
        assert!(
            ensure_dml("INSERT INTO t VALUES(1)", true)
                .unwrap_err()
                .is_argument_error()
        );
        assert!(ensure_dml("INSERT INTO t VALUES(?)", true).is_ok());
        assert!(ensure_dml("select * from t where id = ?", true).is_err());
    }
}
