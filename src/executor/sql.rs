// SPDX-License-Identifier: MIT

use super::Executor;
use crate::engine::ExecutionState;
use crate::error::BackendError;
use crate::workflow::SqlConfig;
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Map, Number, Value};

/// SQLite backend. Each call opens its own connection on a blocking thread.
#[derive(Debug, Clone, Default)]
pub struct SqlExecutor;

impl SqlExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Executor<SqlConfig> for SqlExecutor {
    async fn execute(
        &self,
        config: &SqlConfig,
        _state: &ExecutionState,
    ) -> Result<Value, BackendError> {
        let config = config.clone();
        tokio::task::spawn_blocking(move || run(&config))
            .await
            .map_err(|e| BackendError::Io(std::io::Error::other(e.to_string())))?
    }
}

fn open(connection: &str) -> Result<Connection, BackendError> {
    let target = connection
        .strip_prefix("sqlite://")
        .or_else(|| connection.strip_prefix("sqlite:"))
        .unwrap_or(connection);
    if target.is_empty() || target == ":memory:" {
        return Ok(Connection::open_in_memory()?);
    }
    Ok(Connection::open(target)?)
}

fn run(config: &SqlConfig) -> Result<Value, BackendError> {
    let connection = config
        .connection
        .as_deref()
        .ok_or_else(|| BackendError::invalid_config("sql.connection is not set"))?;
    let mut conn = open(connection)?;

    if let Some(query) = &config.query {
        log::debug!("sql: {}", query);
        return Ok(run_query(&conn, query, &config.params, config.max_rows)?);
    }
    if config.queries.is_empty() {
        return Err(BackendError::invalid_config("sql needs query or queries"));
    }

    let mut results = Map::new();
    if config.transaction {
        let tx = conn.transaction()?;
        for named in &config.queries {
            let out = run_query(&tx, &named.query, &named.params, config.max_rows)?;
            results.insert(named.name.clone(), out);
        }
        tx.commit()?;
    } else {
        for named in &config.queries {
            let out = run_query(&conn, &named.query, &named.params, config.max_rows)?;
            results.insert(named.name.clone(), out);
        }
    }
    Ok(Value::Object(results))
}

/// Rows as objects for statements that return columns, otherwise the
/// affected row count and last insert id
fn run_query(
    conn: &Connection,
    query: &str,
    params: &[Value],
    max_rows: Option<usize>,
) -> Result<Value, rusqlite::Error> {
    let mut stmt = conn.prepare(query)?;
    let bound: Vec<SqlValue> = params.iter().map(to_sql).collect();

    if stmt.column_count() == 0 {
        let affected = stmt.execute(params_from_iter(bound))?;
        return Ok(json!({
            "rowsAffected": affected,
            "lastInsertId": conn.last_insert_rowid(),
        }));
    }

    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(bound))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if max_rows.is_some_and(|max| out.len() >= max) {
            break;
        }
        let mut obj = Map::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            obj.insert(name.clone(), from_sql(row.get_ref(i)?));
        }
        out.push(Value::Object(obj));
    }
    Ok(Value::Array(out))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::NamedQuery;

    fn db() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db").to_string_lossy().into_owned();
        (dir, path)
    }

    async fn sql(config: SqlConfig) -> Result<Value, BackendError> {
        SqlExecutor::new()
            .execute(&config, &ExecutionState::default())
            .await
    }

    #[tokio::test]
    async fn test_named_queries_in_transaction() {
        let (_dir, path) = db();
        let out = sql(SqlConfig {
            connection: Some(format!("sqlite://{}", path)),
            transaction: true,
            queries: vec![
                NamedQuery {
                    name: "create".into(),
                    query: "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)".into(),
                    params: vec![],
                },
                NamedQuery {
                    name: "insert".into(),
                    query: "INSERT INTO users (name) VALUES (?1), (?2)".into(),
                    params: vec![json!("ada"), json!("grace")],
                },
            ],
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(out["insert"]["rowsAffected"], json!(2));

        let rows = sql(SqlConfig {
            connection: Some(path.clone()),
            query: Some("SELECT id, name FROM users WHERE id >= ?1 ORDER BY id".into()),
            params: vec![json!(1)],
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(
            rows,
            json!([{"id": 1, "name": "ada"}, {"id": 2, "name": "grace"}])
        );

        let limited = sql(SqlConfig {
            connection: Some(path),
            query: Some("SELECT name FROM users ORDER BY id".into()),
            max_rows: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(limited, json!([{"name": "ada"}]));
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let (_dir, path) = db();
        sql(SqlConfig {
            connection: Some(path.clone()),
            query: Some("CREATE TABLE t (v INTEGER NOT NULL)".into()),
            ..Default::default()
        })
        .await
        .unwrap();

        let err = sql(SqlConfig {
            connection: Some(path.clone()),
            transaction: true,
            queries: vec![
                NamedQuery {
                    name: "ok".into(),
                    query: "INSERT INTO t (v) VALUES (1)".into(),
                    params: vec![],
                },
                NamedQuery {
                    name: "bad".into(),
                    query: "INSERT INTO t (v) VALUES (NULL)".into(),
                    params: vec![],
                },
            ],
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BackendError::Sql(_)));

        let count = sql(SqlConfig {
            connection: Some(path),
            query: Some("SELECT COUNT(*) AS n FROM t".into()),
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(count, json!([{"n": 0}]));
    }

    #[tokio::test]
    async fn test_in_memory_and_value_types() {
        let out = sql(SqlConfig {
            connection: Some(":memory:".into()),
            query: Some("SELECT ?1 AS flag, ?2 AS ratio, ?3 AS nothing".into()),
            params: vec![json!(true), json!(0.5), Value::Null],
            ..Default::default()
        })
        .await
        .unwrap();
        assert_eq!(out, json!([{"flag": 1, "ratio": 0.5, "nothing": null}]));
    }

    #[tokio::test]
    async fn test_missing_connection() {
        let err = sql(SqlConfig {
            query: Some("SELECT 1".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
    }
}
