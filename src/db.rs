//! Read-only SQLite data source laid out as `<root>/<db_id>/<db_id>.sqlite`.

use crate::compare::SqlSource;
use crate::row::Row;
use crate::state::QueryResult;
use crate::Result;
use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

const MAX_CONNECTIONS_PER_DATABASE: u32 = 2;

#[derive(Debug)]
pub struct SqliteSource {
    root: PathBuf,
    pools: Mutex<HashMap<String, SqlitePool>>,
}

impl SqliteSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn database_path(&self, database_id: &str) -> PathBuf {
        self.root
            .join(database_id)
            .join(format!("{}.sqlite", database_id))
    }

    async fn pool(&self, database_id: &str) -> Result<SqlitePool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(database_id) {
            return Ok(pool.clone());
        }
        let path = self.database_path(database_id);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS_PER_DATABASE)
            .connect_with(options)
            .await?;
        info!("Opened database {} at {}", database_id, path.display());
        pools.insert(database_id.to_string(), pool.clone());
        Ok(pool)
    }

    pub async fn close(&self) {
        let mut pools = self.pools.lock().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }
}

fn valid_database_id(database_id: &str) -> bool {
    !database_id.is_empty()
        && database_id != "."
        && database_id != ".."
        && !database_id.contains(['/', '\\'])
        && Path::new(database_id).components().count() == 1
}

fn decode_row(row: &SqliteRow) -> std::result::Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(idx)?),
                "REAL" | "NUMERIC" => Number::from_f64(row.try_get_unchecked::<f64, _>(idx)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::String(
                    String::from_utf8_lossy(&row.try_get_unchecked::<Vec<u8>, _>(idx)?)
                        .into_owned(),
                ),
                _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
            }
        };
        out.insert(column.name(), value);
    }
    Ok(out)
}

#[async_trait]
impl SqlSource for SqliteSource {
    async fn execute(&self, sql: &str, database_id: &str) -> anyhow::Result<QueryResult> {
        if !valid_database_id(database_id) {
            return Ok(QueryResult::error(format!(
                "invalid database id `{}`",
                database_id
            )));
        }
        let path = self.database_path(database_id);
        if !path.is_file() {
            return Ok(QueryResult::error(format!(
                "database file not found: {}",
                path.display()
            )));
        }
        let pool = match self.pool(database_id).await {
            Ok(pool) => pool,
            Err(e) => return Ok(QueryResult::error(e.to_string())),
        };

        debug!("Executing on {}: {}", database_id, sql);
        let fetched = match sqlx::query(sql).fetch_all(&pool).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Query failed on {}: {}", database_id, e);
                return Ok(QueryResult::error(e.to_string()));
            }
        };
        let rows = fetched
            .iter()
            .map(decode_row)
            .collect::<std::result::Result<Vec<_>, _>>();
        Ok(match rows {
            Ok(rows) => QueryResult::rows(rows),
            Err(e) => QueryResult::error(e.to_string()),
        })
    }
}
