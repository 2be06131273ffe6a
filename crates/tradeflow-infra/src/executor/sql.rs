//! Read-only `database_query` executor over the SQLite reader pool.

use serde_json::{Map, Value, json};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tradeflow_core::workflow::executor::{StepError, StepExecutor, StepOutcome, StepRequest};

use super::cancellable;

const DEFAULT_MAX_ROWS: usize = 1000;

/// Run a single `SELECT` (or `WITH ... SELECT`) and return rows as JSON
/// objects.
///
/// Config parameters:
/// - `query` (required): SQL with `?` placeholders; never templated
/// - `params`: list of templated bind values
/// - `max_rows`: cap on returned rows (default 1000)
/// - `context_key`: also export the rows under this context key
pub struct DatabaseQueryExecutor {
    pool: SqlitePool,
}

impl DatabaseQueryExecutor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Accept exactly one read statement.
fn check_read_only(sql: &str) -> Result<&str, StepError> {
    let trimmed = sql.trim().trim_end_matches(';').trim_end();
    if trimmed.contains(';') {
        return Err(StepError::InvalidInput(
            "database_query accepts a single statement".to_string(),
        ));
    }
    let first = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if first != "SELECT" && first != "WITH" {
        return Err(StepError::InvalidInput(format!(
            "database_query only runs SELECT statements, got '{first}'"
        )));
    }
    Ok(trimmed)
}

fn column_value(row: &SqliteRow, index: usize) -> Result<Value, sqlx::Error> {
    let type_name = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };
    Ok(match type_name.as_str() {
        "INTEGER" | "INT8" | "BIGINT" | "BOOLEAN" => json!(row.try_get::<i64, _>(index)?),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => json!(row.try_get::<f64, _>(index)?),
        "BLOB" => json!(row.try_get::<Vec<u8>, _>(index)?),
        _ => Value::String(row.try_get::<String, _>(index)?),
    })
}

fn row_to_json(row: &SqliteRow) -> Result<Value, sqlx::Error> {
    let mut object = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), column_value(row, index)?);
    }
    Ok(Value::Object(object))
}

impl StepExecutor for DatabaseQueryExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome, StepError> {
        let config = &request.step.config;
        let sql = config
            .param_str("query")
            .ok_or_else(|| StepError::InvalidInput("database_query requires a 'query' parameter".to_string()))?;
        let sql = check_read_only(sql)?;
        let max_rows = config
            .param("max_rows")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_ROWS);

        let params: Vec<Value> = match config.param("params") {
            Some(Value::Array(items)) => items.iter().map(|v| request.context.render_value(v)).collect(),
            Some(_) => {
                return Err(StepError::InvalidInput("'params' must be a list".to_string()));
            }
            None => Vec::new(),
        };

        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64()),
                },
                Value::String(s) => query.bind(s),
                other => query.bind(other.to_string()),
            };
        }

        let rows = cancellable(&request.cancel, async {
            query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StepError::ExecutionFailed(format!("query failed: {e}")))
        })
        .await?;

        let truncated = rows.len() > max_rows;
        let rows: Vec<Value> = rows
            .iter()
            .take(max_rows)
            .map(row_to_json)
            .collect::<Result<_, _>>()
            .map_err(|e| StepError::ExecutionFailed(format!("cannot decode row: {e}")))?;

        tracing::debug!(step = %request.step.name, rows = rows.len(), truncated, "query completed");

        let mut outcome = StepOutcome::new(json!({
            "rows": rows.clone(),
            "row_count": rows.len(),
            "truncated": truncated,
        }))
        .with_metric("rows_returned", rows.len() as f64);
        if let Some(key) = config.param_str("context_key") {
            outcome = outcome.with_update(key, Value::Array(rows));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::request;
    use super::*;
    use crate::sqlite::pool::DatabasePool;
    use tradeflow_types::workflow::StepKind;

    async fn pool_with_products() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("query.db").display());
        std::mem::forget(dir);
        let pool = DatabasePool::new(&url).await.unwrap();
        sqlx::query("CREATE TABLE products (sku TEXT, price REAL, stock INTEGER, note TEXT)")
            .execute(&pool.writer)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO products VALUES ('A1', 9.5, 3, NULL), ('B2', 20.0, 0, 'backorder'), ('C3', 4.25, 12, NULL)",
        )
        .execute(&pool.writer)
        .await
        .unwrap();
        pool
    }

    #[test]
    fn test_check_read_only() {
        assert_eq!(check_read_only("  select 1; ").unwrap(), "select 1");
        assert!(check_read_only("WITH x AS (SELECT 1) SELECT * FROM x").is_ok());
        assert!(matches!(check_read_only("DELETE FROM products"), Err(StepError::InvalidInput(_))));
        assert!(matches!(
            check_read_only("SELECT 1; DROP TABLE products"),
            Err(StepError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn query_binds_templated_params_and_decodes_types() {
        let pool = pool_with_products().await;
        let req = request(
            StepKind::DatabaseQuery,
            json!({
                "query": "SELECT sku, price, stock, note FROM products WHERE stock >= ? ORDER BY sku",
                "params": ["{{ input_data.min_stock }}"],
                "context_key": "in_stock",
            }),
            json!({"min_stock": 1}),
        );

        let outcome = DatabaseQueryExecutor::new(pool.reader.clone())
            .execute(&req)
            .await
            .unwrap();
        assert_eq!(outcome.output["row_count"], json!(2));
        assert_eq!(
            outcome.output["rows"][0],
            json!({"sku": "A1", "price": 9.5, "stock": 3, "note": null})
        );
        assert_eq!(outcome.output["rows"][1]["sku"], json!("C3"));
        assert_eq!(outcome.metrics["rows_returned"], 2.0);
        assert!(outcome.context_updates.contains_key("in_stock"));
    }

    #[tokio::test]
    async fn query_truncates_to_max_rows() {
        let pool = pool_with_products().await;
        let req = request(
            StepKind::DatabaseQuery,
            json!({"query": "SELECT sku FROM products ORDER BY sku", "max_rows": 1}),
            json!({}),
        );

        let outcome = DatabaseQueryExecutor::new(pool.reader.clone())
            .execute(&req)
            .await
            .unwrap();
        assert_eq!(outcome.output["row_count"], json!(1));
        assert_eq!(outcome.output["truncated"], json!(true));
    }

    #[tokio::test]
    async fn query_rejects_writes_and_reports_sql_errors() {
        let pool = pool_with_products().await;
        let executor = DatabaseQueryExecutor::new(pool.reader.clone());

        let write = request(
            StepKind::DatabaseQuery,
            json!({"query": "UPDATE products SET stock = 0"}),
            json!({}),
        );
        assert!(matches!(executor.execute(&write).await, Err(StepError::InvalidInput(_))));

        let broken = request(
            StepKind::DatabaseQuery,
            json!({"query": "SELECT missing_column FROM products"}),
            json!({}),
        );
        assert!(matches!(executor.execute(&broken).await, Err(StepError::ExecutionFailed(_))));
    }
}
