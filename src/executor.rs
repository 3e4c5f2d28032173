//! SQL execution: a parser-backed read-only guard, the MySQL adapter, and
//! observation formatting for the correction loop and the final answer.

use crate::config::DatabaseConfig;
use crate::error::{AgentError, Result};
use crate::services::{QueryRows, SqlExecutor};
use async_trait::async_trait;
use serde_json::Value;
use sqlparser::ast::Statement;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row};
use tracing::debug;

/// Rejects anything that is not exactly one query statement. Runs before
/// every execution, including corrected retries.
pub fn ensure_select_only(sql: &str) -> Result<()> {
    let statements = Parser::parse_sql(&MySqlDialect {}, sql)
        .map_err(|e| AgentError::Execution(format!("SQL解析失败: {}", e)))?;
    match statements.as_slice() {
        [Statement::Query(_)] => Ok(()),
        [_] => Err(AgentError::Execution(
            "仅允许执行单条SELECT查询语句".to_string(),
        )),
        _ => Err(AgentError::Execution(
            "仅允许执行单条SQL语句".to_string(),
        )),
    }
}

pub struct MySqlExecutor {
    pool: MySqlPool,
}

impl MySqlExecutor {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .connect(&config.url())
            .await
            .map_err(|e| AgentError::Execution(format!("数据库连接失败: {}", e)))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SqlExecutor for MySqlExecutor {
    async fn execute(&self, sql: &str) -> Result<QueryRows> {
        ensure_select_only(sql)?;
        debug!(sql = %sql, "executing query");
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AgentError::Execution(e.to_string()))?;

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect()
            })
            .unwrap_or_default();
        let rows = rows
            .iter()
            .map(|row| (0..row.columns().len()).map(|i| decode_value(row, i)).collect())
            .collect();
        Ok(QueryRows { columns, rows })
    }
}

fn decode_value(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v
            .map(|dt| Value::from(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::from(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(Value::Null);
    }
    Value::Null
}

const INLINE_ROW_LIMIT: usize = 100;
const SAMPLE_ROWS: usize = 10;

/// Compact textual view of a result set, fed back to the model for
/// correction and used to phrase the final answer.
pub fn format_observation(rows: &QueryRows) -> String {
    if rows.is_empty() {
        return "查询成功，但没有返回任何数据。可能是筛选条件过严，或所选年份、地区没有对应记录。"
            .to_string();
    }
    let header = rows.columns.join(" | ");
    if rows.len() <= INLINE_ROW_LIMIT {
        let body: Vec<String> = rows.rows.iter().map(|r| render_row(r)).collect();
        return format!("共{}行。\n{}\n{}", rows.len(), header, body.join("\n"));
    }
    let sample: Vec<String> = rows
        .rows
        .iter()
        .take(SAMPLE_ROWS)
        .map(|r| render_row(r))
        .collect();
    format!(
        "共{}行，仅展示前{}行。\n{}\n{}",
        rows.len(),
        SAMPLE_ROWS,
        header,
        sample.join("\n")
    )
}

fn render_row(row: &[Value]) -> String {
    row.iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Null => "NULL".to_string(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" | ")
}
