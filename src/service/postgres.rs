use super::{CommandExecutor, RelationalCommand};
use crate::error::Result;
use crate::shaper::{AsyncRowCursor, BufferedRows};
use crate::sql::PgBindValue;
use crate::value::Value;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Row, ValueRef};

/// Executes commands on a PostgreSQL pool. Results are read fully before shaping starts.
#[derive(Clone, Debug)]
pub struct PgCommandExecutor {
    pool: PgPool,
}

impl PgCommandExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CommandExecutor for PgCommandExecutor {
    async fn execute_reader_async(&self, command: &RelationalCommand) -> Result<Box<dyn AsyncRowCursor>> {
        tracing::debug!(sql = %command.sql, params = ?command.values(), "query");
        let mut query = sqlx::query(&command.sql);
        for p in &command.parameters {
            query = query.bind(PgBindValue::from_value(&p.value, &p.provider_type)?);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let field_count = rows.first().map_or(0, |r| r.len());
        let rows = rows.iter().map(row_values).collect();
        Ok(Box::new(BufferedRows::new(field_count, rows)))
    }
}

fn row_values(row: &PgRow) -> Vec<Value> {
    (0..row.len()).map(|i| cell_to_value(row, i)).collect()
}

/// Decodes the cell at `ordinal` by trying the supported column types in turn.
fn cell_to_value(row: &PgRow, ordinal: usize) -> Value {
    match row.try_get_raw(ordinal) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Err(_) => return Value::Null,
        Ok(_) => {}
    }
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(ordinal) {
        return Value::Int(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(ordinal) {
        return Value::Int(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(ordinal) {
        return Value::Int(n);
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(ordinal) {
        return Value::Float(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(ordinal) {
        return Value::Float(n);
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(ordinal) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(ordinal) {
        return Value::Uuid(u);
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(ordinal) {
        return Value::DateTime(d);
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(ordinal) {
        return Value::DateTime(d.naive_utc());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(ordinal) {
        return Value::Date(d);
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(ordinal) {
        return Value::Text(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<serde_json::Value>, _>(ordinal) {
        return Value::Json(j);
    }
    if let Ok(Some(b)) = row.try_get::<Option<Vec<u8>>, _>(ordinal) {
        return Value::Bytes(b);
    }
    Value::Null
}
