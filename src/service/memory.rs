use super::{CommandExecutor, RelationalCommand};
use crate::error::Result;
use crate::shaper::{AsyncRowCursor, BufferedRows, RowCursor, ValueBuffer};
use crate::value::Value;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug)]
struct ScriptedResult {
    field_count: usize,
    rows: Vec<Vec<Value>>,
}

impl ScriptedResult {
    fn new(rows: Vec<Vec<Value>>) -> Self {
        ScriptedResult {
            field_count: rows.first().map_or(0, Vec::len),
            rows,
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    /// Results for commands whose SQL contains the fragment; reused on every match.
    by_sql: Vec<(String, ScriptedResult)>,
    /// Results handed out in order to commands no fragment matched.
    queued: VecDeque<ScriptedResult>,
    executed: Vec<RelationalCommand>,
}

/// A scripted store for running compiled queries without a database. Commands are recorded;
/// unscripted commands return an empty result.
#[derive(Clone, Debug, Default)]
pub struct InMemoryExecutor {
    script: Arc<Mutex<Script>>,
    row_delay: Option<Duration>,
}

impl InMemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Async reads wait `delay` before each row.
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }

    pub fn push_result(&self, rows: Vec<Vec<Value>>) {
        self.lock().queued.push_back(ScriptedResult::new(rows));
    }

    pub fn on_sql(&self, fragment: &str, rows: Vec<Vec<Value>>) {
        self.lock().by_sql.push((fragment.to_string(), ScriptedResult::new(rows)));
    }

    /// Commands executed so far, oldest first.
    pub fn executed(&self) -> Vec<RelationalCommand> {
        self.lock().executed.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(&self, command: &RelationalCommand) -> BufferedRows {
        tracing::debug!(sql = %command.sql, params = ?command.values(), "query");
        let mut script = self.lock();
        script.executed.push(command.clone());
        let matched = script
            .by_sql
            .iter()
            .find(|(fragment, _)| command.sql.contains(fragment.as_str()))
            .map(|(_, r)| r.clone());
        let result = matched.or_else(|| script.queued.pop_front()).unwrap_or(ScriptedResult {
            field_count: 0,
            rows: Vec::new(),
        });
        BufferedRows::new(result.field_count, result.rows)
    }
}

struct DelayedRows {
    rows: BufferedRows,
    delay: Duration,
}

#[async_trait]
impl AsyncRowCursor for DelayedRows {
    fn field_count(&self) -> usize {
        RowCursor::field_count(&self.rows)
    }

    async fn read_async(&mut self) -> Result<Option<ValueBuffer>> {
        tokio::time::sleep(self.delay).await;
        self.rows.read()
    }
}

#[async_trait]
impl CommandExecutor for InMemoryExecutor {
    fn execute_reader(&self, command: &RelationalCommand) -> Result<Box<dyn RowCursor>> {
        Ok(Box::new(self.run(command)))
    }

    async fn execute_reader_async(&self, command: &RelationalCommand) -> Result<Box<dyn AsyncRowCursor>> {
        let rows = self.run(command);
        Ok(match self.row_delay {
            Some(delay) => Box::new(DelayedRows { rows, delay }),
            None => Box::new(rows),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(sql: &str) -> RelationalCommand {
        RelationalCommand {
            sql: sql.into(),
            parameters: Vec::new(),
        }
    }

    #[test]
    fn fragments_take_precedence_over_the_queue() {
        let executor = InMemoryExecutor::new();
        executor.push_result(vec![vec![Value::Int(1)]]);
        executor.on_sql("COUNT(*)", vec![vec![Value::Int(7)]]);

        let mut counted = executor.execute_reader(&command("SELECT COUNT(*) FROM \"Blogs\"")).unwrap();
        assert_eq!(counted.read().unwrap().unwrap().into_values(), vec![Value::Int(7)]);

        let mut queued = executor.execute_reader(&command("SELECT \"b\".\"Id\" FROM \"Blogs\"")).unwrap();
        assert_eq!(queued.field_count(), 1);
        assert_eq!(queued.read().unwrap().unwrap().into_values(), vec![Value::Int(1)]);
        assert!(queued.read().unwrap().is_none());

        let empty = executor.execute_reader(&command("SELECT 1")).unwrap();
        assert_eq!(empty.field_count(), 0);
        assert_eq!(executor.executed().len(), 3);
    }

    #[tokio::test]
    async fn delayed_rows_are_read_in_order() {
        let executor = InMemoryExecutor::new().with_row_delay(Duration::from_millis(1));
        executor.push_result(vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        let mut cursor = executor.execute_reader_async(&command("SELECT 1")).await.unwrap();
        assert_eq!(cursor.read_async().await.unwrap().unwrap().into_values(), vec![Value::Int(1)]);
        assert_eq!(cursor.read_async().await.unwrap().unwrap().into_values(), vec![Value::Int(2)]);
        assert!(cursor.read_async().await.unwrap().is_none());
    }
}
