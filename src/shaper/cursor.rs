//! Forward-only row sources the shaper reads from.

use crate::error::{QueryError, Result};
use crate::value::Value;
use async_trait::async_trait;
use std::collections::VecDeque;

/// One result row: column values by ordinal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ValueBuffer(Vec<Value>);

impl ValueBuffer {
    pub fn new(values: Vec<Value>) -> Self {
        ValueBuffer(values)
    }

    pub fn field_count(&self) -> usize {
        self.0.len()
    }

    pub fn value(&self, ordinal: usize) -> Result<&Value> {
        self.0.get(ordinal).ok_or_else(|| {
            QueryError::InvalidOperation(format!(
                "column ordinal {} is out of range for a row with {} fields",
                ordinal,
                self.0.len()
            ))
        })
    }

    pub fn is_null(&self, ordinal: usize) -> bool {
        self.0.get(ordinal).map_or(true, Value::is_null)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for ValueBuffer {
    fn from(values: Vec<Value>) -> Self {
        ValueBuffer(values)
    }
}

pub trait RowCursor: Send {
    fn field_count(&self) -> usize;

    /// Advances to the next row; `None` once the result set is exhausted.
    fn read(&mut self) -> Result<Option<ValueBuffer>>;
}

#[async_trait]
pub trait AsyncRowCursor: Send {
    fn field_count(&self) -> usize;

    async fn read_async(&mut self) -> Result<Option<ValueBuffer>>;
}

/// A fully buffered result set.
#[derive(Clone, Debug, Default)]
pub struct BufferedRows {
    field_count: usize,
    rows: VecDeque<ValueBuffer>,
}

impl BufferedRows {
    pub fn new(field_count: usize, rows: Vec<Vec<Value>>) -> Self {
        BufferedRows {
            field_count,
            rows: rows.into_iter().map(ValueBuffer::new).collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl RowCursor for BufferedRows {
    fn field_count(&self) -> usize {
        self.field_count
    }

    fn read(&mut self) -> Result<Option<ValueBuffer>> {
        Ok(self.rows.pop_front())
    }
}

#[async_trait]
impl AsyncRowCursor for BufferedRows {
    fn field_count(&self) -> usize {
        self.field_count
    }

    async fn read_async(&mut self) -> Result<Option<ValueBuffer>> {
        tokio::task::yield_now().await;
        Ok(self.rows.pop_front())
    }
}

#[async_trait]
impl AsyncRowCursor for Box<dyn AsyncRowCursor> {
    fn field_count(&self) -> usize {
        (**self).field_count()
    }

    async fn read_async(&mut self) -> Result<Option<ValueBuffer>> {
        (**self).read_async().await
    }
}

impl RowCursor for Box<dyn RowCursor> {
    fn field_count(&self) -> usize {
        (**self).field_count()
    }

    fn read(&mut self) -> Result<Option<ValueBuffer>> {
        (**self).read()
    }
}
