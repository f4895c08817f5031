//! Backend-neutral connection interface.
//!
//! Handlers talk to every backing store through [`Connection`], passing
//! statement arguments as [`SqlValue`]s and reading results through a
//! [`RowCursor`]. The SQL dialect and schema are the caller's concern.

use std::sync::Arc;

use async_trait::async_trait;
use quill_core::{QuillResult, StorageError, Timestamp};

/// A statement argument or a column value.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(Timestamp),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::Int(_) => "int",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "bytes",
            SqlValue::Timestamp(_) => "timestamp",
        }
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value.into())
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        SqlValue::Int(value.into())
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        SqlValue::Bytes(value)
    }
}

impl From<Timestamp> for SqlValue {
    fn from(value: Timestamp) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Value of `column`, if the row has that column.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)
    }

    fn require(&self, column: &str) -> QuillResult<&SqlValue> {
        self.get(column).ok_or_else(|| {
            StorageError::RowDecode {
                column: column.to_string(),
                reason: "no such column".to_string(),
            }
            .into()
        })
    }

    fn mismatch(column: &str, expected: &str, found: &SqlValue) -> StorageError {
        StorageError::RowDecode {
            column: column.to_string(),
            reason: format!("expected {}, found {}", expected, found.type_name()),
        }
    }

    pub fn get_i64(&self, column: &str) -> QuillResult<i64> {
        match self.require(column)? {
            SqlValue::Int(v) => Ok(*v),
            other => Err(Self::mismatch(column, "int", other).into()),
        }
    }

    pub fn get_bool(&self, column: &str) -> QuillResult<bool> {
        match self.require(column)? {
            SqlValue::Bool(v) => Ok(*v),
            other => Err(Self::mismatch(column, "bool", other).into()),
        }
    }

    pub fn get_str(&self, column: &str) -> QuillResult<&str> {
        match self.require(column)? {
            SqlValue::Text(v) => Ok(v),
            other => Err(Self::mismatch(column, "text", other).into()),
        }
    }

    pub fn get_bytes(&self, column: &str) -> QuillResult<&[u8]> {
        match self.require(column)? {
            SqlValue::Bytes(v) => Ok(v),
            other => Err(Self::mismatch(column, "bytes", other).into()),
        }
    }

    pub fn get_timestamp(&self, column: &str) -> QuillResult<Timestamp> {
        match self.require(column)? {
            SqlValue::Timestamp(v) => Ok(*v),
            other => Err(Self::mismatch(column, "timestamp", other).into()),
        }
    }
}

/// Rows produced by [`Connection::query`], consumed in order.
#[derive(Debug)]
pub struct RowCursor {
    columns: Arc<[String]>,
    rows: std::vec::IntoIter<Vec<SqlValue>>,
}

impl RowCursor {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self {
            columns: columns.into(),
            rows: rows.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows not yet consumed.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    /// The next row, or `None` once the cursor is exhausted.
    pub fn next_row(&mut self) -> Option<Row> {
        self.next()
    }

    /// Consume the cursor, expecting at most one row.
    pub fn single(mut self) -> Option<Row> {
        self.next()
    }
}

impl Iterator for RowCursor {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        let values = self.rows.next()?;
        Some(Row::new(Arc::clone(&self.columns), values))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for RowCursor {}

/// A live connection to one backing store.
///
/// Errors that leave the connection unusable are reported as
/// [`StorageError::ConnectionBroken`]; any other error leaves it fit for
/// reuse.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a statement and return the number of rows it changed.
    async fn execute(&self, sql: &str, args: &[SqlValue]) -> QuillResult<u64>;

    /// Run a query and return its rows.
    async fn query(&self, sql: &str, args: &[SqlValue]) -> QuillResult<RowCursor>;

    /// Whether the connection is known to be unusable.
    fn is_broken(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        let mut cursor = RowCursor::new(
            vec!["id".to_string(), "title".to_string(), "draft".to_string()],
            vec![vec![SqlValue::Int(7), "Hello".into(), SqlValue::Null]],
        );
        cursor.next_row().unwrap()
    }

    #[test]
    fn test_typed_getters() {
        let row = row();
        assert_eq!(row.get_i64("id").unwrap(), 7);
        assert_eq!(row.get_str("title").unwrap(), "Hello");
        assert!(row.get("draft").unwrap().is_null());
    }

    #[test]
    fn test_getter_errors() {
        let row = row();
        let err = row.get_bool("title").unwrap_err();
        assert!(err.to_string().contains("expected bool, found text"));
        assert!(row.get_i64("missing").is_err());
    }

    #[test]
    fn test_cursor_iterates_in_order() {
        let cursor = RowCursor::new(
            vec!["n".to_string()],
            vec![vec![SqlValue::Int(1)], vec![SqlValue::Int(2)]],
        );
        assert_eq!(cursor.remaining(), 2);
        let values: Vec<i64> = cursor.map(|r| r.get_i64("n").unwrap()).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert_eq!(SqlValue::from(Some("x")), SqlValue::Text("x".to_string()));
    }
}
