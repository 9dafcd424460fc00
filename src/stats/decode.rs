//! Decoding of positional result rows into [`StatRow`] values.
//!
//! Values follow the JSON encoding of the REST `executeSql` API: INT64 as
//! decimal strings, FLOAT64 as numbers (or `"NaN"`/`"Infinity"` strings),
//! TIMESTAMP as RFC 3339 strings, BYTES as base64 strings, ARRAY as JSON
//! arrays and STRUCT as positional arrays.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use super::{LockRequest, LockStat, QueryStat, StatKind, StatRow, TransactionStat};

const QUERY_COLUMNS: &[&str] = &[
    "interval_end",
    "text",
    "text_truncated",
    "text_fingerprint",
    "execution_count",
    "avg_latency_seconds",
    "avg_rows",
    "avg_bytes",
    "avg_rows_scanned",
    "avg_cpu_seconds",
];

const TRANSACTION_COLUMNS: &[&str] = &[
    "interval_end",
    "fprint",
    "read_columns",
    "write_constructive_columns",
    "write_delete_tables",
    "commit_attempt_count",
    "commit_failed_precondition_count",
    "commit_abort_count",
    "avg_participants",
    "avg_total_latency_seconds",
    "avg_commit_latency_seconds",
    "avg_bytes",
];

const LOCK_COLUMNS: &[&str] = &[
    "interval_end",
    "row_range_start_key",
    "lock_wait_seconds",
    "sample_lock_requests",
];

/// Returns the columns selected for a kind, in select-list order.
pub fn columns(kind: StatKind) -> &'static [&'static str] {
    match kind {
        StatKind::Query => QUERY_COLUMNS,
        StatKind::Transaction => TRANSACTION_COLUMNS,
        StatKind::Lock => LOCK_COLUMNS,
    }
}

/// Errors that can occur while decoding a result row.
#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("result set is missing column {column}")]
    MissingColumn { column: &'static str },

    #[error("row has {len} values, column {column} is at position {index}")]
    RowTooShort {
        column: &'static str,
        index: usize,
        len: usize,
    },

    #[error("column {column}: expected {expected}, got {got}")]
    Type {
        column: &'static str,
        expected: &'static str,
        got: String,
    },

    #[error("column {column}: invalid timestamp {value:?}")]
    Timestamp { column: &'static str, value: String },

    #[error("column {column}: invalid base64 value")]
    Bytes { column: &'static str },
}

/// Column-name to position mapping for one result set.
#[derive(Debug, Clone, Default)]
pub struct ColumnIndex {
    positions: HashMap<String, usize>,
}

impl ColumnIndex {
    /// Builds an index from result set field names. Names are matched
    /// case-insensitively.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let positions = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name.as_ref().to_ascii_lowercase(), i))
            .collect();
        Self { positions }
    }

    /// Verifies every column needed by `kind` is present.
    pub fn require(&self, kind: StatKind) -> Result<(), DecodeError> {
        for column in columns(kind) {
            if !self.positions.contains_key(*column) {
                return Err(DecodeError::MissingColumn { column });
            }
        }
        Ok(())
    }

    fn value<'a>(&self, row: &'a [Value], column: &'static str) -> Result<&'a Value, DecodeError> {
        let index = *self
            .positions
            .get(column)
            .ok_or(DecodeError::MissingColumn { column })?;
        row.get(index).ok_or(DecodeError::RowTooShort {
            column,
            index,
            len: row.len(),
        })
    }
}

/// Decode one positional row into the variant for `kind`.
pub fn decode_row(
    kind: StatKind,
    index: &ColumnIndex,
    row: &[Value],
) -> Result<StatRow, DecodeError> {
    let r = RowReader { index, row };

    match kind {
        StatKind::Query => Ok(StatRow::Query(QueryStat {
            interval_end: r.timestamp("interval_end")?,
            text: r.string("text")?.trim().to_string(),
            text_truncated: r.bool("text_truncated")?,
            text_fingerprint: r.int64("text_fingerprint")?,
            execution_count: r.int64("execution_count")?,
            avg_latency_seconds: r.float64("avg_latency_seconds")?,
            avg_rows: r.float64("avg_rows")?,
            avg_bytes: r.float64("avg_bytes")?,
            avg_rows_scanned: r.float64("avg_rows_scanned")?,
            avg_cpu_seconds: r.float64("avg_cpu_seconds")?,
        })),
        StatKind::Transaction => Ok(StatRow::Transaction(TransactionStat {
            interval_end: r.timestamp("interval_end")?,
            fprint: r.int64("fprint")?,
            read_columns: r.strings("read_columns")?,
            write_constructive_columns: r.strings("write_constructive_columns")?,
            write_delete_tables: r.strings("write_delete_tables")?,
            commit_attempt_count: r.int64("commit_attempt_count")?,
            commit_failed_precondition_count: r.int64("commit_failed_precondition_count")?,
            commit_abort_count: r.int64("commit_abort_count")?,
            avg_participants: r.float64("avg_participants")?,
            avg_total_latency_seconds: r.float64("avg_total_latency_seconds")?,
            avg_commit_latency_seconds: r.float64("avg_commit_latency_seconds")?,
            avg_bytes: r.float64("avg_bytes")?,
        })),
        StatKind::Lock => Ok(StatRow::Lock(LockStat {
            interval_end: r.timestamp("interval_end")?,
            row_range_start_key: r.bytes("row_range_start_key")?,
            lock_wait_seconds: r.float64("lock_wait_seconds")?,
            sample_lock_requests: r.lock_requests("sample_lock_requests")?,
        })),
    }
}

struct RowReader<'a> {
    index: &'a ColumnIndex,
    row: &'a [Value],
}

impl RowReader<'_> {
    fn get(&self, column: &'static str) -> Result<&Value, DecodeError> {
        self.index.value(self.row, column)
    }

    fn string(&self, column: &'static str) -> Result<&str, DecodeError> {
        match self.get(column)? {
            Value::String(s) => Ok(s),
            other => Err(type_error(column, "string", other)),
        }
    }

    fn bool(&self, column: &'static str) -> Result<bool, DecodeError> {
        match self.get(column)? {
            Value::Bool(b) => Ok(*b),
            // Older views lack a truncation flag and report NULL.
            Value::Null => Ok(false),
            other => Err(type_error(column, "bool", other)),
        }
    }

    fn int64(&self, column: &'static str) -> Result<i64, DecodeError> {
        let value = self.get(column)?;
        match value {
            Value::String(s) => s.parse().map_err(|_| type_error(column, "int64", value)),
            Value::Number(n) => n.as_i64().ok_or_else(|| type_error(column, "int64", value)),
            other => Err(type_error(column, "int64", other)),
        }
    }

    fn float64(&self, column: &'static str) -> Result<f64, DecodeError> {
        let value = self.get(column)?;
        match value {
            Value::Number(n) => n.as_f64().ok_or_else(|| type_error(column, "float64", value)),
            Value::String(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                _ => s.parse().map_err(|_| type_error(column, "float64", value)),
            },
            other => Err(type_error(column, "float64", other)),
        }
    }

    fn timestamp(&self, column: &'static str) -> Result<DateTime<Utc>, DecodeError> {
        let raw = self.string(column)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| DecodeError::Timestamp {
                column,
                value: raw.to_string(),
            })
    }

    fn bytes(&self, column: &'static str) -> Result<Vec<u8>, DecodeError> {
        let raw = self.string(column)?;
        STANDARD
            .decode(raw)
            .map_err(|_| DecodeError::Bytes { column })
    }

    fn strings(&self, column: &'static str) -> Result<Vec<String>, DecodeError> {
        match self.get(column)? {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(type_error(column, "array<string>", other)),
                })
                .collect(),
            other => Err(type_error(column, "array<string>", other)),
        }
    }

    fn lock_requests(&self, column: &'static str) -> Result<Vec<LockRequest>, DecodeError> {
        let items = match self.get(column)? {
            Value::Null => return Ok(Vec::new()),
            Value::Array(items) => items,
            other => return Err(type_error(column, "array<struct>", other)),
        };

        items
            .iter()
            .map(|item| {
                let (mode, col) = match item {
                    Value::Array(fields) => (fields.first(), fields.get(1)),
                    Value::Object(fields) => (fields.get("lock_mode"), fields.get("column")),
                    other => return Err(type_error(column, "struct<lock_mode, column>", other)),
                };
                match (mode, col) {
                    (Some(Value::String(lock_mode)), Some(Value::String(c))) => Ok(LockRequest {
                        lock_mode: lock_mode.clone(),
                        column: c.clone(),
                    }),
                    _ => Err(type_error(column, "struct<lock_mode, column>", item)),
                }
            })
            .collect()
    }
}

fn type_error(column: &'static str, expected: &'static str, got: &Value) -> DecodeError {
    let got = match got {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    };
    DecodeError::Type {
        column,
        expected,
        got: got.to_string(),
    }
}
