//! Remote data store interface

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DataError, DataResult};

/// Ordering applied to a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// Table read with equality filters, optional ordering and limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub table: String,

    /// Column equality constraints, all of which must match
    #[serde(default)]
    pub filters: Vec<(String, Value)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl QueryDescriptor {
    /// Start a query against `table`
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn order_asc(mut self, column: &str) -> Self {
        self.order_by = Some(OrderBy { column: column.to_string(), descending: false });
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order_by = Some(OrderBy { column: column.to_string(), descending: true });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> DataResult<()> {
        if self.table.trim().is_empty() {
            return Err(DataError::InvalidQuery("table name is empty".into()));
        }
        if self.filters.iter().any(|(column, _)| column.is_empty()) {
            return Err(DataError::InvalidQuery(format!(
                "empty filter column on '{}'",
                self.table
            )));
        }
        Ok(())
    }

    /// Stable textual form, usable as a cache or deduplication key
    pub fn cache_key(&self) -> String {
        let mut key = self.table.clone();
        for (column, value) in &self.filters {
            key.push_str(&format!("|{}={}", column, value));
        }
        if let Some(order) = &self.order_by {
            let dir = if order.descending { "desc" } else { "asc" };
            key.push_str(&format!("|order={}.{}", order.column, dir));
        }
        if let Some(limit) = self.limit {
            key.push_str(&format!("|limit={}", limit));
        }
        key
    }
}

/// Remote data store interface
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Backend name (for logging)
    fn name(&self) -> &str;

    /// Run a read; the result is a JSON array of rows
    async fn fetch(&self, query: &QueryDescriptor) -> DataResult<Value>;

    /// Upsert `rows` into `table`, merging on `conflict_key`. Returns rows written.
    async fn write(&self, table: &str, rows: Vec<Value>, conflict_key: &str) -> DataResult<usize>;
}

/// In-process store for tests and local development
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    fetch_calls: AtomicU64,
    write_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rows without going through `write`
    pub fn insert_rows(&self, table: &str, rows: Vec<Value>) {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Snapshot of a table's rows in storage order
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => {
            // RFC 3339 timestamps vary in fractional digits, so compare them as instants
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        _ => CmpOrdering::Equal,
    }
}

/// Merge `patch` object fields into `row`
fn merge_row(row: &mut Value, patch: Value) {
    match patch {
        Value::Object(fields) if row.is_object() => {
            if let Some(existing) = row.as_object_mut() {
                existing.extend(fields);
            }
        }
        other => *row = other,
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, query: &QueryDescriptor) -> DataResult<Value> {
        query.validate()?;
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.lock();
        let mut rows: Vec<Value> = tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        query
                            .filters
                            .iter()
                            .all(|(column, value)| row.get(column) == Some(value))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(tables);

        if let Some(order) = &query.order_by {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.descending { ord.reverse() } else { ord }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        Ok(Value::Array(rows))
    }

    async fn write(&self, table: &str, rows: Vec<Value>, conflict_key: &str) -> DataResult<usize> {
        if table.trim().is_empty() {
            return Err(DataError::Store {
                table: table.to_string(),
                reason: "table name is empty".into(),
            });
        }
        self.write_calls.fetch_add(1, Ordering::SeqCst);

        let mut tables = self.tables.lock();
        let existing = tables.entry(table.to_string()).or_default();
        let written = rows.len();

        for row in rows {
            let identity = row.get(conflict_key).cloned();
            let position = identity.as_ref().and_then(|id| {
                existing
                    .iter()
                    .position(|r| r.get(conflict_key) == Some(id))
            });

            match position {
                Some(index) => merge_row(&mut existing[index], row),
                None => existing.push(row),
            }
        }

        Ok(written)
    }
}
