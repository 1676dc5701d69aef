//! In-memory store that understands the SQL shapes this crate emits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::StoreError;
use crate::store::{QueryOutput, Row, Store};

pub(crate) fn row(v: Value) -> Row {
    v.as_object().cloned().unwrap_or_default()
}

#[derive(Default)]
pub(crate) struct ScriptedStore {
    /// Dataset served for page queries, ordered by the numeric `id` column.
    rows: Vec<Row>,
    count: Option<Result<u64, StoreError>>,
    fail_on: Option<(String, StoreError)>,
    usage: Vec<Row>,
    topology: Vec<Row>,
    indexes: Mutex<BTreeMap<String, Vec<Row>>>,
    log: Mutex<Vec<String>>,
}

fn number_after(sql: &str, marker: &str) -> Option<u64> {
    let start = sql.find(marker)? + marker.len();
    let digits: String = sql[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn quoted_after(sql: &str, marker: &str) -> Option<String> {
    let start = sql.find(marker)? + marker.len();
    let rest = &sql[start..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

fn backticked(sql: &str, nth: usize) -> Option<String> {
    sql.split('`').nth(nth * 2 + 1).map(str::to_string)
}

impl ScriptedStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_ids(n: u64) -> Self {
        let rows = (1..=n).map(|id| row(json!({"id": id, "name": format!("row-{id}")})));
        Self {
            rows: rows.collect(),
            ..Self::default()
        }
    }

    pub(crate) fn count(mut self, count: Result<u64, StoreError>) -> Self {
        self.count = Some(count);
        self
    }

    pub(crate) fn fail_on(mut self, fragment: &str, err: StoreError) -> Self {
        self.fail_on = Some((fragment.to_string(), err));
        self
    }

    pub(crate) fn usage(mut self, usage: Vec<Row>) -> Self {
        self.usage = usage;
        self
    }

    pub(crate) fn topology(mut self, topology: Vec<Row>) -> Self {
        self.topology = topology;
        self
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub(crate) fn index_names(&self, table: &str) -> Vec<String> {
        self.indexes
            .lock()
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter_map(|r| r.get("name").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn alter(&self, sql: &str) -> QueryOutput {
        let Some(table) = backticked(sql, 0) else {
            return QueryOutput::default();
        };
        let name = backticked(sql, 1).unwrap_or_default();
        let mut indexes = self.indexes.lock();
        let entry = indexes.entry(table).or_default();
        if sql.contains("ADD INDEX") {
            if !entry.iter().any(|r| r.get("name") == Some(&json!(name))) {
                let expr = sql
                    .split_once('(')
                    .and_then(|(_, rest)| rest.split_once(')'))
                    .map(|(cols, _)| cols.replace('`', ""))
                    .unwrap_or_default();
                let kind = sql
                    .split_once(" TYPE ")
                    .map(|(_, rest)| rest.split(['(', ' ']).next().unwrap_or("").to_string())
                    .unwrap_or_default();
                let granularity = number_after(sql, "GRANULARITY ").unwrap_or(1);
                entry.push(row(json!({
                    "name": name,
                    "expr": expr,
                    "type": kind,
                    "granularity": granularity.to_string(),
                })));
            }
        } else if sql.contains("DROP INDEX") {
            entry.retain(|r| r.get("name") != Some(&json!(name)));
        }
        QueryOutput::default()
    }

    fn page(&self, sql: &str) -> QueryOutput {
        let after = number_after(sql, "`id` > ").unwrap_or(0);
        let limit = number_after(sql, "LIMIT ").unwrap_or(u64::MAX) as usize;
        let offset = number_after(sql, "OFFSET ").unwrap_or(0) as usize;
        let rows = self
            .rows
            .iter()
            .filter(|r| r.get("id").and_then(Value::as_u64).unwrap_or(0) > after)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        QueryOutput::from_rows(rows)
    }
}

#[async_trait]
impl Store for ScriptedStore {
    async fn query(&self, sql: &str) -> Result<QueryOutput, StoreError> {
        self.log.lock().push(sql.to_string());
        if let Some((fragment, err)) = &self.fail_on {
            if sql.contains(fragment.as_str()) {
                return Err(err.clone());
            }
        }
        if sql.contains("count()") {
            let total = match &self.count {
                Some(res) => res.clone()?,
                None => self.rows.len() as u64,
            };
            return Ok(QueryOutput::from_rows(vec![row(json!({"total": total.to_string()}))]));
        }
        if sql.starts_with("ALTER TABLE") {
            return Ok(self.alter(sql));
        }
        if sql.contains("system.data_skipping_indices") {
            let table = quoted_after(sql, "table = '").unwrap_or_default();
            let rows = self.indexes.lock().get(&table).cloned().unwrap_or_default();
            return Ok(QueryOutput::from_rows(rows));
        }
        if sql.contains("system.index_usage") {
            return Ok(QueryOutput::from_rows(self.usage.clone()));
        }
        if sql.contains("system.clusters") {
            return Ok(QueryOutput::from_rows(self.topology.clone()));
        }
        if sql.starts_with("SELECT") {
            return Ok(self.page(sql));
        }
        Ok(QueryOutput::default())
    }
}
