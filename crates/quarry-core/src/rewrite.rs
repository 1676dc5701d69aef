//! Renders the SQL actually sent to a store node.
//!
//! The base query is never parsed; it is decorated by appending clauses or
//! wrapped as a subquery when a keyset cursor has to be applied.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{QuarryError, Result};
use crate::scale::ScalePolicy;
use crate::sort::SortField;
use crate::store::Row;

pub const CLUSTER_SETTINGS: &str =
    "SETTINGS prefer_localhost_replica = 1, distributed_aggregation_memory_efficient = 1";

/// Keep only `[A-Za-z0-9_.]`.
pub fn sanitize_column(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect()
}

fn column(name: &str) -> String {
    format!("`{}`", sanitize_column(name))
}

/// Render a cursor or filter value as a literal. Nulls and composite values
/// have no total order in the store and are refused.
pub fn literal(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(format!(
            "'{}'",
            s.replace('\\', "\\\\").replace('\'', "\\'")
        )),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn annotation(text: &str) -> String {
    format!("/* {} */", text.replace("*/", ""))
}

pub struct QueryRewriter;

impl QueryRewriter {
    pub fn order_clause(sort: &[SortField]) -> Option<String> {
        if sort.is_empty() {
            return None;
        }
        let keys = sort
            .iter()
            .map(|s| format!("{} {}", column(&s.field), s.direction.keyword()))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("ORDER BY {keys}"))
    }

    fn page_clause(limit: u64, offset: u64) -> String {
        if offset > 0 {
            format!("LIMIT {limit} OFFSET {offset}")
        } else {
            format!("LIMIT {limit}")
        }
    }

    fn hint_annotations(sort: &[SortField], hints: &BTreeMap<String, String>) -> Vec<String> {
        sort.iter()
            .filter_map(|s| {
                hints
                    .get(&s.field)
                    .map(|hint| annotation(&format!("index_hint: {hint}({})", s.field)))
            })
            .collect()
    }

    /// Append ordering, pagination and index hint annotations to `base`.
    pub fn rewrite(
        base: &str,
        sort: &[SortField],
        scale: &ScalePolicy,
        limit: u64,
        offset: u64,
    ) -> String {
        let mut parts = vec![base.trim_end().to_string()];
        parts.extend(Self::order_clause(sort));
        parts.push(Self::page_clause(limit, offset));
        parts.extend(Self::hint_annotations(sort, &scale.index_hints));
        parts.join(" ")
    }

    /// `SELECT count()` over the base query, used to size the result.
    pub fn count_query(base: &str) -> String {
        format!("SELECT count() AS total FROM ({}) AS _counted", base.trim_end())
    }

    /// Composite keyset condition selecting rows strictly after `last`:
    /// `(f1 > v1) OR (f1 = v1 AND f2 > v2) OR ...`, with `<` on descending keys.
    pub fn keyset_condition(sort: &[SortField], last: &Row) -> Result<String> {
        let mut values = Vec::with_capacity(sort.len());
        for s in sort {
            let value = last
                .get(&s.field)
                .and_then(literal)
                .ok_or_else(|| QuarryError::MissingCursorValue(s.field.clone()))?;
            values.push(value);
        }
        let branches = (0..sort.len())
            .map(|i| {
                let mut terms: Vec<String> = sort[..i]
                    .iter()
                    .zip(&values)
                    .map(|(s, v)| format!("{} = {v}", column(&s.field)))
                    .collect();
                terms.push(format!(
                    "{} {} {}",
                    column(&sort[i].field),
                    sort[i].direction.after_operator(),
                    values[i]
                ));
                format!("({})", terms.join(" AND "))
            })
            .collect::<Vec<_>>();
        Ok(branches.join(" OR "))
    }

    /// One page of a keyset scan. Without a cursor this is the first page and
    /// carries the caller's offset; later pages never use an offset.
    pub fn chunk_query(
        base: &str,
        sort: &[SortField],
        cursor: Option<&Row>,
        limit: u64,
        offset: u64,
    ) -> Result<String> {
        let mut parts = vec![format!("SELECT * FROM ({}) AS _chunk", base.trim_end())];
        if let Some(last) = cursor {
            if !sort.is_empty() {
                parts.push(format!("WHERE {}", Self::keyset_condition(sort, last)?));
            }
        }
        parts.extend(Self::order_clause(sort));
        let offset = if cursor.is_some() { 0 } else { offset };
        parts.push(Self::page_clause(limit, offset));
        Ok(parts.join(" "))
    }

    /// Decorate a query for a distributed table. Annotations are comments and
    /// do not change what the query returns.
    pub fn rewrite_for_cluster(
        base: &str,
        sort: &[SortField],
        where_conditions: &BTreeMap<String, Value>,
        partition_key: &str,
        hints: &BTreeMap<String, String>,
    ) -> String {
        let mut lines = vec![base.trim_end().to_string()];
        if let Some(value) = where_conditions.get(partition_key).and_then(literal) {
            lines.push(annotation(&format!(
                "partition_pruning: {} = {value}",
                sanitize_column(partition_key)
            )));
        }
        lines.extend(Self::hint_annotations(sort, hints));
        lines.push(CLUSTER_SETTINGS.to_string());
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_hints() -> ScalePolicy {
        ScalePolicy {
            index_hints: BTreeMap::new(),
            ..ScalePolicy::default()
        }
    }

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn rewrite_appends_order_limit_offset() {
        let sql = QueryRewriter::rewrite(
            "SELECT * FROM t",
            &[SortField::desc("created_at"), SortField::asc("name")],
            &no_hints(),
            100,
            50,
        );
        assert_eq!(
            sql,
            "SELECT * FROM t ORDER BY `created_at` DESC, `name` ASC LIMIT 100 OFFSET 50"
        );
    }

    #[test]
    fn rewrite_skips_zero_offset_and_appends_hints_last() {
        let sql = QueryRewriter::rewrite(
            "SELECT * FROM t",
            &[SortField::desc("created_at")],
            &ScalePolicy::default(),
            10,
            0,
        );
        assert_eq!(
            sql,
            "SELECT * FROM t ORDER BY `created_at` DESC LIMIT 10 /* index_hint: idx_created_at(created_at) */"
        );
    }

    #[test]
    fn columns_are_sanitized() {
        let clause = QueryRewriter::order_clause(&[SortField::asc("a`; DROP TABLE x--.b")]);
        assert_eq!(clause.as_deref(), Some("ORDER BY `aDROPTABLEx.b` ASC"));
    }

    #[test]
    fn rewrite_leaves_base_untouched() {
        let base = String::from("SELECT 1");
        let _ = QueryRewriter::rewrite(&base, &[], &no_hints(), 1, 0);
        assert_eq!(base, "SELECT 1");
    }

    #[test]
    fn keyset_condition_is_lexicographic() -> Result<()> {
        let last = row(json!({"a": 5, "b": "x'y", "c": true}));
        let cond = QueryRewriter::keyset_condition(
            &[
                SortField::asc("a"),
                SortField::desc("b"),
                SortField::asc("c"),
            ],
            &last,
        )?;
        assert_eq!(
            cond,
            "(`a` > 5) OR (`a` = 5 AND `b` < 'x\\'y') OR (`a` = 5 AND `b` = 'x\\'y' AND `c` > true)"
        );
        Ok(())
    }

    #[test]
    fn keyset_condition_requires_values() {
        let last = row(json!({"a": null}));
        let err = QueryRewriter::keyset_condition(&[SortField::asc("a")], &last).unwrap_err();
        assert!(matches!(err, QuarryError::MissingCursorValue(f) if f == "a"));
    }

    #[test]
    fn chunk_query_wraps_base() -> Result<()> {
        let sort = [SortField::asc("id")];
        let first = QueryRewriter::chunk_query("SELECT * FROM t", &sort, None, 10, 3)?;
        assert_eq!(
            first,
            "SELECT * FROM (SELECT * FROM t) AS _chunk ORDER BY `id` ASC LIMIT 10 OFFSET 3"
        );
        let last = row(json!({"id": 42}));
        let next = QueryRewriter::chunk_query("SELECT * FROM t", &sort, Some(&last), 10, 3)?;
        assert_eq!(
            next,
            "SELECT * FROM (SELECT * FROM t) AS _chunk WHERE (`id` > 42) ORDER BY `id` ASC LIMIT 10"
        );
        Ok(())
    }

    #[test]
    fn cluster_rewrite_annotates_pruning_and_hints() {
        let mut conditions = BTreeMap::new();
        conditions.insert("tenant_id".to_string(), json!("acme"));
        let mut hints = BTreeMap::new();
        hints.insert("created_at".to_string(), "idx_created_at".to_string());
        let sql = QueryRewriter::rewrite_for_cluster(
            "SELECT * FROM events",
            &[SortField::desc("created_at"), SortField::asc("value")],
            &conditions,
            "tenant_id",
            &hints,
        );
        assert_eq!(
            sql,
            "SELECT * FROM events\n\
             /* partition_pruning: tenant_id = 'acme' */\n\
             /* index_hint: idx_created_at(created_at) */\n\
             SETTINGS prefer_localhost_replica = 1, distributed_aggregation_memory_efficient = 1"
        );
    }

    #[test]
    fn cluster_rewrite_without_partition_equality() {
        let mut conditions = BTreeMap::new();
        conditions.insert("tenant_id".to_string(), json!(["a", "b"]));
        let sql = QueryRewriter::rewrite_for_cluster(
            "SELECT 1",
            &[],
            &conditions,
            "tenant_id",
            &BTreeMap::new(),
        );
        assert!(!sql.contains("partition_pruning"));
        assert!(sql.ends_with(CLUSTER_SETTINGS));
    }
}
