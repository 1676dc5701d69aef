use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{QuarryError, Result};
use crate::rewrite::sanitize_column;
use crate::store::{value_as_u64, QueryContext, Row, Store};

/// Indexes seen fewer times than this are considered unused.
const MIN_USEFUL_HITS: u64 = 10;
const MIN_SELECTIVITY: f64 = 0.01;
const HEAVY_USE_HITS: u64 = 10_000;
const REBUILD_SELECTIVITY: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexType {
    MinMax,
    BloomFilter,
    Set,
    NgramBloom,
    TokenBloom,
}

impl IndexType {
    pub fn ddl(self) -> &'static str {
        match self {
            IndexType::MinMax => "minmax",
            IndexType::BloomFilter => "bloom_filter(0.01)",
            IndexType::Set => "set(100)",
            IndexType::NgramBloom => "ngrambf_v1(3, 256, 2, 0)",
            IndexType::TokenBloom => "tokenbf_v1(256, 2, 0)",
        }
    }

    /// Parse a catalog type name, with or without parameters.
    pub fn from_catalog(raw: &str) -> Option<Self> {
        let name = raw.split('(').next().unwrap_or("").trim();
        match name.to_ascii_lowercase().as_str() {
            "minmax" => Some(IndexType::MinMax),
            "bloom_filter" => Some(IndexType::BloomFilter),
            "set" => Some(IndexType::Set),
            "ngrambf_v1" => Some(IndexType::NgramBloom),
            "tokenbf_v1" => Some(IndexType::TokenBloom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    Creating,
    Active,
    Failed,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub index_type: IndexType,
    pub granularity: u32,
    pub status: IndexStatus,
}

impl IndexDefinition {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
        index_type: IndexType,
        granularity: u32,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns,
            index_type,
            granularity: granularity.max(1),
            status: IndexStatus::Creating,
        }
    }

    /// Creating -> Active | Failed, Active -> Dropped. Nothing else.
    pub fn transition(&mut self, to: IndexStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (IndexStatus::Creating, IndexStatus::Active)
                | (IndexStatus::Creating, IndexStatus::Failed)
                | (IndexStatus::Active, IndexStatus::Dropped)
        );
        if !allowed {
            return Err(QuarryError::InvalidTransition {
                name: self.name.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    fn from_catalog_row(table: &str, row: &Row) -> Option<Self> {
        let name = row.get("name")?.as_str()?.to_string();
        let index_type = row
            .get("type")
            .and_then(Value::as_str)
            .and_then(IndexType::from_catalog)?;
        let columns = row
            .get("expr")
            .and_then(Value::as_str)
            .unwrap_or("")
            .split(',')
            .map(|c| c.trim().trim_matches('`').to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let granularity = row
            .get("granularity")
            .and_then(value_as_u64)
            .and_then(|g| u32::try_from(g).ok())
            .unwrap_or(1);
        Some(Self {
            name,
            table: table.to_string(),
            columns,
            index_type,
            granularity,
            status: IndexStatus::Active,
        })
    }
}

/// A recommended index for one of the known tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub index_type: IndexType,
    pub granularity: u32,
}

impl IndexSpec {
    pub fn definition(&self, table: &str) -> IndexDefinition {
        IndexDefinition::new(
            self.name,
            table,
            self.columns.iter().map(|c| c.to_string()).collect(),
            self.index_type,
            self.granularity,
        )
    }
}

pub const RECOMMENDED_INDEXES: &[(&str, &[IndexSpec])] = &[
    (
        "tenant_summaries",
        &[
            IndexSpec {
                name: "idx_tenant_id",
                columns: &["tenant_id"],
                index_type: IndexType::BloomFilter,
                granularity: 4,
            },
            IndexSpec {
                name: "idx_created_at",
                columns: &["created_at"],
                index_type: IndexType::MinMax,
                granularity: 4,
            },
        ],
    ),
    (
        "ingestion_records",
        &[
            IndexSpec {
                name: "idx_tenant_id",
                columns: &["tenant_id"],
                index_type: IndexType::BloomFilter,
                granularity: 4,
            },
            IndexSpec {
                name: "idx_source_id",
                columns: &["source_id"],
                index_type: IndexType::BloomFilter,
                granularity: 4,
            },
            IndexSpec {
                name: "idx_ingested_at",
                columns: &["ingested_at"],
                index_type: IndexType::MinMax,
                granularity: 4,
            },
            IndexSpec {
                name: "idx_file_name",
                columns: &["file_name"],
                index_type: IndexType::TokenBloom,
                granularity: 8,
            },
        ],
    ),
    (
        "analytics_events",
        &[
            IndexSpec {
                name: "idx_tenant_id",
                columns: &["tenant_id"],
                index_type: IndexType::BloomFilter,
                granularity: 4,
            },
            IndexSpec {
                name: "idx_event_time",
                columns: &["event_time"],
                index_type: IndexType::MinMax,
                granularity: 1,
            },
            IndexSpec {
                name: "idx_event_type",
                columns: &["event_type"],
                index_type: IndexType::Set,
                granularity: 4,
            },
        ],
    ),
];

pub fn recommended_for(table: &str) -> &'static [IndexSpec] {
    RECOMMENDED_INDEXES
        .iter()
        .find(|(t, _)| *t == table)
        .map(|(_, specs)| *specs)
        .unwrap_or(&[])
}

/// field -> index name for every single-column recommended index.
pub fn known_index_hints() -> BTreeMap<String, String> {
    RECOMMENDED_INDEXES
        .iter()
        .flat_map(|(_, specs)| specs.iter())
        .filter(|spec| spec.columns.len() == 1)
        .map(|spec| (spec.columns[0].to_string(), spec.name.to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexUsage {
    pub name: String,
    pub hits: u64,
    pub rows_read: u64,
    pub rows_skipped: u64,
}

impl IndexUsage {
    /// Fraction of read rows the index let the store skip.
    pub fn selectivity(&self) -> f64 {
        if self.rows_read == 0 {
            0.0
        } else {
            self.rows_skipped as f64 / self.rows_read as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Drop,
    Rebuild,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub index: String,
    pub action: SuggestedAction,
    pub reason: String,
}

/// Rule-based advice from usage counters.
pub fn suggest_optimizations(usage: &[IndexUsage]) -> Vec<Suggestion> {
    let mut out = Vec::new();
    for u in usage {
        let selectivity = u.selectivity();
        if u.hits < MIN_USEFUL_HITS {
            out.push(Suggestion {
                index: u.name.clone(),
                action: SuggestedAction::Drop,
                reason: format!("near-zero usage ({} hits)", u.hits),
            });
        } else if selectivity < MIN_SELECTIVITY {
            out.push(Suggestion {
                index: u.name.clone(),
                action: SuggestedAction::Drop,
                reason: format!("very low selectivity ({selectivity:.3})"),
            });
        } else if u.hits >= HEAVY_USE_HITS && selectivity < REBUILD_SELECTIVITY {
            out.push(Suggestion {
                index: u.name.clone(),
                action: SuggestedAction::Rebuild,
                reason: format!(
                    "heavily used ({} hits) with low selectivity ({selectivity:.3})",
                    u.hits
                ),
            });
        }
    }
    out
}

/// Table and index names are used verbatim as identifiers; anything the
/// renderer would have to strip is refused.
pub fn check_identifier(name: &str) -> Result<()> {
    if name.is_empty() || sanitize_column(name) != name {
        return Err(QuarryError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

fn ident(name: &str) -> String {
    format!("`{}`", sanitize_column(name))
}

fn catalog_literal(name: &str) -> String {
    format!("'{}'", sanitize_column(name))
}

/// Index administration against a single store node.
///
/// Definitions live in the store's own catalog; nothing is cached here.
#[derive(Clone)]
pub struct IndexManager {
    store: Arc<dyn Store>,
}

impl IndexManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    async fn run(
        &self,
        ctx: &QueryContext,
        op: &'static str,
        table: &str,
        sql: &str,
    ) -> Result<Vec<Row>> {
        ctx.run(self.store.as_ref(), sql)
            .await
            .map(|out| out.rows)
            .map_err(|e| QuarryError::store(op, table, e))
    }

    pub async fn create_index(
        &self,
        ctx: &QueryContext,
        mut def: IndexDefinition,
    ) -> Result<IndexDefinition> {
        check_identifier(&def.table)?;
        check_identifier(&def.name)?;
        for column in &def.columns {
            check_identifier(column)?;
        }
        if def.status != IndexStatus::Creating {
            return Err(QuarryError::InvalidTransition {
                name: def.name.clone(),
                from: def.status,
                to: IndexStatus::Active,
            });
        }
        let columns = def
            .columns
            .iter()
            .map(|c| ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let add = format!(
            "ALTER TABLE {} ADD INDEX IF NOT EXISTS {} ({columns}) TYPE {} GRANULARITY {}",
            ident(&def.table),
            ident(&def.name),
            def.index_type.ddl(),
            def.granularity
        );
        let materialize = format!(
            "ALTER TABLE {} MATERIALIZE INDEX {}",
            ident(&def.table),
            ident(&def.name)
        );
        info!(table = %def.table, index = %def.name, "creating index");
        let res = match self.run(ctx, "create_index", &def.table, &add).await {
            Ok(_) => self
                .run(ctx, "create_index", &def.table, &materialize)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        match res {
            Ok(()) => {
                def.transition(IndexStatus::Active)?;
                Ok(def)
            }
            Err(e) => {
                def.transition(IndexStatus::Failed)?;
                warn!(table = %def.table, index = %def.name, error = %e, "index creation failed");
                Err(e)
            }
        }
    }

    /// Drop an index by name. Returns the dropped definition, or `None` when
    /// the catalog did not list it.
    pub async fn drop_index(
        &self,
        ctx: &QueryContext,
        table: &str,
        name: &str,
    ) -> Result<Option<IndexDefinition>> {
        check_identifier(table)?;
        check_identifier(name)?;
        let current = self
            .list_indexes(ctx, table)
            .await?
            .into_iter()
            .find(|d| d.name == name);
        let sql = format!(
            "ALTER TABLE {} DROP INDEX IF EXISTS {}",
            ident(table),
            ident(name)
        );
        info!(table, index = name, "dropping index");
        self.run(ctx, "drop_index", table, &sql).await?;
        match current {
            Some(mut def) => {
                def.transition(IndexStatus::Dropped)?;
                Ok(Some(def))
            }
            None => Ok(None),
        }
    }

    pub async fn list_indexes(
        &self,
        ctx: &QueryContext,
        table: &str,
    ) -> Result<Vec<IndexDefinition>> {
        check_identifier(table)?;
        let sql = format!(
            "SELECT name, expr, type, granularity FROM system.data_skipping_indices \
             WHERE table = {} AND database = currentDatabase()",
            catalog_literal(table)
        );
        let rows = self.run(ctx, "list_indexes", table, &sql).await?;
        Ok(rows
            .iter()
            .filter_map(|r| IndexDefinition::from_catalog_row(table, r))
            .collect())
    }

    /// Create every definition whose name is not already in the catalog.
    /// All definitions must target the same table.
    pub async fn create_missing(
        &self,
        ctx: &QueryContext,
        table: &str,
        defs: Vec<IndexDefinition>,
    ) -> Result<Vec<IndexDefinition>> {
        let existing: HashSet<String> = self
            .list_indexes(ctx, table)
            .await?
            .into_iter()
            .map(|d| d.name)
            .collect();
        let mut created = Vec::new();
        for def in defs {
            if existing.contains(&def.name) {
                continue;
            }
            created.push(self.create_index(ctx, def).await?);
        }
        Ok(created)
    }

    pub async fn create_recommended_indexes(
        &self,
        ctx: &QueryContext,
        table: &str,
    ) -> Result<Vec<IndexDefinition>> {
        let defs = recommended_for(table)
            .iter()
            .map(|spec| spec.definition(table))
            .collect();
        self.create_missing(ctx, table, defs).await
    }

    pub async fn analyze_usage(
        &self,
        ctx: &QueryContext,
        table: &str,
    ) -> Result<Vec<IndexUsage>> {
        check_identifier(table)?;
        let sql = format!(
            "SELECT index_name, hits, rows_read, rows_skipped FROM system.index_usage \
             WHERE table = {} AND database = currentDatabase()",
            catalog_literal(table)
        );
        let rows = self.run(ctx, "analyze_usage", table, &sql).await?;
        Ok(rows
            .iter()
            .filter_map(|r| {
                let count = |k: &str| r.get(k).and_then(value_as_u64).unwrap_or(0);
                Some(IndexUsage {
                    name: r.get("index_name")?.as_str()?.to_string(),
                    hits: count("hits"),
                    rows_read: count("rows_read"),
                    rows_skipped: count("rows_skipped"),
                })
            })
            .collect())
    }

    pub async fn suggest_optimizations(
        &self,
        ctx: &QueryContext,
        table: &str,
    ) -> Result<Vec<Suggestion>> {
        Ok(suggest_optimizations(&self.analyze_usage(ctx, table).await?))
    }

    /// Drop or re-materialize indexes as suggested.
    pub async fn apply_suggestions(
        &self,
        ctx: &QueryContext,
        table: &str,
        suggestions: &[Suggestion],
    ) -> Result<()> {
        for s in suggestions {
            match s.action {
                SuggestedAction::Drop => {
                    self.drop_index(ctx, table, &s.index).await?;
                }
                SuggestedAction::Rebuild => {
                    let sql = format!(
                        "ALTER TABLE {} MATERIALIZE INDEX {}",
                        ident(table),
                        ident(&s.index)
                    );
                    info!(table, index = %s.index, "rebuilding index");
                    self.run(ctx, "rebuild_index", table, &sql).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn optimize_table(&self, ctx: &QueryContext, table: &str) -> Result<Vec<Suggestion>> {
        let suggestions = self.suggest_optimizations(ctx, table).await?;
        self.apply_suggestions(ctx, table, &suggestions).await?;
        Ok(suggestions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::testing::{row, ScriptedStore};
    use serde_json::json;

    fn manager(store: ScriptedStore) -> (Arc<ScriptedStore>, IndexManager) {
        let store = Arc::new(store);
        (store.clone(), IndexManager::new(store))
    }

    #[tokio::test]
    async fn create_then_list() -> Result<()> {
        let (store, mgr) = manager(ScriptedStore::new());
        let ctx = QueryContext::new();
        let def = IndexDefinition::new(
            "idx_pair",
            "events",
            vec!["tenant_id".into(), "source_id".into()],
            IndexType::BloomFilter,
            4,
        );
        let created = mgr.create_index(&ctx, def).await?;
        assert_eq!(created.status, IndexStatus::Active);

        let log = store.log();
        assert_eq!(
            log[0],
            "ALTER TABLE `events` ADD INDEX IF NOT EXISTS `idx_pair` (`tenant_id`, `source_id`) TYPE bloom_filter(0.01) GRANULARITY 4"
        );
        assert_eq!(log[1], "ALTER TABLE `events` MATERIALIZE INDEX `idx_pair`");

        let listed = mgr.list_indexes(&ctx, "events").await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].columns, vec!["tenant_id", "source_id"]);
        assert_eq!(listed[0].index_type, IndexType::BloomFilter);
        assert_eq!(listed[0].granularity, 4);
        Ok(())
    }

    #[tokio::test]
    async fn failed_creation_is_wrapped_with_operation_and_table() {
        let (_, mgr) = manager(
            ScriptedStore::new().fail_on("ADD INDEX", StoreError::Rejected("syntax".into())),
        );
        let def = IndexDefinition::new("i", "events", vec!["a".into()], IndexType::MinMax, 1);
        let err = mgr.create_index(&QueryContext::new(), def).await.unwrap_err();
        match err {
            QuarryError::Store { op, table, source } => {
                assert_eq!(op, "create_index");
                assert_eq!(table, "events");
                assert_eq!(source, StoreError::Rejected("syntax".into()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn names_that_need_sanitizing_are_refused() -> Result<()> {
        let (store, mgr) = manager(ScriptedStore::new());
        let ctx = QueryContext::new();
        let def = IndexDefinition::new("idx-a", "events", vec!["a".into()], IndexType::MinMax, 1);
        let err = mgr.create_index(&ctx, def).await.unwrap_err();
        assert!(matches!(err, QuarryError::InvalidIdentifier(ref n) if n == "idx-a"));
        assert!(err.is_client_error());

        let def = IndexDefinition::new(
            "idx_a",
            "events; --",
            vec!["a".into()],
            IndexType::MinMax,
            1,
        );
        assert!(mgr.create_index(&ctx, def).await.is_err());
        assert!(mgr.drop_index(&ctx, "events", "idx-a").await.is_err());
        assert!(store.log().is_empty());

        let def = IndexDefinition::new("idx_a", "events", vec!["a".into()], IndexType::MinMax, 1);
        let defs = vec![def.clone()];
        assert_eq!(mgr.create_missing(&ctx, "events", defs.clone()).await?.len(), 1);
        assert!(mgr.create_missing(&ctx, "events", defs).await?.is_empty());
        assert!(mgr.drop_index(&ctx, "events", "idx_a").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn recommended_indexes_are_idempotent() -> Result<()> {
        let (store, mgr) = manager(ScriptedStore::new());
        let ctx = QueryContext::new();
        let first = mgr.create_recommended_indexes(&ctx, "ingestion_records").await?;
        assert_eq!(first.len(), recommended_for("ingestion_records").len());
        let second = mgr.create_recommended_indexes(&ctx, "ingestion_records").await?;
        assert!(second.is_empty());
        let mut names = store.index_names("ingestion_records");
        names.sort();
        assert_eq!(
            names,
            vec!["idx_file_name", "idx_ingested_at", "idx_source_id", "idx_tenant_id"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn drop_marks_definition_dropped() -> Result<()> {
        let (store, mgr) = manager(ScriptedStore::new());
        let ctx = QueryContext::new();
        mgr.create_recommended_indexes(&ctx, "tenant_summaries").await?;
        let dropped = mgr.drop_index(&ctx, "tenant_summaries", "idx_tenant_id").await?;
        assert_eq!(dropped.map(|d| d.status), Some(IndexStatus::Dropped));
        assert_eq!(store.index_names("tenant_summaries"), vec!["idx_created_at"]);
        assert!(mgr.drop_index(&ctx, "tenant_summaries", "missing").await?.is_none());
        Ok(())
    }

    #[test]
    fn only_documented_transitions_are_allowed() {
        let mut def = IndexDefinition::new("i", "t", vec![], IndexType::Set, 1);
        assert!(def.transition(IndexStatus::Dropped).is_err());
        def.transition(IndexStatus::Active).unwrap();
        assert!(def.transition(IndexStatus::Failed).is_err());
        def.transition(IndexStatus::Dropped).unwrap();
        assert!(def.transition(IndexStatus::Active).is_err());
    }

    fn usage_of(name: &str, hits: u64, rows_read: u64, rows_skipped: u64) -> IndexUsage {
        IndexUsage {
            name: name.into(),
            hits,
            rows_read,
            rows_skipped,
        }
    }

    #[test]
    fn suggestions_follow_usage_rules() {
        let usage = vec![
            usage_of("idle", 2, 100, 90),
            usage_of("useless", 500, 10_000, 5),
            usage_of("hot", 50_000, 1_000, 100),
            usage_of("good", 50_000, 1_000, 900),
        ];
        let out = suggest_optimizations(&usage);
        let summary: Vec<_> = out.iter().map(|s| (s.index.as_str(), s.action)).collect();
        assert_eq!(
            summary,
            vec![
                ("idle", SuggestedAction::Drop),
                ("useless", SuggestedAction::Drop),
                ("hot", SuggestedAction::Rebuild),
            ]
        );
    }

    #[tokio::test]
    async fn optimize_applies_drop_and_rebuild() -> Result<()> {
        let usage = vec![
            row(json!({
                "index_name": "idx_tenant_id",
                "hits": "1", "rows_read": "10", "rows_skipped": "0"
            })),
            row(json!({
                "index_name": "idx_created_at",
                "hits": 20000, "rows_read": 100, "rows_skipped": 10
            })),
        ];
        let (store, mgr) = manager(ScriptedStore::new().usage(usage));
        let ctx = QueryContext::new();
        mgr.create_recommended_indexes(&ctx, "tenant_summaries").await?;
        let applied = mgr.optimize_table(&ctx, "tenant_summaries").await?;
        assert_eq!(applied.len(), 2);
        assert_eq!(store.index_names("tenant_summaries"), vec!["idx_created_at"]);
        assert!(store
            .log()
            .iter()
            .any(|q| q == "ALTER TABLE `tenant_summaries` MATERIALIZE INDEX `idx_created_at`"));
        Ok(())
    }

    #[test]
    fn catalog_types_round_trip_through_ddl() {
        for t in [
            IndexType::MinMax,
            IndexType::BloomFilter,
            IndexType::Set,
            IndexType::NgramBloom,
            IndexType::TokenBloom,
        ] {
            assert_eq!(IndexType::from_catalog(t.ddl()), Some(t));
        }
    }

    #[test]
    fn hints_cover_single_column_recommendations() {
        let hints = known_index_hints();
        assert_eq!(hints.get("created_at").map(String::as_str), Some("idx_created_at"));
        assert_eq!(hints.get("event_type").map(String::as_str), Some("idx_event_type"));
    }
}
