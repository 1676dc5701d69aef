//! Cluster-wide index administration.
//!
//! Every administrative command is broadcast to all nodes concurrently and
//! joined before returning. Outcomes are collected per node ordinal; when any
//! node fails the caller gets a [`QuarryError::ClusterPartialFailure`] naming
//! every failed node. Changes already applied on the other nodes are left in
//! place, there is no rollback.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{NodeFailure, QuarryError, Result};
use crate::index::{
    check_identifier, known_index_hints, recommended_for, IndexDefinition, IndexManager,
    IndexUsage, Suggestion,
};
use crate::rewrite::{sanitize_column, QueryRewriter};
use crate::sort::SortField;
use crate::store::{value_as_u64, QueryContext, Store};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub shard: u32,
    pub replica: u32,
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStrategy {
    /// Indexes on each shard's local table, read through a distributed view.
    #[default]
    Local,
    /// Indexes on the named table itself on every node; no distributed view.
    Global,
    Partitioned,
}

impl IndexStrategy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Some(IndexStrategy::Local),
            "global" => Some(IndexStrategy::Global),
            "partitioned" => Some(IndexStrategy::Partitioned),
            _ => None,
        }
    }

    fn uses_local_tables(self) -> bool {
        !matches!(self, IndexStrategy::Global)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub replication_factor: u32,
    pub partition_key: String,
    pub sharding_key: String,
    pub strategy: IndexStrategy,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            replication_factor: 1,
            partition_key: "tenant_id".into(),
            sharding_key: "tenant_id".into(),
            strategy: IndexStrategy::Local,
        }
    }
}

/// Partition key and index hints used to annotate queries for the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHints {
    pub partition_key: String,
    pub index_hints: BTreeMap<String, String>,
}

impl ClusterHints {
    pub fn decorate(
        &self,
        sql: &str,
        sort: &[SortField],
        where_conditions: &BTreeMap<String, Value>,
    ) -> String {
        QueryRewriter::rewrite_for_cluster(
            sql,
            sort,
            where_conditions,
            &self.partition_key,
            &self.index_hints,
        )
    }
}

struct ClusterNode {
    descriptor: NodeDescriptor,
    manager: IndexManager,
}

pub struct ClusterCoordinator {
    config: ClusterConfig,
    nodes: Vec<ClusterNode>,
    hints: ClusterHints,
    /// Writers are administrative commands; readers are introspection.
    admin: RwLock<()>,
}

impl ClusterCoordinator {
    /// The node list is fixed for the lifetime of the coordinator.
    pub fn new(config: ClusterConfig, nodes: Vec<(NodeDescriptor, Arc<dyn Store>)>) -> Self {
        let hints = ClusterHints {
            partition_key: config.partition_key.clone(),
            index_hints: known_index_hints(),
        };
        let nodes = nodes
            .into_iter()
            .map(|(descriptor, store)| ClusterNode {
                descriptor,
                manager: IndexManager::new(store),
            })
            .collect();
        Self {
            config,
            nodes,
            hints,
            admin: RwLock::new(()),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn hints(&self) -> &ClusterHints {
        &self.hints
    }

    pub fn descriptors(&self) -> Vec<NodeDescriptor> {
        self.nodes.iter().map(|n| n.descriptor.clone()).collect()
    }

    /// Store of the node that coordinates reads and view creation.
    pub fn coordinator_store(&self) -> Option<Arc<dyn Store>> {
        self.nodes.first().map(|n| n.manager.store().clone())
    }

    pub fn node_manager(&self, ordinal: usize) -> Option<&IndexManager> {
        self.nodes.get(ordinal).map(|n| &n.manager)
    }

    fn physical_table(&self, table: &str) -> String {
        if self.config.strategy.uses_local_tables() {
            format!("{table}_local")
        } else {
            table.to_string()
        }
    }

    fn node_index_name(name: &str, ordinal: usize) -> String {
        format!("{name}_{ordinal}")
    }

    async fn fan_out<'a, T, F, Fut>(&'a self, op: &'static str, f: F) -> Result<Vec<T>>
    where
        F: Fn(usize, &'a ClusterNode) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcomes = join_all(self.nodes.iter().enumerate().map(|(i, node)| f(i, node))).await;
        let total = outcomes.len();
        let mut values = Vec::with_capacity(total);
        let mut failed = Vec::new();
        for (ordinal, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(v) => values.push(v),
                Err(e) => {
                    let node = &self.nodes[ordinal].descriptor;
                    warn!(op, ordinal, host = %node.host, error = %e, "node operation failed");
                    failed.push(NodeFailure {
                        ordinal,
                        host: node.host.clone(),
                        port: node.port,
                        error: e.to_string(),
                    });
                }
            }
        }
        if failed.is_empty() {
            Ok(values)
        } else {
            Err(QuarryError::ClusterPartialFailure { failed, total })
        }
    }

    /// Create the same logical index on every node, then the distributed view.
    pub async fn create_index(
        &self,
        ctx: &QueryContext,
        def: IndexDefinition,
    ) -> Result<Vec<IndexDefinition>> {
        check_identifier(&def.table)?;
        check_identifier(&def.name)?;
        let _guard = self.admin.write().await;
        let table = def.table.clone();
        let local = self.physical_table(&table);
        info!(
            cluster = %self.config.name,
            table = %table,
            index = %def.name,
            "creating index on all nodes"
        );
        let created = self
            .fan_out("create_index", |i, node| {
                let node_def = IndexDefinition {
                    name: Self::node_index_name(&def.name, i),
                    table: local.clone(),
                    ..def.clone()
                };
                async move { node.manager.create_index(ctx, node_def).await }
            })
            .await?;
        self.ensure_distributed_table_locked(ctx, &table).await?;
        Ok(created)
    }

    pub async fn drop_index(
        &self,
        ctx: &QueryContext,
        table: &str,
        name: &str,
    ) -> Result<Vec<Option<IndexDefinition>>> {
        check_identifier(table)?;
        check_identifier(name)?;
        let _guard = self.admin.write().await;
        let local = self.physical_table(table);
        info!(cluster = %self.config.name, table, index = name, "dropping index on all nodes");
        self.fan_out("drop_index", |i, node| {
            let local = local.clone();
            let node_name = Self::node_index_name(name, i);
            async move { node.manager.drop_index(ctx, &local, &node_name).await }
        })
        .await
    }

    pub async fn list_indexes(
        &self,
        ctx: &QueryContext,
        table: &str,
    ) -> Result<Vec<Vec<IndexDefinition>>> {
        check_identifier(table)?;
        let _guard = self.admin.read().await;
        let local = self.physical_table(table);
        self.fan_out("list_indexes", |_, node| {
            let local = local.clone();
            async move { node.manager.list_indexes(ctx, &local).await }
        })
        .await
    }

    pub async fn create_recommended_indexes(
        &self,
        ctx: &QueryContext,
        table: &str,
    ) -> Result<Vec<Vec<IndexDefinition>>> {
        check_identifier(table)?;
        let _guard = self.admin.write().await;
        let local = self.physical_table(table);
        let specs = recommended_for(table);
        let created = self
            .fan_out("create_recommended_indexes", |i, node| {
                let local = local.clone();
                let defs = specs
                    .iter()
                    .map(|spec| {
                        let mut def = spec.definition(&local);
                        def.name = Self::node_index_name(spec.name, i);
                        def
                    })
                    .collect();
                async move { node.manager.create_missing(ctx, &local, defs).await }
            })
            .await?;
        self.ensure_distributed_table_locked(ctx, table).await?;
        Ok(created)
    }

    pub async fn analyze_usage(
        &self,
        ctx: &QueryContext,
        table: &str,
    ) -> Result<Vec<Vec<IndexUsage>>> {
        check_identifier(table)?;
        let _guard = self.admin.read().await;
        let local = self.physical_table(table);
        self.fan_out("analyze_usage", |_, node| {
            let local = local.clone();
            async move { node.manager.analyze_usage(ctx, &local).await }
        })
        .await
    }

    pub async fn suggest_optimizations(
        &self,
        ctx: &QueryContext,
        table: &str,
    ) -> Result<Vec<Vec<Suggestion>>> {
        check_identifier(table)?;
        let _guard = self.admin.read().await;
        let local = self.physical_table(table);
        self.fan_out("suggest_optimizations", |_, node| {
            let local = local.clone();
            async move { node.manager.suggest_optimizations(ctx, &local).await }
        })
        .await
    }

    /// Apply usage-based suggestions on every node.
    pub async fn optimize_indexes(
        &self,
        ctx: &QueryContext,
        table: &str,
    ) -> Result<Vec<Vec<Suggestion>>> {
        check_identifier(table)?;
        let _guard = self.admin.write().await;
        let local = self.physical_table(table);
        info!(cluster = %self.config.name, table, "optimizing indexes on all nodes");
        self.fan_out("optimize_indexes", |_, node| {
            let local = local.clone();
            async move { node.manager.optimize_table(ctx, &local).await }
        })
        .await
    }

    pub async fn ensure_distributed_table(&self, ctx: &QueryContext, table: &str) -> Result<()> {
        check_identifier(table)?;
        let _guard = self.admin.write().await;
        self.ensure_distributed_table_locked(ctx, table).await
    }

    async fn ensure_distributed_table_locked(&self, ctx: &QueryContext, table: &str) -> Result<()> {
        if !self.config.strategy.uses_local_tables() {
            return Ok(());
        }
        let Some(node) = self.nodes.first() else {
            return Ok(());
        };
        let db = sanitize_column(&node.descriptor.database);
        let local = sanitize_column(&self.physical_table(table));
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS `{db}`.`{table}_distributed` AS `{db}`.`{local}` \
             ENGINE = Distributed('{cluster}', '{db}', '{local}', rand())",
            table = sanitize_column(table),
            cluster = sanitize_column(&self.config.name),
        );
        ctx.run(node.manager.store().as_ref(), &sql)
            .await
            .map(|_| ())
            .map_err(|e| QuarryError::store("create_distributed_table", table, e))
    }

    /// Live member list as reported by the coordinating node.
    pub async fn get_topology(&self, ctx: &QueryContext) -> Result<Vec<NodeDescriptor>> {
        let _guard = self.admin.read().await;
        let Some(node) = self.nodes.first() else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT host_name, port, shard_num, replica_num, shard_weight FROM system.clusters \
             WHERE cluster = '{}'",
            sanitize_column(&self.config.name)
        );
        let rows = ctx
            .run(node.manager.store().as_ref(), &sql)
            .await
            .map_err(|e| QuarryError::store("get_topology", "system.clusters", e))?
            .rows;
        let num = |r: &serde_json::Map<String, Value>, k: &str| {
            r.get(k).and_then(value_as_u64).unwrap_or(0)
        };
        Ok(rows
            .iter()
            .filter_map(|r| {
                Some(NodeDescriptor {
                    host: r.get("host_name")?.as_str()?.to_string(),
                    port: u16::try_from(num(r, "port")).ok()?,
                    database: node.descriptor.database.clone(),
                    shard: u32::try_from(num(r, "shard_num")).unwrap_or(0),
                    replica: u32::try_from(num(r, "replica_num")).unwrap_or(0),
                    weight: u32::try_from(num(r, "shard_weight")).unwrap_or(1),
                })
            })
            .collect())
    }

    pub async fn optimize_for_cluster(
        &self,
        base: &str,
        sort: &[SortField],
        where_conditions: &BTreeMap<String, Value>,
    ) -> String {
        let _guard = self.admin.read().await;
        self.hints.decorate(base, sort, where_conditions)
    }
}
