use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterHints;
use crate::error::{QuarryError, Result};
use crate::rewrite::QueryRewriter;
use crate::scale::{ComplexityReport, ScaleAdvisor, ScalePlan, ScalePolicy};
use crate::sort::{QueryKind, SortField, SortPolicies};
use crate::store::{value_as_u64, QueryContext, Row, Store};

const STREAM_BUFFER_CHUNKS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub source_id: Option<String>,
    pub query: String,
    pub query_type: QueryKind,
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    /// Carried for the transport contract; the base query already encodes it.
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub sort_by: Vec<SortField>,
    /// Resume after the last row of a previous response.
    #[serde(default)]
    pub next_token: Option<String>,
}

impl QueryRequest {
    pub fn new(tenant_id: impl Into<String>, query: impl Into<String>, kind: QueryKind) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            source_id: None,
            query: query.into(),
            query_type: kind,
            filters: BTreeMap::new(),
            time_range: None,
            limit: None,
            offset: None,
            sort_by: Vec::new(),
            next_token: None,
        }
    }

    /// Equality conditions known for this request, used for partition pruning.
    pub fn where_conditions(&self) -> BTreeMap<String, Value> {
        let mut conditions = self.filters.clone();
        conditions
            .entry("tenant_id".to_string())
            .or_insert_with(|| Value::String(self.tenant_id.clone()));
        if let Some(source) = &self.source_id {
            conditions
                .entry("source_id".to_string())
                .or_insert_with(|| Value::String(source.clone()));
        }
        conditions
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub data: Vec<Row>,
    pub row_count: u64,
    pub execution_ms: u64,
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    /// Set when streaming stopped at the chunk bound before the result was exhausted.
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Rows(Vec<Row>),
    End {
        row_count: u64,
        truncated: bool,
        next_token: Option<String>,
    },
}

pub struct QueryStream {
    pub query_id: String,
    pub streaming: bool,
    pub items: mpsc::Receiver<Result<StreamItem>>,
}

fn encode_token(sort: &[SortField], last: &Row) -> Result<Option<String>> {
    if sort.is_empty() {
        return Ok(None);
    }
    let mut key = Row::new();
    for s in sort {
        let value = last
            .get(&s.field)
            .cloned()
            .ok_or_else(|| QuarryError::MissingCursorValue(s.field.clone()))?;
        key.insert(s.field.clone(), value);
    }
    Ok(Some(serde_json::to_string(&key)?))
}

fn decode_token(token: &str) -> Result<Row> {
    serde_json::from_str(token).map_err(|e| QuarryError::InvalidToken(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageMode {
    Single,
    Keyset,
}

/// Drives either the single rewritten query or the keyset chunk loop.
///
/// Chunks are strictly sequential: each cursor is the last row of the
/// previous chunk.
struct ChunkPager {
    store: Arc<dyn Store>,
    kind: QueryKind,
    mode: PageMode,
    base: String,
    sort: Vec<SortField>,
    scale: ScalePolicy,
    limit: u64,
    offset: u64,
    cursor: Option<Row>,
    cluster: Option<(ClusterHints, BTreeMap<String, Value>)>,
    emitted: u64,
    chunks: usize,
    done: bool,
    truncated: bool,
}

impl ChunkPager {
    fn finish_sql(&self, sql: String) -> String {
        match &self.cluster {
            Some((hints, conditions)) => hints.decorate(&sql, &self.sort, conditions),
            None => sql,
        }
    }

    fn next_sql(&self) -> Result<String> {
        let remaining = self.limit - self.emitted;
        match self.mode {
            PageMode::Single => {
                let sql = match &self.cursor {
                    Some(cursor) => QueryRewriter::chunk_query(
                        &self.base,
                        &self.sort,
                        Some(cursor),
                        remaining,
                        0,
                    )?,
                    None => QueryRewriter::rewrite(
                        &self.base,
                        &self.sort,
                        &self.scale,
                        remaining,
                        self.offset,
                    ),
                };
                Ok(sql)
            }
            PageMode::Keyset => {
                let size = remaining.min(self.scale.chunk_size.max(1) as u64);
                if self.sort.is_empty() {
                    QueryRewriter::chunk_query(
                        &self.base,
                        &[],
                        None,
                        size,
                        self.offset + self.emitted,
                    )
                } else {
                    QueryRewriter::chunk_query(
                        &self.base,
                        &self.sort,
                        self.cursor.as_ref(),
                        size,
                        self.offset,
                    )
                }
            }
        }
    }

    async fn next_chunk(&mut self, ctx: &QueryContext) -> Result<Option<Vec<Row>>> {
        if self.done || self.emitted >= self.limit {
            self.done = true;
            return Ok(None);
        }
        if self.mode == PageMode::Keyset && self.chunks >= self.scale.max_chunks {
            warn!(
                kind = self.kind.as_str(),
                chunks = self.chunks,
                rows = self.emitted,
                "streaming stopped at chunk bound; result truncated"
            );
            self.truncated = true;
            self.done = true;
            return Ok(None);
        }
        let sql = self.finish_sql(self.next_sql()?);
        debug!(kind = self.kind.as_str(), chunk = self.chunks, %sql, "executing");
        let out = ctx
            .run(self.store.as_ref(), &sql)
            .await
            .map_err(|e| QuarryError::store("execute", self.kind.as_str(), e))?;
        self.chunks += 1;
        if self.mode == PageMode::Single {
            self.done = true;
        }
        let mut rows = out.rows;
        if rows.is_empty() {
            self.done = true;
            return Ok(None);
        }
        let remaining = (self.limit - self.emitted) as usize;
        rows.truncate(remaining);
        self.emitted += rows.len() as u64;
        self.cursor = rows.last().cloned();
        Ok(Some(rows))
    }

    /// Token for the next page when the limit or the chunk bound cut the result short.
    fn next_token(&self) -> Result<Option<String>> {
        if !self.truncated && self.emitted < self.limit {
            return Ok(None);
        }
        match &self.cursor {
            Some(last) => encode_token(&self.sort, last),
            None => Ok(None),
        }
    }
}

struct Prepared {
    query_id: String,
    plan: ScalePlan,
    pager: ChunkPager,
}

pub struct QueryExecutor {
    store: Arc<dyn Store>,
    policies: SortPolicies,
    scale: ScalePolicy,
    cluster: Option<ClusterHints>,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn Store>, scale: ScalePolicy) -> Self {
        Self {
            store,
            policies: SortPolicies::builtin(),
            scale,
            cluster: None,
        }
    }

    pub fn with_policies(mut self, policies: SortPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Annotate every data query for a distributed table.
    pub fn with_cluster_hints(mut self, hints: ClusterHints) -> Self {
        self.cluster = Some(hints);
        self
    }

    pub fn scale(&self) -> &ScalePolicy {
        &self.scale
    }

    /// Fresh request context carrying the configured per-call timeout.
    pub fn context(&self) -> QueryContext {
        QueryContext::with_timeout_secs(self.scale.query_timeout_seconds)
    }

    /// Row count of the base query. A failed count is treated as a large result.
    pub async fn estimate_rows(&self, base: &str, ctx: &QueryContext) -> u64 {
        let count = QueryRewriter::count_query(base);
        match ctx.run(self.store.as_ref(), &count).await {
            Ok(out) => out
                .rows
                .first()
                .and_then(|r| r.get("total").or_else(|| r.values().next()))
                .and_then(value_as_u64)
                .unwrap_or_else(|| {
                    warn!("size count returned nothing; assuming large result");
                    self.scale.large_estimate()
                }),
            Err(e) => {
                warn!(error = %e, "size count failed; assuming large result");
                self.scale.large_estimate()
            }
        }
    }

    async fn prepare(&self, request: &QueryRequest, ctx: &QueryContext) -> Result<Prepared> {
        let policy = self.policies.for_kind(request.query_type);
        let sort = policy.validate(&request.sort_by)?;
        let cursor = request.next_token.as_deref().map(decode_token).transpose()?;
        if cursor.is_some() && sort.is_empty() {
            return Err(QuarryError::InvalidToken(
                "page token given without a sort order".into(),
            ));
        }
        let estimated = self.estimate_rows(&request.query, ctx).await;
        let plan = ScaleAdvisor::plan(&sort, policy, &self.scale, estimated)?;

        let query_id = Uuid::new_v4().to_string();
        info!(
            query_id = %query_id,
            tenant = %request.tenant_id,
            kind = request.query_type.as_str(),
            estimated,
            streaming = plan.streaming(),
            "query planned"
        );

        let limit = request
            .limit
            .unwrap_or(policy.max_result_size)
            .min(policy.max_result_size);
        let pager = ChunkPager {
            store: self.store.clone(),
            kind: request.query_type,
            mode: if plan.streaming() {
                PageMode::Keyset
            } else {
                PageMode::Single
            },
            base: request.query.clone(),
            sort: plan.sort.clone(),
            scale: plan.scale.clone(),
            limit,
            offset: request.offset.unwrap_or(0),
            cursor,
            cluster: self
                .cluster
                .clone()
                .map(|hints| (hints, request.where_conditions())),
            emitted: 0,
            chunks: 0,
            done: false,
            truncated: false,
        };
        Ok(Prepared {
            query_id,
            plan,
            pager,
        })
    }

    pub async fn execute(
        &self,
        request: &QueryRequest,
        ctx: &QueryContext,
    ) -> Result<QueryResponse> {
        let started = Instant::now();
        let Prepared {
            query_id, mut pager, ..
        } = self.prepare(request, ctx).await?;
        let mut data = Vec::new();
        while let Some(rows) = pager.next_chunk(ctx).await? {
            data.extend(rows);
        }
        Ok(QueryResponse {
            query_id,
            row_count: data.len() as u64,
            data,
            execution_ms: started.elapsed().as_millis() as u64,
            from_cache: false,
            next_token: pager.next_token()?,
            truncated: pager.truncated,
        })
    }

    /// Like [`execute`](Self::execute) but hands chunks over as they arrive,
    /// so at most a few chunks are buffered at any time. Validation and
    /// planning errors are returned before anything is spawned.
    pub async fn stream(&self, request: &QueryRequest, ctx: &QueryContext) -> Result<QueryStream> {
        let Prepared {
            query_id,
            plan,
            mut pager,
        } = self.prepare(request, ctx).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER_CHUNKS);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        ctx.cancel();
                        return;
                    }
                    next = pager.next_chunk(&ctx) => next,
                };
                match next {
                    Ok(Some(rows)) => {
                        if tx.send(Ok(StreamItem::Rows(rows))).await.is_err() {
                            // receiver gone
                            ctx.cancel();
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
            let end = pager.next_token().map(|next_token| StreamItem::End {
                row_count: pager.emitted,
                truncated: pager.truncated,
                next_token,
            });
            let _ = tx.send(end).await;
        });
        Ok(QueryStream {
            query_id,
            streaming: plan.streaming(),
            items: rx,
        })
    }

    /// Complexity grading for a request without executing it.
    pub async fn assess(
        &self,
        request: &QueryRequest,
        ctx: &QueryContext,
    ) -> Result<ComplexityReport> {
        let policy = self.policies.for_kind(request.query_type);
        let sort = policy.validate(&request.sort_by)?;
        let estimated = self.estimate_rows(&request.query, ctx).await;
        Ok(ScaleAdvisor::assess(&sort, policy, &self.scale, estimated))
    }
}
