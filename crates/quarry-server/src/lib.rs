pub mod config;
pub mod http_store;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use quarry_core::{
    ClusterCoordinator, ComplexityReport, IndexDefinition, IndexManager, IndexType, IndexUsage,
    NodeDescriptor, QuarryError, QueryExecutor, QueryRequest, QueryResponse, Store, StoreError,
    StreamItem, Suggestion,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

pub use config::ServerConfig;
pub use http_store::HttpStore;

#[derive(Clone)]
pub struct AppState {
    executor: Arc<QueryExecutor>,
    cluster: Arc<ClusterCoordinator>,
    /// Set when only one node is configured: index DDL then targets the
    /// named table directly, with no local tables or distributed view.
    single: Option<IndexManager>,
}

impl AppState {
    /// Reads go through the first node; with more than one node they are
    /// annotated for the distributed engine.
    pub fn new(
        config: &ServerConfig,
        nodes: Vec<(NodeDescriptor, Arc<dyn Store>)>,
    ) -> Option<Self> {
        let multi_node = nodes.len() > 1;
        let cluster = ClusterCoordinator::new(config.cluster.clone(), nodes);
        let store = cluster.coordinator_store()?;
        let mut executor = QueryExecutor::new(store, config.scale.clone());
        let single = if multi_node {
            executor = executor.with_cluster_hints(cluster.hints().clone());
            None
        } else {
            cluster.node_manager(0).cloned()
        };
        Some(Self {
            executor: Arc::new(executor),
            cluster: Arc::new(cluster),
            single,
        })
    }
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    ok: bool,
    data: T,
}

#[derive(Deserialize)]
struct CreateIndexInput {
    table_name: String,
    index_name: String,
    columns: Vec<String>,
    index_type: IndexType,
    granularity: Option<u32>,
}

#[derive(Deserialize)]
struct DropIndexInput {
    table_name: String,
    index_name: String,
}

#[derive(Deserialize)]
struct TableInput {
    table_name: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/query", post(run_query))
        .route("/v1/query/stream", post(stream_query))
        .route("/v1/query/assess", post(assess_query))
        .route("/v1/index", post(create_index))
        .route("/v1/index", delete(drop_index))
        .route("/v1/index/optimize", post(optimize_indexes))
        .route("/v1/index/:table", get(list_indexes))
        .route("/v1/index/:table/recommended", post(create_recommended))
        .route("/v1/index/:table/usage", get(index_usage))
        .route("/v1/index/:table/suggestions", get(index_suggestions))
        .route("/v1/cluster/topology", get(topology))
        .with_state(state)
}

pub async fn serve() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ServerConfig::from_env();
    let client = reqwest::Client::new();
    let nodes = config
        .nodes
        .iter()
        .map(|node| {
            let store: Arc<dyn Store> = Arc::new(HttpStore::new(client.clone(), node));
            (node.clone(), store)
        })
        .collect();
    let state = AppState::new(&config, nodes)
        .ok_or_else(|| anyhow::anyhow!("no store nodes configured"))?;
    tracing::info!(
        nodes = config.nodes.len(),
        cluster = %config.cluster.name,
        database = %config.database,
        "store nodes configured"
    );

    let addr: SocketAddr = config.listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn run_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let ctx = state.executor.context();
    let resp = state.executor.execute(&req, &ctx).await?;
    tracing::info!(
        query_id = %resp.query_id,
        tenant = %req.tenant_id,
        rows = resp.row_count,
        ms = resp.execution_ms,
        "query served"
    );
    Ok(Json(resp))
}

fn stream_line(item: quarry_core::error::Result<StreamItem>) -> String {
    let value = match item {
        Ok(StreamItem::Rows(rows)) => serde_json::json!({ "rows": rows }),
        Ok(StreamItem::End {
            row_count,
            truncated,
            next_token,
        }) => serde_json::json!({
            "end": { "row_count": row_count, "truncated": truncated, "next_token": next_token }
        }),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    };
    format!("{value}\n")
}

/// Newline-delimited JSON: a header line, one line per chunk, then a final
/// `end` or `error` line. Dropping the connection cancels the query.
async fn stream_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    let ctx = state.executor.context();
    let stream = state.executor.stream(&req, &ctx).await?;
    let header_line = format!(
        "{}\n",
        serde_json::json!({ "query_id": stream.query_id, "streaming": stream.streaming })
    );
    let head = futures::stream::once(async move { Ok::<_, Infallible>(header_line) });
    let body = futures::stream::unfold(stream.items, |mut items| async move {
        let item = items.recv().await?;
        Some((Ok::<_, Infallible>(stream_line(item)), items))
    });
    let body = futures::StreamExt::chain(head, body);
    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(body),
    )
        .into_response())
}

async fn assess_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<ApiResponse<ComplexityReport>>, ApiError> {
    let ctx = state.executor.context();
    let report = state.executor.assess(&req, &ctx).await?;
    Ok(Json(ApiResponse {
        ok: true,
        data: report,
    }))
}

async fn create_index(
    State(state): State<AppState>,
    Json(input): Json<CreateIndexInput>,
) -> Result<Json<ApiResponse<Vec<IndexDefinition>>>, ApiError> {
    if input.columns.is_empty() {
        return Err(ApiError::BadRequest("columns must not be empty".into()));
    }
    let def = IndexDefinition::new(
        input.index_name,
        input.table_name,
        input.columns,
        input.index_type,
        input.granularity.unwrap_or(1),
    );
    let ctx = state.executor.context();
    let created = match &state.single {
        Some(indexes) => vec![indexes.create_index(&ctx, def).await?],
        None => state.cluster.create_index(&ctx, def).await?,
    };
    Ok(Json(ApiResponse {
        ok: true,
        data: created,
    }))
}

async fn drop_index(
    State(state): State<AppState>,
    Json(input): Json<DropIndexInput>,
) -> Result<Json<ApiResponse<Vec<Option<IndexDefinition>>>>, ApiError> {
    let ctx = state.executor.context();
    let (table, name) = (&input.table_name, &input.index_name);
    let dropped = match &state.single {
        Some(indexes) => vec![indexes.drop_index(&ctx, table, name).await?],
        None => state.cluster.drop_index(&ctx, table, name).await?,
    };
    Ok(Json(ApiResponse {
        ok: true,
        data: dropped,
    }))
}

async fn list_indexes(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> Result<Json<ApiResponse<Vec<Vec<IndexDefinition>>>>, ApiError> {
    let ctx = state.executor.context();
    let listed = match &state.single {
        Some(indexes) => vec![indexes.list_indexes(&ctx, &table).await?],
        None => state.cluster.list_indexes(&ctx, &table).await?,
    };
    Ok(Json(ApiResponse {
        ok: true,
        data: listed,
    }))
}

async fn create_recommended(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> Result<Json<ApiResponse<Vec<Vec<IndexDefinition>>>>, ApiError> {
    let ctx = state.executor.context();
    let created = match &state.single {
        Some(indexes) => vec![indexes.create_recommended_indexes(&ctx, &table).await?],
        None => state.cluster.create_recommended_indexes(&ctx, &table).await?,
    };
    Ok(Json(ApiResponse {
        ok: true,
        data: created,
    }))
}

async fn optimize_indexes(
    State(state): State<AppState>,
    Json(input): Json<TableInput>,
) -> Result<Json<ApiResponse<Vec<Vec<Suggestion>>>>, ApiError> {
    let ctx = state.executor.context();
    let table = &input.table_name;
    let applied = match &state.single {
        Some(indexes) => vec![indexes.optimize_table(&ctx, table).await?],
        None => state.cluster.optimize_indexes(&ctx, table).await?,
    };
    Ok(Json(ApiResponse {
        ok: true,
        data: applied,
    }))
}

async fn index_usage(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> Result<Json<ApiResponse<Vec<Vec<IndexUsage>>>>, ApiError> {
    let ctx = state.executor.context();
    let usage = match &state.single {
        Some(indexes) => vec![indexes.analyze_usage(&ctx, &table).await?],
        None => state.cluster.analyze_usage(&ctx, &table).await?,
    };
    Ok(Json(ApiResponse {
        ok: true,
        data: usage,
    }))
}

async fn index_suggestions(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> Result<Json<ApiResponse<Vec<Vec<Suggestion>>>>, ApiError> {
    let ctx = state.executor.context();
    let suggestions = match &state.single {
        Some(indexes) => vec![indexes.suggest_optimizations(&ctx, &table).await?],
        None => state.cluster.suggest_optimizations(&ctx, &table).await?,
    };
    Ok(Json(ApiResponse {
        ok: true,
        data: suggestions,
    }))
}

async fn topology(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<NodeDescriptor>>>, ApiError> {
    let ctx = state.executor.context();
    let nodes = state.cluster.get_topology(&ctx).await?;
    Ok(Json(ApiResponse {
        ok: true,
        data: nodes,
    }))
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    BadGateway(String),
    Timeout(String),
    Internal(anyhow::Error),
}

impl From<QuarryError> for ApiError {
    fn from(value: QuarryError) -> Self {
        if value.is_client_error() {
            return ApiError::BadRequest(value.to_string());
        }
        match value {
            QuarryError::Store {
                source: StoreError::Timeout(_),
                ..
            } => ApiError::Timeout(value.to_string()),
            QuarryError::Store { .. } | QuarryError::ClusterPartialFailure { .. } => {
                ApiError::BadGateway(value.to_string())
            }
            other => ApiError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::BadGateway(msg) => {
                tracing::warn!(error = %msg, "store failure");
                (StatusCode::BAD_GATEWAY, msg).into_response()
            }
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg).into_response(),
            ApiError::Internal(err) => {
                tracing::error!("api_error" = %err);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quarry_core::{QueryKind, QueryOutput, SortField};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Answers count queries with a fixed total and everything else with one
    /// row. Every statement is logged.
    struct FixedStore {
        total: u64,
        log: Mutex<Vec<String>>,
    }

    impl FixedStore {
        fn new(total: u64) -> Arc<Self> {
            Arc::new(Self {
                total,
                log: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Store for FixedStore {
        async fn query(&self, sql: &str) -> Result<QueryOutput, StoreError> {
            self.log.lock().push(sql.to_string());
            let row = if sql.contains("count()") {
                json!({ "total": self.total.to_string() })
            } else if sql.contains("system.clusters") {
                json!({
                    "host_name": "ch-a",
                    "port": 9000,
                    "shard_num": 1,
                    "replica_num": 1,
                    "shard_weight": 1
                })
            } else if sql.starts_with("ALTER") {
                return Ok(QueryOutput::default());
            } else {
                json!({ "created_at": "2024-01-01", "tenant_id": "t1" })
            };
            let serde_json::Value::Object(map) = row else {
                unreachable!()
            };
            Ok(QueryOutput::from_rows(vec![map]))
        }
    }

    fn state_with(store: Arc<FixedStore>) -> AppState {
        let config = ServerConfig::from_lookup(|_| None);
        let nodes = config
            .nodes
            .iter()
            .map(|n| {
                let store: Arc<dyn Store> = store.clone();
                (n.clone(), store)
            })
            .collect();
        AppState::new(&config, nodes).unwrap()
    }

    fn state(total: u64) -> AppState {
        state_with(FixedStore::new(total))
    }

    #[tokio::test]
    async fn query_returns_rows() {
        let req =
            QueryRequest::new("t1", "SELECT * FROM tenant_summaries", QueryKind::TenantSummaries);
        let Json(resp) = run_query(State(state(1)), Json(req)).await.unwrap();
        assert_eq!(resp.row_count, 1);
        assert!(!resp.from_cache);
    }

    #[tokio::test]
    async fn disallowed_sort_is_bad_request() {
        let mut req =
            QueryRequest::new("t1", "SELECT * FROM tenant_summaries", QueryKind::TenantSummaries);
        req.sort_by = vec![SortField::asc("password")];
        let err = run_query(State(state(1)), Json(req)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unindexed_sort_at_scale_is_bad_request() {
        let mut req =
            QueryRequest::new("t1", "SELECT * FROM tenant_summaries", QueryKind::TenantSummaries);
        req.sort_by = vec![SortField::desc("total_files")];
        let err = run_query(State(state(500_000)), Json(req))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m.contains("total_files")));
    }

    #[tokio::test]
    async fn topology_reports_cluster_members() {
        let Json(resp) = topology(State(state(1))).await.unwrap();
        assert_eq!(resp.data.len(), 1);
        assert_eq!(resp.data[0].host, "ch-a");
    }

    #[tokio::test]
    async fn single_node_indexes_target_the_named_table() {
        let store = FixedStore::new(1);
        let input: CreateIndexInput = serde_json::from_value(json!({
            "table_name": "events",
            "index_name": "idx_ts",
            "columns": ["ts"],
            "index_type": "min_max"
        }))
        .unwrap();
        let Json(resp) = create_index(State(state_with(store.clone())), Json(input))
            .await
            .unwrap();
        assert_eq!(resp.data.len(), 1);
        assert_eq!(resp.data[0].name, "idx_ts");
        assert_eq!(resp.data[0].table, "events");

        let add = "ALTER TABLE `events` ADD INDEX IF NOT EXISTS `idx_ts` (`ts`) TYPE minmax GRANULARITY 1";
        let log = store.log.lock().clone();
        assert!(log.iter().any(|sql| sql == add));
        assert!(log.iter().all(|sql| !sql.contains("CREATE TABLE")));
        assert!(log.iter().all(|sql| !sql.contains("_local")));
    }

    #[tokio::test]
    async fn bad_index_name_is_bad_request() {
        let store = FixedStore::new(1);
        let input: DropIndexInput = serde_json::from_value(json!({
            "table_name": "events",
            "index_name": "idx ts"
        }))
        .unwrap();
        let err = drop_index(State(state_with(store.clone())), Json(input))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        assert!(store.log.lock().is_empty());
    }

    #[test]
    fn partial_failure_maps_to_bad_gateway() {
        let err = ApiError::from(QuarryError::ClusterPartialFailure {
            failed: vec![quarry_core::NodeFailure {
                ordinal: 1,
                host: "ch-b".into(),
                port: 8123,
                error: "connection refused".into(),
            }],
            total: 2,
        });
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn end_line_carries_token() {
        let line = stream_line(Ok(StreamItem::End {
            row_count: 3,
            truncated: true,
            next_token: Some("{\"id\":3}".into()),
        }));
        let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["end"]["truncated"], true);
        assert_eq!(parsed["end"]["row_count"], 3);
    }
}
