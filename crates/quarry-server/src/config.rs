use quarry_core::{ClusterConfig, IndexStrategy, NodeDescriptor, ScalePolicy};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub database: String,
    pub nodes: Vec<NodeDescriptor>,
    pub cluster: ClusterConfig,
    pub scale: ScalePolicy,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let parse_u64 = |key: &str, default: u64| {
            get(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let database = get("QUARRY_DATABASE").unwrap_or_else(|| "default".to_string());
        let mut nodes = parse_nodes(
            &get("QUARRY_NODES").unwrap_or_else(|| "127.0.0.1:8123".to_string()),
            &database,
        );
        if nodes.is_empty() {
            nodes = parse_nodes("127.0.0.1:8123", &database);
        }

        let cluster_defaults = ClusterConfig::default();
        let cluster = ClusterConfig {
            name: get("QUARRY_CLUSTER").unwrap_or(cluster_defaults.name),
            replication_factor: parse_u64(
                "QUARRY_REPLICATION",
                u64::from(cluster_defaults.replication_factor),
            ) as u32,
            partition_key: get("QUARRY_PARTITION_KEY").unwrap_or(cluster_defaults.partition_key),
            sharding_key: get("QUARRY_SHARDING_KEY").unwrap_or(cluster_defaults.sharding_key),
            strategy: get("QUARRY_INDEX_STRATEGY")
                .as_deref()
                .and_then(IndexStrategy::parse)
                .unwrap_or(cluster_defaults.strategy),
        };

        let defaults = ScalePolicy::default();
        let scale = ScalePolicy {
            max_memory_rows: parse_u64("QUARRY_MAX_MEMORY_ROWS", defaults.max_memory_rows),
            chunk_size: parse_u64("QUARRY_CHUNK_SIZE", defaults.chunk_size as u64) as usize,
            query_timeout_seconds: parse_u64(
                "QUARRY_QUERY_TIMEOUT_SECS",
                defaults.query_timeout_seconds,
            ),
            max_chunks: parse_u64("QUARRY_MAX_CHUNKS", defaults.max_chunks as u64) as usize,
            ..defaults
        };

        Self {
            listen: get("QUARRY_LISTEN").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            database,
            nodes,
            cluster,
            scale,
        }
    }
}

/// Parse `host:port[:shard[:replica[:weight]]]` entries separated by commas.
/// Entries without a valid port are skipped.
pub fn parse_nodes(raw: &str, database: &str) -> Vec<NodeDescriptor> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .filter_map(|(i, entry)| {
            let mut parts = entry.split(':');
            let host = parts.next()?.to_string();
            let port = parts.next()?.parse::<u16>().ok()?;
            let mut num = |default: u32| {
                parts
                    .next()
                    .and_then(|s| s.parse::<u32>().ok())
                    .unwrap_or(default)
            };
            let shard = num(i as u32 + 1);
            let replica = num(1);
            let weight = num(1);
            Some(NodeDescriptor {
                host,
                port,
                database: database.to_string(),
                shard,
                replica,
                weight,
            })
        })
        .collect()
}
