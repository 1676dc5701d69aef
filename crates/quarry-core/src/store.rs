use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub rows: Vec<Row>,
    pub row_count: u64,
}

impl QueryOutput {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self { rows, row_count }
    }
}

/// Stores encode 64-bit integers either as numbers or as numeric strings.
pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// One store node reachable through its row query language.
#[async_trait]
pub trait Store: Send + Sync {
    async fn query(&self, sql: &str) -> std::result::Result<QueryOutput, StoreError>;
}

/// Request-scoped cancellation and per-call timeout.
///
/// Every store call made on behalf of a request goes through [`QueryContext::run`],
/// so cancelling the token stops a streaming loop between chunks and aborts the
/// call that is in flight.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_secs(secs: u64) -> Self {
        Self {
            cancel: CancellationToken::new(),
            timeout: (secs > 0).then(|| Duration::from_secs(secs)),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn run(
        &self,
        store: &dyn Store,
        sql: &str,
    ) -> std::result::Result<QueryOutput, StoreError> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let call = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, store.query(sql)).await {
                    Ok(res) => res,
                    Err(_) => Err(StoreError::Timeout(limit.as_secs())),
                },
                None => store.query(sql).await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled),
            res = call => res,
        }
    }
}
