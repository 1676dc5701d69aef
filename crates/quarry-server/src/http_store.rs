use async_trait::async_trait;
use quarry_core::{NodeDescriptor, QueryOutput, Row, StoreError};
use serde::Deserialize;

/// A store node reached over the ClickHouse HTTP interface.
#[derive(Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    url: String,
    database: String,
}

#[derive(Deserialize)]
struct JsonBody {
    #[serde(default)]
    data: Vec<Row>,
    #[serde(default)]
    rows: Option<u64>,
}

impl HttpStore {
    pub fn new(client: reqwest::Client, node: &NodeDescriptor) -> Self {
        Self {
            client,
            url: format!("http://{}:{}/", node.host, node.port),
            database: node.database.clone(),
        }
    }
}

/// DDL and other statements without a result set come back with an empty body.
pub(crate) fn decode_body(body: &str) -> Result<QueryOutput, StoreError> {
    if body.trim().is_empty() {
        return Ok(QueryOutput::default());
    }
    let parsed: JsonBody =
        serde_json::from_str(body).map_err(|e| StoreError::Decode(e.to_string()))?;
    let row_count = parsed.rows.unwrap_or(parsed.data.len() as u64);
    Ok(QueryOutput {
        rows: parsed.data,
        row_count,
    })
}

#[async_trait]
impl quarry_core::Store for HttpStore {
    async fn query(&self, sql: &str) -> Result<QueryOutput, StoreError> {
        let resp = self
            .client
            .post(&self.url)
            .query(&[
                ("database", self.database.as_str()),
                ("default_format", "JSON"),
            ])
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        if !status.is_success() {
            tracing::debug!(url = %self.url, %status, "store rejected statement");
            return Err(StoreError::Rejected(body.trim().to_string()));
        }
        decode_body(&body)
    }
}
