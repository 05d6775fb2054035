use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::range::{RemoteRangeParams, TimeBucket};
use crate::rows::SchemaColumn;
use crate::series::SeriesRow;

/// Aggregation function understood by the remote widget-query API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Agg {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl Agg {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "SUM" => Ok(Agg::Sum),
            "AVG" => Ok(Agg::Avg),
            "COUNT" => Ok(Agg::Count),
            "MIN" => Ok(Agg::Min),
            "MAX" => Ok(Agg::Max),
            other => Err(Error::Other(format!("unrecognized aggregation: {other}"))),
        }
    }
}

/// One metric to compute: `{alias, agg, column_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub alias: String,
    pub agg: Agg,
    pub column_id: String,
}

impl Metric {
    pub fn sum(alias: impl Into<String>, column_id: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            agg: Agg::Sum,
            column_id: column_id.into(),
        }
    }
}

/// An aggregation query, one per distinct source table.
///
/// Once built, a request is a pure function of (metrics, date column,
/// bucket, range params); nothing about it depends on prior responses.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateRequest {
    pub table_id: String,
    pub metrics: Vec<Metric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_column_id: Option<String>,
    pub time_bucket: TimeBucket,
    #[serde(flatten)]
    pub range: RemoteRangeParams,
}

/// Response from the widget-query endpoint.
///
/// An empty `series` with a `message` is a valid "no data in range"
/// response, distinct from a request failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregateResponse {
    #[serde(default)]
    pub series: Vec<SeriesRow>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// A table's schema and raw rows, read from the remote table store.
/// Consumed only by the client-side row-aggregation fallback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableSnapshot {
    #[serde(default)]
    pub schema_json: Vec<SchemaColumn>,
    #[serde(default)]
    pub data_json: Vec<serde_json::Value>,
}

/// The remote calls this subsystem depends on. `ApiClient` is the real
/// implementation; tests drive the dispatcher through stubs.
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateResponse>;
    async fn table_snapshot(&self, table_id: &str) -> Result<TableSnapshot>;
}

const DEFAULT_API_URL: &str = "https://api.thehirepilot.com";

/// HTTP client for the aggregation API and table store.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Other(format!("invalid API base URL {base_url:?}: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            token,
        })
    }

    /// Build a client from `DASHQ_API_URL` and `DASHQ_API_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let base = std::env::var("DASHQ_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let token = std::env::var("DASHQ_API_TOKEN").ok();
        Self::new(&base, token)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Other(format!("invalid endpoint path {path:?}: {e}")))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl Aggregator for ApiClient {
    async fn aggregate(&self, request: &AggregateRequest) -> Result<AggregateResponse> {
        let url = self.endpoint("/api/dashboards/widgets/query")?;
        log::debug!(
            "widget query: table={} metrics={} bucket={} range={}",
            request.table_id,
            request.metrics.len(),
            request.time_bucket,
            request.range.range
        );
        let resp = self
            .authorize(self.http.post(url).json(request))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Api(format!(
                "widget query for table {} failed: HTTP {status}",
                request.table_id
            )));
        }
        let body: AggregateResponse = resp.json().await.map_err(|e| Error::Decode(e.to_string()))?;
        for warning in &body.warnings {
            log::warn!("aggregator warning for table {}: {warning}", request.table_id);
        }
        Ok(body)
    }

    async fn table_snapshot(&self, table_id: &str) -> Result<TableSnapshot> {
        let url = self.endpoint(&format!("/api/tables/{table_id}"))?;
        log::debug!("table snapshot: {table_id}");
        let resp = self.authorize(self.http.get(url)).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(table_id.to_string()));
        }
        if !status.is_success() {
            return Err(Error::Api(format!(
                "table snapshot for {table_id} failed: HTTP {status}"
            )));
        }
        resp.json().await.map_err(|e| Error::Decode(e.to_string()))
    }
}
