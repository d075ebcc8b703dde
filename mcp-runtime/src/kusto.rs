//! Query execution against the analytics engine's REST query endpoint.

use std::sync::Arc;

use appscope_core::ToolError;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::{AccessToken, Audience, AuthError, TokenProvider};
use crate::util::{EnvSource, KUSTO_CLUSTER_URL_ENV, KUSTO_DATABASE_ENV, client};

/// One result row, keyed by column name in engine column order.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KustoTarget {
    pub cluster_url: String,
    pub database: String,
}

impl KustoTarget {
    /// Both variables are required; every missing one is reported.
    pub fn from_env(env: &dyn EnvSource) -> Result<Self, ToolError> {
        let cluster_url = env.non_empty(KUSTO_CLUSTER_URL_ENV);
        let database = env.non_empty(KUSTO_DATABASE_ENV);
        match (cluster_url, database) {
            (Some(cluster_url), Some(database)) => Ok(Self {
                cluster_url,
                database,
            }),
            (cluster_url, database) => {
                let mut missing = Vec::new();
                if cluster_url.is_none() {
                    missing.push(KUSTO_CLUSTER_URL_ENV);
                }
                if database.is_none() {
                    missing.push(KUSTO_DATABASE_ENV);
                }
                Err(ToolError::MissingConfiguration(missing))
            }
        }
    }

    pub fn audience(&self) -> Audience {
        Audience::AnalyticsEngine(self.cluster_url.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultColumn {
    pub column_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultTable {
    #[serde(default)]
    pub table_name: String,
    pub columns: Vec<ResultColumn>,
    #[serde(default)]
    pub rows: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct QueryResponse {
    tables: Vec<ResultTable>,
}

impl ResultTable {
    /// Zip each row with the column names.
    ///
    /// Datetime, timespan, decimal and guid cells already arrive as strings
    /// on the wire and are kept that way. A row carrying an `Exceptions`
    /// marker fails the whole table.
    pub fn into_records(self) -> Result<Vec<Row>, QueryError> {
        let mut records: Vec<Row> = Vec::with_capacity(self.rows.len());
        for row in self.rows {
            let cells = match row {
                Value::Array(cells) => cells,
                Value::Object(marker) => {
                    return Err(in_band_exception(&marker));
                }
                other => {
                    return Err(QueryError::Malformed(format!(
                        "row is neither an array nor an exception marker: {other}"
                    )));
                }
            };
            if cells.len() != self.columns.len() {
                return Err(QueryError::Malformed(format!(
                    "row has {} cells but table '{}' has {} columns",
                    cells.len(),
                    self.table_name,
                    self.columns.len()
                )));
            }
            records.push(
                self.columns
                    .iter()
                    .map(|column| column.column_name.clone())
                    .zip(cells)
                    .collect(),
            );
        }
        Ok(records)
    }
}

fn in_band_exception(marker: &Map<String, Value>) -> QueryError {
    let message = match marker.get("Exceptions") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).unwrap_or_else(|| item.to_string()))
            .collect::<Vec<_>>()
            .join("; "),
        Some(other) => other.to_string(),
        None => Value::Object(marker.clone()).to_string(),
    };
    QueryError::Service {
        code: "QueryExecutionError".to_string(),
        message,
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    /// The engine itself rejected or failed the query.
    #[error("{code}: {message}")]
    Service { code: String, message: String },
    #[error("failed to reach {cluster}: {source}")]
    Transport {
        cluster: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response from query endpoint: {0}")]
    Malformed(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<QueryError> for ToolError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Service { code, message } => ToolError::Service { code, message },
            other => ToolError::query(other),
        }
    }
}

/// The opaque engine: run a query, hand back the primary result table.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(
        &self,
        target: &KustoTarget,
        token: &AccessToken,
        query: &str,
    ) -> Result<ResultTable, QueryError>;
}

/// `POST {cluster}/v1/rest/query` with a fresh HTTP client per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct KustoRestEngine;

#[async_trait]
impl QueryEngine for KustoRestEngine {
    async fn execute(
        &self,
        target: &KustoTarget,
        token: &AccessToken,
        query: &str,
    ) -> Result<ResultTable, QueryError> {
        let cluster = target.cluster_url.trim_end_matches('/').to_string();
        let response = client()
            .post(format!("{cluster}/v1/rest/query"))
            .bearer_auth(token.secret())
            .header(ACCEPT, "application/json")
            .header("x-ms-client-request-id", format!("appscope;{}", Uuid::now_v7()))
            .header("x-ms-app", "appscope")
            .json(&json!({
                "db": target.database,
                "csl": query,
            }))
            .send()
            .await
            .map_err(|source| QueryError::Transport {
                cluster: cluster.clone(),
                source,
            })?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|source| QueryError::Transport { cluster, source })?;
        if !status.is_success() {
            return Err(service_error(status, &bytes));
        }

        let parsed: QueryResponse = serde_json::from_slice(&bytes)
            .map_err(|e| QueryError::Malformed(e.to_string()))?;
        parsed
            .tables
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::Malformed("response contained no tables".to_string()))
    }
}

/// The engine reports failures as `{"error": {"code", "message", "@message"}}`.
fn service_error(status: reqwest::StatusCode, body: &[u8]) -> QueryError {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));
    let field = |key: &str| {
        error
            .and_then(|e| e.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    QueryError::Service {
        code: field("code").unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
        message: field("@message")
            .or_else(|| field("message"))
            .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string()),
    }
}

/// Resolves configuration and a token, runs the query, and renders the rows as JSON.
#[derive(Clone)]
pub struct QueryExecutor {
    env: Arc<dyn EnvSource>,
    tokens: TokenProvider,
    engine: Arc<dyn QueryEngine>,
}

impl QueryExecutor {
    pub fn new(env: Arc<dyn EnvSource>, tokens: TokenProvider, engine: Arc<dyn QueryEngine>) -> Self {
        Self {
            env,
            tokens,
            engine,
        }
    }

    pub async fn execute(&self, query: &str) -> Result<String, ToolError> {
        let target = KustoTarget::from_env(self.env.as_ref())?;
        let token = self
            .tokens
            .get_token(&target.audience())
            .await
            .map_err(QueryError::from)?;

        tracing::info!(database = %target.database, "Executing Kusto query");
        let table = self.engine.execute(&target, &token, query).await?;
        let records = table.into_records()?;
        tracing::info!(rows = records.len(), "Kusto query completed");

        serde_json::to_string_pretty(&records).map_err(ToolError::query)
    }
}
