//! Bearer token acquisition for the identity graph and the analytics engine.
//!
//! An ambient platform-injected token always wins. Without one, a layered
//! credential chain is consulted: service principal from the environment,
//! then managed identity, then the developer's Azure CLI login.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::util::{
    AMBIENT_ACCESS_TOKEN_ENV, AZURE_AUTHORITY_HOST_ENV, AZURE_CLIENT_ID_ENV,
    AZURE_CLIENT_SECRET_ENV, AZURE_TENANT_ID_ENV, EnvSource, IDENTITY_ENDPOINT_ENV,
    IDENTITY_HEADER_ENV, IMDS_AUTHORITY_HOST_ENV, client,
};

pub const GRAPH_RESOURCE: &str = "https://graph.microsoft.com";
const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const DEFAULT_IMDS_HOST: &str = "http://169.254.169.254";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const IMDS_API_VERSION: &str = "2018-02-01";
const IMDS_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Graph,
    /// Keyed by cluster URL.
    AnalyticsEngine(String),
}

impl Audience {
    pub fn resource(&self) -> &str {
        match self {
            Audience::Graph => GRAPH_RESOURCE,
            Audience::AnalyticsEngine(cluster_url) => cluster_url.trim_end_matches('/'),
        }
    }

    pub fn scope(&self) -> String {
        format!("{}/.default", self.resource())
    }
}

#[derive(Clone)]
pub struct AccessToken {
    secret: String,
    pub expires_on: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_on: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_on,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential has nothing to work with here; the chain moves on.
    #[error("{credential} unavailable: {reason}")]
    Unavailable {
        credential: &'static str,
        reason: String,
    },
    /// The credential is configured but the token request failed.
    #[error("{credential} authentication failed: {message}")]
    Failed {
        credential: &'static str,
        message: String,
    },
    #[error("no credential could provide a token: {}", .0.join("; "))]
    ChainExhausted(Vec<String>),
}

#[async_trait]
pub trait TokenCredential: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_token(&self, audience: &Audience) -> Result<AccessToken, AuthError>;
}

/// Resolves a token per call. Nothing is cached.
#[derive(Clone)]
pub struct TokenProvider {
    env: Arc<dyn EnvSource>,
    credential: Arc<dyn TokenCredential>,
}

impl TokenProvider {
    pub fn new(env: Arc<dyn EnvSource>, credential: Arc<dyn TokenCredential>) -> Self {
        Self { env, credential }
    }

    pub fn with_default_chain(env: Arc<dyn EnvSource>) -> Self {
        let credential = Arc::new(DefaultCredentialChain::new(env.clone()));
        Self { env, credential }
    }

    pub fn has_ambient_token(&self) -> bool {
        self.env.non_empty(AMBIENT_ACCESS_TOKEN_ENV).is_some()
    }

    /// The ambient token is returned for every audience, without checking
    /// which audience it was minted for.
    pub async fn get_token(&self, audience: &Audience) -> Result<AccessToken, AuthError> {
        if let Some(token) = self.env.non_empty(AMBIENT_ACCESS_TOKEN_ENV) {
            tracing::info!(audience = audience.resource(), "Using EasyAuth authentication");
            return Ok(AccessToken::new(token, None));
        }
        tracing::info!(
            audience = audience.resource(),
            credential = self.credential.name(),
            "Using credential chain for local development"
        );
        self.credential.get_token(audience).await
    }
}

/// Environment service principal, managed identity, Azure CLI, in that order.
pub struct DefaultCredentialChain {
    sources: Vec<Box<dyn TokenCredential>>,
}

impl DefaultCredentialChain {
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            sources: vec![
                Box::new(EnvironmentCredential::new(env.clone())),
                Box::new(ManagedIdentityCredential::new(env)),
                Box::new(AzureCliCredential),
            ],
        }
    }

    pub fn from_sources(sources: Vec<Box<dyn TokenCredential>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl TokenCredential for DefaultCredentialChain {
    fn name(&self) -> &'static str {
        "DefaultCredentialChain"
    }

    async fn get_token(&self, audience: &Audience) -> Result<AccessToken, AuthError> {
        let mut attempts = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source.get_token(audience).await {
                Ok(token) => {
                    tracing::debug!(credential = source.name(), "credential chain resolved token");
                    return Ok(token);
                }
                Err(err @ AuthError::Unavailable { .. }) => {
                    tracing::debug!(credential = source.name(), error = %err, "skipping credential");
                    attempts.push(err.to_string());
                }
                Err(err) => return Err(err),
            }
        }
        Err(AuthError::ChainExhausted(attempts))
    }
}

#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Client-credentials grant for a service principal configured via
/// `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, `AZURE_CLIENT_SECRET`.
pub struct EnvironmentCredential {
    env: Arc<dyn EnvSource>,
}

impl EnvironmentCredential {
    const NAME: &'static str = "EnvironmentCredential";

    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl TokenCredential for EnvironmentCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, audience: &Audience) -> Result<AccessToken, AuthError> {
        let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
            self.env.non_empty(AZURE_TENANT_ID_ENV),
            self.env.non_empty(AZURE_CLIENT_ID_ENV),
            self.env.non_empty(AZURE_CLIENT_SECRET_ENV),
        ) else {
            return Err(AuthError::Unavailable {
                credential: Self::NAME,
                reason: format!(
                    "{AZURE_TENANT_ID_ENV}, {AZURE_CLIENT_ID_ENV} and {AZURE_CLIENT_SECRET_ENV} must all be set"
                ),
            });
        };
        let authority = self
            .env
            .non_empty(AZURE_AUTHORITY_HOST_ENV)
            .unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.to_string());
        let url = format!(
            "{}/{tenant_id}/oauth2/v2.0/token",
            authority.trim_end_matches('/')
        );
        let scope = audience.scope();
        let response = client()
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| failed(Self::NAME, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failed(Self::NAME, format!("{status} - {body}")));
        }
        let token: OAuthTokenResponse = response.json().await.map_err(|e| failed(Self::NAME, e))?;
        Ok(AccessToken::new(
            token.access_token,
            token.expires_in.and_then(|secs| expiry_after(Utc::now(), secs)),
        ))
    }
}

#[derive(Deserialize)]
struct ManagedIdentityTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_on: Option<Value>,
}

/// App Service identity endpoint when injected, otherwise the instance metadata service.
pub struct ManagedIdentityCredential {
    env: Arc<dyn EnvSource>,
}

impl ManagedIdentityCredential {
    const NAME: &'static str = "ManagedIdentityCredential";

    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self { env }
    }

    async fn app_service_token(
        &self,
        endpoint: &str,
        header: &str,
        audience: &Audience,
    ) -> Result<AccessToken, AuthError> {
        let mut query = vec![
            ("api-version", APP_SERVICE_API_VERSION.to_string()),
            ("resource", audience.resource().to_string()),
        ];
        if let Some(client_id) = self.env.non_empty(AZURE_CLIENT_ID_ENV) {
            query.push(("client_id", client_id));
        }
        let response = client()
            .get(endpoint)
            .header("X-IDENTITY-HEADER", header)
            .query(&query)
            .send()
            .await
            .map_err(|e| failed(Self::NAME, e))?;
        read_managed_identity_response(response).await
    }

    async fn imds_token(&self, audience: &Audience) -> Result<AccessToken, AuthError> {
        let host = self
            .env
            .non_empty(IMDS_AUTHORITY_HOST_ENV)
            .unwrap_or_else(|| DEFAULT_IMDS_HOST.to_string());
        let url = format!(
            "{}/metadata/identity/oauth2/token",
            host.trim_end_matches('/')
        );
        let mut query = vec![
            ("api-version", IMDS_API_VERSION.to_string()),
            ("resource", audience.resource().to_string()),
        ];
        if let Some(client_id) = self.env.non_empty(AZURE_CLIENT_ID_ENV) {
            query.push(("client_id", client_id));
        }
        let probe = reqwest::Client::builder()
            .connect_timeout(IMDS_PROBE_TIMEOUT)
            .build()
            .map_err(|e| failed(Self::NAME, e))?;
        let response = probe
            .get(url)
            .header("Metadata", "true")
            .query(&query)
            .send()
            .await
            .map_err(|e| AuthError::Unavailable {
                credential: Self::NAME,
                reason: format!("instance metadata endpoint unreachable: {e}"),
            })?;
        read_managed_identity_response(response).await
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, audience: &Audience) -> Result<AccessToken, AuthError> {
        match (
            self.env.non_empty(IDENTITY_ENDPOINT_ENV),
            self.env.non_empty(IDENTITY_HEADER_ENV),
        ) {
            (Some(endpoint), Some(header)) => {
                self.app_service_token(&endpoint, &header, audience).await
            }
            _ => self.imds_token(audience).await,
        }
    }
}

async fn read_managed_identity_response(
    response: reqwest::Response,
) -> Result<AccessToken, AuthError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        // IMDS answers 400 when no identity is assigned to the host.
        if status == reqwest::StatusCode::BAD_REQUEST {
            return Err(AuthError::Unavailable {
                credential: ManagedIdentityCredential::NAME,
                reason: format!("no managed identity assigned: {body}"),
            });
        }
        return Err(failed(
            ManagedIdentityCredential::NAME,
            format!("{status} - {body}"),
        ));
    }
    let token: ManagedIdentityTokenResponse = response
        .json()
        .await
        .map_err(|e| failed(ManagedIdentityCredential::NAME, e))?;
    Ok(AccessToken::new(
        token.access_token,
        token.expires_on.as_ref().and_then(parse_epoch),
    ))
}

#[derive(Deserialize)]
struct CliTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(default)]
    expires_on: Option<Value>,
}

/// Token from the signed-in Azure CLI (`az login`).
pub struct AzureCliCredential;

impl AzureCliCredential {
    const NAME: &'static str = "AzureCliCredential";

    fn program() -> &'static str {
        if cfg!(windows) { "az.cmd" } else { "az" }
    }
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn get_token(&self, audience: &Audience) -> Result<AccessToken, AuthError> {
        let output = tokio::process::Command::new(Self::program())
            .args([
                "account",
                "get-access-token",
                "--resource",
                audience.resource(),
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|e| AuthError::Unavailable {
                credential: Self::NAME,
                reason: format!("Azure CLI not found: {e}"),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("az login") {
                return Err(AuthError::Unavailable {
                    credential: Self::NAME,
                    reason: stderr,
                });
            }
            return Err(failed(Self::NAME, stderr));
        }
        parse_cli_token(&output.stdout)
    }
}

fn parse_cli_token(stdout: &[u8]) -> Result<AccessToken, AuthError> {
    let token: CliTokenResponse = serde_json::from_slice(stdout)
        .map_err(|e| failed(AzureCliCredential::NAME, format!("unexpected CLI output: {e}")))?;
    Ok(AccessToken::new(
        token.access_token,
        token.expires_on.as_ref().and_then(parse_epoch),
    ))
}

/// Managed identity and CLI report expiry as epoch seconds, either numeric or stringified.
fn parse_epoch(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp(secs, 0)
}

/// `None` when the lifetime does not fit in a timestamp.
fn expiry_after(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_seconds(secs).and_then(|lifetime| now.checked_add_signed(lifetime))
}

fn failed(credential: &'static str, err: impl std::fmt::Display) -> AuthError {
    AuthError::Failed {
        credential,
        message: err.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::util::env_map;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out a fixed token and records how often it was asked.
    pub(crate) struct StaticCredential {
        pub token: &'static str,
        pub calls: AtomicUsize,
    }

    impl StaticCredential {
        pub(crate) fn new(token: &'static str) -> Self {
            Self {
                token,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenCredential for StaticCredential {
        fn name(&self) -> &'static str {
            "StaticCredential"
        }

        async fn get_token(&self, _audience: &Audience) -> Result<AccessToken, AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken::new(self.token, None))
        }
    }

    struct UnavailableCredential;

    #[async_trait]
    impl TokenCredential for UnavailableCredential {
        fn name(&self) -> &'static str {
            "UnavailableCredential"
        }

        async fn get_token(&self, _audience: &Audience) -> Result<AccessToken, AuthError> {
            Err(AuthError::Unavailable {
                credential: "UnavailableCredential",
                reason: "not here".to_string(),
            })
        }
    }

    struct FailingCredential;

    #[async_trait]
    impl TokenCredential for FailingCredential {
        fn name(&self) -> &'static str {
            "FailingCredential"
        }

        async fn get_token(&self, _audience: &Audience) -> Result<AccessToken, AuthError> {
            Err(failed("FailingCredential", "invalid_client"))
        }
    }

    #[test]
    fn audience_scopes_use_default_suffix() {
        assert_eq!(Audience::Graph.scope(), "https://graph.microsoft.com/.default");
        assert_eq!(
            Audience::AnalyticsEngine("https://help.kusto.windows.net/".to_string()).scope(),
            "https://help.kusto.windows.net/.default"
        );
    }

    #[test]
    fn access_token_debug_redacts_secret() {
        let token = AccessToken::new("super-secret", None);
        assert!(!format!("{token:?}").contains("super-secret"));
    }

    #[tokio::test]
    async fn ambient_token_is_reused_for_every_audience() {
        let env = Arc::new(env_map([(AMBIENT_ACCESS_TOKEN_ENV, "ambient")]));
        let credential = Arc::new(StaticCredential::new("chained"));
        let provider = TokenProvider::new(env, credential.clone());

        let graph = provider.get_token(&Audience::Graph).await.unwrap();
        let kusto = provider
            .get_token(&Audience::AnalyticsEngine("https://c.kusto.windows.net".to_string()))
            .await
            .unwrap();

        assert_eq!(graph.secret(), "ambient");
        assert_eq!(kusto.secret(), "ambient");
        assert_eq!(credential.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn credential_is_consulted_on_every_call_without_ambient_token() {
        let env = Arc::new(env_map([(AMBIENT_ACCESS_TOKEN_ENV, "")]));
        let credential = Arc::new(StaticCredential::new("chained"));
        let provider = TokenProvider::new(env, credential.clone());

        for _ in 0..2 {
            let token = provider.get_token(&Audience::Graph).await.unwrap();
            assert_eq!(token.secret(), "chained");
        }
        assert_eq!(credential.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn chain_skips_unavailable_and_stops_on_failure() {
        let chain = DefaultCredentialChain::from_sources(vec![
            Box::new(UnavailableCredential),
            Box::new(StaticCredential::new("second")),
        ]);
        assert_eq!(
            chain.get_token(&Audience::Graph).await.unwrap().secret(),
            "second"
        );

        let chain = DefaultCredentialChain::from_sources(vec![
            Box::new(FailingCredential),
            Box::new(StaticCredential::new("never")),
        ]);
        let err = chain.get_token(&Audience::Graph).await.unwrap_err();
        assert!(matches!(err, AuthError::Failed { .. }));

        let chain = DefaultCredentialChain::from_sources(vec![Box::new(UnavailableCredential)]);
        let err = chain.get_token(&Audience::Graph).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "no credential could provide a token: UnavailableCredential unavailable: not here"
        );
    }

    #[tokio::test]
    async fn environment_credential_requires_all_three_variables() {
        let env = Arc::new(env_map([(AZURE_TENANT_ID_ENV, "tenant")]));
        let err = EnvironmentCredential::new(env)
            .get_token(&Audience::Graph)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn environment_credential_posts_client_credentials_grant() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/tenant-1/oauth2/v2.0/token")
                    .x_www_form_urlencoded_tuple("grant_type", "client_credentials")
                    .x_www_form_urlencoded_tuple("client_id", "app-1")
                    .x_www_form_urlencoded_tuple("scope", "https://graph.microsoft.com/.default");
                then.status(200).json_body(json!({
                    "token_type": "Bearer",
                    "expires_in": 3599,
                    "access_token": "sp-token"
                }));
            })
            .await;
        let base_url = server.base_url();
        let env = Arc::new(env_map([
            (AZURE_TENANT_ID_ENV, "tenant-1"),
            (AZURE_CLIENT_ID_ENV, "app-1"),
            (AZURE_CLIENT_SECRET_ENV, "shh"),
            (AZURE_AUTHORITY_HOST_ENV, base_url.as_str()),
        ]));

        let token = EnvironmentCredential::new(env)
            .get_token(&Audience::Graph)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(token.secret(), "sp-token");
        assert!(token.expires_on.is_some());
    }

    #[tokio::test]
    async fn environment_credential_tolerates_unrepresentable_lifetime() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/tenant-1/oauth2/v2.0/token");
                then.status(200).json_body(json!({
                    "access_token": "x",
                    "expires_in": i64::MAX
                }));
            })
            .await;
        let base_url = server.base_url();
        let env = Arc::new(env_map([
            (AZURE_TENANT_ID_ENV, "tenant-1"),
            (AZURE_CLIENT_ID_ENV, "app-1"),
            (AZURE_CLIENT_SECRET_ENV, "shh"),
            (AZURE_AUTHORITY_HOST_ENV, base_url.as_str()),
        ]));

        let token = EnvironmentCredential::new(env)
            .get_token(&Audience::Graph)
            .await
            .unwrap();

        assert_eq!(token.secret(), "x");
        assert!(token.expires_on.is_none());
    }

    #[test]
    fn expiry_after_rejects_overflow() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            expiry_after(now, 60).map(|t| t.timestamp()),
            Some(1_700_000_060)
        );
        assert!(expiry_after(now, i64::MAX).is_none());
        assert!(expiry_after(DateTime::<Utc>::MAX_UTC, 1).is_none());
    }

    #[tokio::test]
    async fn managed_identity_uses_app_service_endpoint_when_injected() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/msi/token")
                    .header("X-IDENTITY-HEADER", "identity-secret")
                    .query_param("api-version", "2019-08-01")
                    .query_param("resource", "https://c.kusto.windows.net");
                then.status(200).json_body(json!({
                    "access_token": "mi-token",
                    "expires_on": "1893456000",
                    "resource": "https://c.kusto.windows.net",
                    "token_type": "Bearer"
                }));
            })
            .await;
        let endpoint = server.url("/msi/token");
        let env = Arc::new(env_map([
            (IDENTITY_ENDPOINT_ENV, endpoint.as_str()),
            (IDENTITY_HEADER_ENV, "identity-secret"),
        ]));

        let token = ManagedIdentityCredential::new(env)
            .get_token(&Audience::AnalyticsEngine(
                "https://c.kusto.windows.net".to_string(),
            ))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(token.secret(), "mi-token");
        assert_eq!(token.expires_on.map(|t| t.timestamp()), Some(1_893_456_000));
    }

    #[tokio::test]
    async fn imds_without_identity_is_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/metadata/identity/oauth2/token")
                    .header("Metadata", "true");
                then.status(400)
                    .body(r#"{"error":"invalid_request","error_description":"Identity not found"}"#);
            })
            .await;
        let base_url = server.base_url();
        let env = Arc::new(env_map([(IMDS_AUTHORITY_HOST_ENV, base_url.as_str())]));

        let err = ManagedIdentityCredential::new(env)
            .get_token(&Audience::Graph)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unavailable { .. }));
    }

    #[test]
    fn cli_output_is_parsed_with_epoch_expiry() {
        let stdout = br#"{"accessToken":"cli-token","expiresOn":"2030-01-01 00:00:00.000000","expires_on":1893456000,"tokenType":"Bearer"}"#;
        let token = parse_cli_token(stdout).unwrap();
        assert_eq!(token.secret(), "cli-token");
        assert_eq!(token.expires_on.map(|t| t.timestamp()), Some(1_893_456_000));
        assert!(matches!(
            parse_cli_token(b"not json"),
            Err(AuthError::Failed { .. })
        ));
    }
}
