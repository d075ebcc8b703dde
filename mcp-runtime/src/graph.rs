use std::sync::Arc;

use appscope_core::ToolError;
use appscope_core::identity::{UserIdentity, decode_client_principal};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::auth::{Audience, TokenProvider};
use crate::util::{CLIENT_PRINCIPAL_ENV, DEFAULT_GRAPH_API_URL, EnvSource, GRAPH_API_URL_ENV, client};

/// Answers "who is calling" from the injected principal or the graph `me` endpoint.
#[derive(Clone)]
pub struct IdentityResolver {
    env: Arc<dyn EnvSource>,
    tokens: TokenProvider,
}

impl IdentityResolver {
    pub fn new(env: Arc<dyn EnvSource>, tokens: TokenProvider) -> Self {
        Self { env, tokens }
    }

    pub async fn who_am_i(&self, include_email: bool) -> Result<String, ToolError> {
        if self.tokens.has_ambient_token() {
            let principal = self
                .env
                .non_empty(CLIENT_PRINCIPAL_ENV)
                .ok_or(ToolError::MissingPrincipal)?;
            let identity = decode_client_principal(&principal).map_err(ToolError::identity)?;
            let result = identity.render(include_email);
            tracing::info!(user = %result, "Successfully retrieved user info from EasyAuth");
            return Ok(result);
        }

        let identity = self.fetch_me().await?;
        let result = identity.render(include_email);
        tracing::info!(user = %result, "Successfully retrieved user info");
        Ok(result)
    }

    async fn fetch_me(&self) -> Result<UserIdentity, ToolError> {
        let token = self
            .tokens
            .get_token(&Audience::Graph)
            .await
            .map_err(ToolError::identity)?;
        let base = self
            .env
            .non_empty(GRAPH_API_URL_ENV)
            .unwrap_or_else(|| DEFAULT_GRAPH_API_URL.to_string());

        let response = client()
            .get(format!("{}/v1.0/me", base.trim_end_matches('/')))
            .bearer_auth(token.secret())
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(ToolError::identity)?;
        let status = response.status();
        let body = response.text().await.map_err(ToolError::identity)?;
        if status != StatusCode::OK {
            return Err(ToolError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let profile: Value = serde_json::from_str(&body).map_err(ToolError::identity)?;
        Ok(UserIdentity::from_graph_profile(&profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::StaticCredential;
    use crate::util::{AMBIENT_ACCESS_TOKEN_ENV, env_map};
    use base64::Engine;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    fn resolver(env: BTreeMap<String, String>) -> (IdentityResolver, Arc<StaticCredential>) {
        let env: Arc<dyn EnvSource> = Arc::new(env);
        let credential = Arc::new(StaticCredential::new("graph-token"));
        let tokens = TokenProvider::new(env.clone(), credential.clone());
        (IdentityResolver::new(env, tokens), credential)
    }

    fn principal(value: serde_json::Value) -> String {
        base64::engine::general_purpose::STANDARD.encode(value.to_string())
    }

    #[tokio::test]
    async fn injected_principal_is_used_when_ambient_token_present() {
        let encoded = principal(json!({ "name": "Alice", "email": "a@x.com" }));
        let (resolver, credential) = resolver(env_map([
            (AMBIENT_ACCESS_TOKEN_ENV, "ambient"),
            (CLIENT_PRINCIPAL_ENV, encoded.as_str()),
        ]));

        assert_eq!(resolver.who_am_i(true).await.unwrap(), "Alice (a@x.com)");
        assert_eq!(resolver.who_am_i(false).await.unwrap(), "Alice");
        assert_eq!(credential.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ambient_token_without_principal_reports_missing_principal() {
        let (resolver, _) = resolver(env_map([(AMBIENT_ACCESS_TOKEN_ENV, "ambient")]));
        let err = resolver.who_am_i(true).await.unwrap_err();
        assert_eq!(err.to_string(), "No user principal found in EasyAuth headers");
    }

    #[tokio::test]
    async fn undecodable_principal_reports_identity_error() {
        let (resolver, _) = resolver(env_map([
            (AMBIENT_ACCESS_TOKEN_ENV, "ambient"),
            (CLIENT_PRINCIPAL_ENV, "%%%"),
        ]));
        let err = resolver.who_am_i(false).await.unwrap_err();
        assert!(
            err.to_string()
                .starts_with("Error determining user identity: invalid base64")
        );
    }

    #[tokio::test]
    async fn graph_me_is_queried_with_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1.0/me")
                    .header("Authorization", "Bearer graph-token");
                then.status(200)
                    .json_body(json!({ "displayName": "Bob", "mail": "b@y.com" }));
            })
            .await;
        let base_url = server.base_url();
        let (resolver, credential) = resolver(env_map([(GRAPH_API_URL_ENV, base_url.as_str())]));

        assert_eq!(resolver.who_am_i(true).await.unwrap(), "Bob (b@y.com)");
        mock.assert_async().await;
        assert_eq!(credential.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn graph_non_200_is_reported_with_status_and_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1.0/me");
                then.status(401).body("token expired");
            })
            .await;
        let base_url = server.base_url();
        let (resolver, _) = resolver(env_map([(GRAPH_API_URL_ENV, base_url.as_str())]));

        let err = resolver.who_am_i(true).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to get user info: 401 - token expired");
    }
}
