use std::collections::BTreeMap;

/// Platform-injected bearer token (EasyAuth).
pub const AMBIENT_ACCESS_TOKEN_ENV: &str = "HTTP_X_MS_TOKEN_AAD_ACCESS_TOKEN";
/// Platform-injected base64 JSON principal (EasyAuth).
pub const CLIENT_PRINCIPAL_ENV: &str = "HTTP_X_MS_CLIENT_PRINCIPAL";
pub const KUSTO_CLUSTER_URL_ENV: &str = "KUSTO_CLUSTER_URL";
pub const KUSTO_DATABASE_ENV: &str = "KUSTO_DATABASE";
pub const GRAPH_API_URL_ENV: &str = "GRAPH_API_URL";

pub const AZURE_TENANT_ID_ENV: &str = "AZURE_TENANT_ID";
pub const AZURE_CLIENT_ID_ENV: &str = "AZURE_CLIENT_ID";
pub const AZURE_CLIENT_SECRET_ENV: &str = "AZURE_CLIENT_SECRET";
pub const AZURE_AUTHORITY_HOST_ENV: &str = "AZURE_AUTHORITY_HOST";
pub const IDENTITY_ENDPOINT_ENV: &str = "IDENTITY_ENDPOINT";
pub const IDENTITY_HEADER_ENV: &str = "IDENTITY_HEADER";
pub const IMDS_AUTHORITY_HOST_ENV: &str = "AZURE_POD_IDENTITY_AUTHORITY_HOST";

pub const DEFAULT_GRAPH_API_URL: &str = "https://graph.microsoft.com";

/// Read-only view of the process configuration, consulted at call time.
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;

    /// Unset and empty are treated alike.
    fn non_empty(&self, key: &str) -> Option<String> {
        self.var(key).filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for BTreeMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Fresh client per call; no pooling is shared across invocations.
pub fn client() -> reqwest::Client {
    reqwest::Client::new()
}

#[cfg(test)]
pub(crate) fn env_map<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
