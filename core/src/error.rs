use thiserror::Error;

/// Context prefix for identity failures that are not an upstream status.
pub const IDENTITY_ERROR_CONTEXT: &str = "Error determining user identity";
/// Context prefix for query failures that are not an engine service error.
pub const QUERY_ERROR_CONTEXT: &str = "Error executing Kusto query";

/// Every way a tool invocation can fail.
///
/// Handlers carry this type internally; the `Display` text is what the
/// calling agent finally receives, so each message is part of the tool
/// contract and must stay byte-stable.
#[derive(Debug, Error)]
pub enum ToolError {
    /// A required argument was absent or empty.
    #[error("Error: {message}")]
    MissingArgument {
        field: &'static str,
        message: &'static str,
    },
    /// An argument was present but had an unusable type.
    #[error("Error: '{field}' must be {expected}")]
    InvalidArgument {
        field: &'static str,
        expected: &'static str,
    },
    /// Required environment configuration is not set. No remote call was made.
    #[error("Error: Missing required configuration: {}", .0.join(", "))]
    MissingConfiguration(Vec<&'static str>),
    /// The ambient token was injected without its identity claim.
    #[error("No user principal found in EasyAuth headers")]
    MissingPrincipal,
    /// The identity graph answered with something other than 200.
    #[error("Failed to get user info: {status} - {body}")]
    UpstreamStatus { status: u16, body: String },
    /// The analytics engine rejected the query.
    #[error("Kusto service error: {code}: {message}")]
    Service { code: String, message: String },
    /// Anything else, prefixed by the operation that failed.
    #[error("{context}: {message}")]
    Unexpected {
        context: &'static str,
        message: String,
    },
}

/// Machine-readable codes, used as structured log fields.
pub mod codes {
    pub const MISSING_ARGUMENT: &str = "missing_argument";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const MISSING_CONFIGURATION: &str = "missing_configuration";
    pub const MISSING_PRINCIPAL: &str = "missing_principal";
    pub const UPSTREAM_STATUS: &str = "upstream_status";
    pub const SERVICE_ERROR: &str = "service_error";
    pub const UNEXPECTED: &str = "unexpected";
}

impl ToolError {
    pub fn missing_query() -> Self {
        Self::MissingArgument {
            field: "query",
            message: "No query provided in the request",
        }
    }

    pub fn missing_subscription_id() -> Self {
        Self::MissingArgument {
            field: "subscriptionId",
            message: "subscriptionId parameter is required",
        }
    }

    pub fn identity(err: impl std::fmt::Display) -> Self {
        Self::Unexpected {
            context: IDENTITY_ERROR_CONTEXT,
            message: err.to_string(),
        }
    }

    pub fn query(err: impl std::fmt::Display) -> Self {
        Self::Unexpected {
            context: QUERY_ERROR_CONTEXT,
            message: err.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ToolError::MissingArgument { .. } => codes::MISSING_ARGUMENT,
            ToolError::InvalidArgument { .. } => codes::INVALID_ARGUMENT,
            ToolError::MissingConfiguration(_) => codes::MISSING_CONFIGURATION,
            ToolError::MissingPrincipal => codes::MISSING_PRINCIPAL,
            ToolError::UpstreamStatus { .. } => codes::UPSTREAM_STATUS,
            ToolError::Service { .. } => codes::SERVICE_ERROR,
            ToolError::Unexpected { .. } => codes::UNEXPECTED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_argument_messages_are_exact() {
        assert_eq!(
            ToolError::missing_query().to_string(),
            "Error: No query provided in the request"
        );
        assert_eq!(
            ToolError::missing_subscription_id().to_string(),
            "Error: subscriptionId parameter is required"
        );
    }

    #[test]
    fn missing_configuration_lists_every_variable() {
        let err = ToolError::MissingConfiguration(vec!["KUSTO_CLUSTER_URL", "KUSTO_DATABASE"]);
        assert_eq!(
            err.to_string(),
            "Error: Missing required configuration: KUSTO_CLUSTER_URL, KUSTO_DATABASE"
        );
        assert_eq!(err.code(), codes::MISSING_CONFIGURATION);
    }

    #[test]
    fn upstream_status_includes_status_and_body() {
        let err = ToolError::UpstreamStatus {
            status: 401,
            body: "{\"error\":\"InvalidAuthenticationToken\"}".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to get user info: 401 - {\"error\":\"InvalidAuthenticationToken\"}"
        );
    }

    #[test]
    fn unexpected_errors_carry_their_context_prefix() {
        assert_eq!(
            ToolError::identity("bad padding").to_string(),
            "Error determining user identity: bad padding"
        );
        assert_eq!(
            ToolError::query("connection refused").to_string(),
            "Error executing Kusto query: connection refused"
        );
    }
}
