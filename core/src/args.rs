//! Invocation envelopes and the closed per-tool argument sets decoded from them.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ToolError;
use crate::query::DEFAULT_RESULT_LIMIT;
use crate::tools::{
    INCLUDE_EMAIL_PROPERTY, LIMIT_PROPERTY, QUERY_PROPERTY, SUBSCRIPTION_ID_PROPERTY,
    TIME_RANGE_PROPERTY, ToolName,
};

/// The raw envelope a tool is invoked with: `{"arguments": {...}}`.
#[derive(Debug, Default, Deserialize)]
pub struct InvocationContext {
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

impl InvocationContext {
    pub fn new(arguments: Map<String, Value>) -> Self {
        Self {
            arguments: Some(arguments),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// The argument bag; absent or null arguments decode as an empty bag.
    pub fn into_arguments(self) -> Map<String, Value> {
        self.arguments.unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhoAmIArgs {
    pub include_email: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KustoQueryArgs {
    /// Still percent-encoded, as received.
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentFunctionAppsArgs {
    pub time_range: Option<String>,
    pub subscription_id: String,
    pub limit: i64,
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    WhoAmI(WhoAmIArgs),
    KustoQuery(KustoQueryArgs),
    RecentActiveFunctionApps(RecentFunctionAppsArgs),
}

impl ToolCall {
    pub fn decode(tool: ToolName, args: &Map<String, Value>) -> Result<Self, ToolError> {
        Ok(match tool {
            ToolName::WhoAmI => ToolCall::WhoAmI(WhoAmIArgs {
                include_email: arg_flag(args, INCLUDE_EMAIL_PROPERTY, false)?,
            }),
            ToolName::KustoQuery => ToolCall::KustoQuery(KustoQueryArgs {
                query: arg_optional_string(args, QUERY_PROPERTY)?
                    .ok_or_else(ToolError::missing_query)?,
            }),
            ToolName::RecentActiveFunctionApps => {
                let subscription_id = arg_optional_scalar(args, SUBSCRIPTION_ID_PROPERTY)?
                    .ok_or_else(ToolError::missing_subscription_id)?;
                ToolCall::RecentActiveFunctionApps(RecentFunctionAppsArgs {
                    time_range: arg_optional_string(args, TIME_RANGE_PROPERTY)?,
                    subscription_id,
                    limit: arg_limit(args, LIMIT_PROPERTY),
                })
            }
        })
    }

    pub fn tool(&self) -> ToolName {
        match self {
            ToolCall::WhoAmI(_) => ToolName::WhoAmI,
            ToolCall::KustoQuery(_) => ToolName::KustoQuery,
            ToolCall::RecentActiveFunctionApps(_) => ToolName::RecentActiveFunctionApps,
        }
    }
}

fn arg_flag(args: &Map<String, Value>, key: &'static str, default: bool) -> Result<bool, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(v)) => Ok(*v),
        Some(Value::String(v)) if v.eq_ignore_ascii_case("true") => Ok(true),
        Some(Value::String(v)) if v.eq_ignore_ascii_case("false") => Ok(false),
        Some(_) => Err(ToolError::InvalidArgument {
            field: key,
            expected: "a boolean",
        }),
    }
}

fn arg_optional_string(
    args: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) if v.is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.clone())),
        Some(_) => Err(ToolError::InvalidArgument {
            field: key,
            expected: "a string",
        }),
    }
}

/// Like [`arg_optional_string`], but a number is taken as its JSON text.
fn arg_optional_scalar(
    args: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, ToolError> {
    match args.get(key) {
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        _ => arg_optional_string(args, key),
    }
}

/// Positive integer or integer-valued string; anything else is the default limit.
fn arg_limit(args: &Map<String, Value>, key: &str) -> i64 {
    let parsed = match args.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Some(Value::String(v)) => v.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed
        .filter(|limit| *limit > 0)
        .unwrap_or(DEFAULT_RESULT_LIMIT)
}
