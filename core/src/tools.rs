use serde::Serialize;
use serde_json::{Map, Value, json};

pub const INCLUDE_EMAIL_PROPERTY: &str = "includeEmail";
pub const QUERY_PROPERTY: &str = "query";
pub const TIME_RANGE_PROPERTY: &str = "timeRange";
pub const SUBSCRIPTION_ID_PROPERTY: &str = "subscriptionId";
pub const LIMIT_PROPERTY: &str = "limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    WhoAmI,
    KustoQuery,
    RecentActiveFunctionApps,
}

impl ToolName {
    pub const ALL: [ToolName; 3] = [
        ToolName::WhoAmI,
        ToolName::KustoQuery,
        ToolName::RecentActiveFunctionApps,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::WhoAmI => "whoAmI",
            ToolName::KustoQuery => "kustoQuery",
            ToolName::RecentActiveFunctionApps => "getRecentActiveFunctionApps",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == raw)
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One advertised parameter of a tool.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolProperty {
    pub property_name: &'static str,
    pub property_type: &'static str,
    pub description: &'static str,
}

impl ToolProperty {
    pub const fn new(
        property_name: &'static str,
        property_type: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            property_name,
            property_type,
            description,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: ToolName,
    pub description: &'static str,
    pub properties: &'static [ToolProperty],
    pub required: &'static [&'static str],
}

impl ToolDefinition {
    /// JSON-Schema view of the property descriptors.
    pub fn input_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .properties
            .iter()
            .map(|prop| {
                (
                    prop.property_name.to_string(),
                    json!({ "type": prop.property_type, "description": prop.description }),
                )
            })
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }

    pub fn tool_properties(&self) -> Value {
        serde_json::to_value(self.properties).unwrap_or_else(|_| Value::Array(Vec::new()))
    }
}

const WHO_AM_I_PROPERTIES: &[ToolProperty] = &[ToolProperty::new(
    INCLUDE_EMAIL_PROPERTY,
    "boolean",
    "Whether to include email address in the response.",
)];

const KUSTO_QUERY_PROPERTIES: &[ToolProperty] = &[ToolProperty::new(
    QUERY_PROPERTY,
    "string",
    "URL-encoded KQL query to execute against the configured database.",
)];

const RECENT_FUNCTION_APPS_PROPERTIES: &[ToolProperty] = &[
    ToolProperty::new(
        TIME_RANGE_PROPERTY,
        "string",
        "How far back to look, e.g. 7d, 24h or 30m. Defaults to 7d.",
    ),
    ToolProperty::new(
        SUBSCRIPTION_ID_PROPERTY,
        "string",
        "Azure subscription id (GUID) whose function apps are reported.",
    ),
    ToolProperty::new(
        LIMIT_PROPERTY,
        "integer",
        "Maximum number of apps to return. Defaults to 100.",
    ),
];

pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: ToolName::WhoAmI,
            description: "Determine who I am by searching Microsoft Graph.",
            properties: WHO_AM_I_PROPERTIES,
            required: &[],
        },
        ToolDefinition {
            name: ToolName::KustoQuery,
            description: "Run a KQL query against the configured Kusto database and return the rows as JSON.",
            properties: KUSTO_QUERY_PROPERTIES,
            required: &[QUERY_PROPERTY],
        },
        ToolDefinition {
            name: ToolName::RecentActiveFunctionApps,
            description: "List function apps in a subscription that were active within a recent time range.",
            properties: RECENT_FUNCTION_APPS_PROPERTIES,
            required: &[SUBSCRIPTION_ID_PROPERTY],
        },
    ]
}
