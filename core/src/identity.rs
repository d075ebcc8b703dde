use base64::Engine;
use serde_json::Value;
use thiserror::Error;

pub const UNKNOWN_USER: &str = "Unknown User";

/// Render a user for display. The email is appended only when requested and non-empty.
pub fn format_user_info(display_name: &str, email: Option<&str>, include_email: bool) -> String {
    match email {
        Some(email) if include_email && !email.is_empty() => format!("{display_name} ({email})"),
        _ => display_name.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub display_name: String,
    pub email: Option<String>,
}

impl UserIdentity {
    pub fn render(&self, include_email: bool) -> String {
        format_user_info(&self.display_name, self.email.as_deref(), include_email)
    }

    /// Identity from a graph `me` profile: `displayName`, then `mail` or `userPrincipalName`.
    pub fn from_graph_profile(profile: &Value) -> Self {
        Self {
            display_name: non_empty_str(profile, "displayName")
                .unwrap_or(UNKNOWN_USER)
                .to_string(),
            email: non_empty_str(profile, "mail")
                .or_else(|| non_empty_str(profile, "userPrincipalName"))
                .map(str::to_string),
        }
    }
}

#[derive(Debug, Error)]
pub enum PrincipalError {
    #[error("invalid base64 in client principal: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("client principal is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("client principal is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("client principal must be a JSON object")]
    NotAnObject,
}

/// Decode the platform-injected principal: base64 → UTF-8 → JSON object with
/// `name` and optional `email`.
pub fn decode_client_principal(encoded: &str) -> Result<UserIdentity, PrincipalError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD.decode(compact)?;
    let text = String::from_utf8(bytes)?;
    let principal: Value = serde_json::from_str(&text)?;
    if !principal.is_object() {
        return Err(PrincipalError::NotAnObject);
    }
    Ok(UserIdentity {
        display_name: principal
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_USER)
            .to_string(),
        email: non_empty_str(&principal, "email").map(str::to_string),
    })
}

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
