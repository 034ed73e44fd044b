use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ThreadId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for ThreadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ThreadId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        prefix_chars(&self.0, 8)
    }
}

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Char-safe prefix: never slices inside a multi-byte character.
pub fn prefix_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// The four roles a persisted message may carry. Anything else is rejected at
/// the boundary before a row is written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("Missing PARLEY_API_KEY. Set it in the server environment (never ship it to the browser).")]
    MissingCredential,

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

/// A `ParleyError` plus the span trace active where it was observed. The trace
/// goes to the server log, never into a response body.
#[derive(Debug)]
pub struct ObservedError {
    pub inner: ParleyError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ParleyError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg) = match &self.inner {
            ParleyError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ParleyError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ParleyError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            ParleyError::Upstream(s, m) => (*s, m.clone()),
            ParleyError::Network(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
            ParleyError::Database(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ParleyError::Serialization(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ParleyError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ParleyError::MissingCredential => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.inner.to_string())
            }
            ParleyError::Internal(m, _) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };

        if status.is_server_error() {
            tracing::error!("Request failed ({}): {}\n{}", status, msg, self.span_trace);
        }

        (status, axum::Json(serde_json::json!({ "error": msg }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_serde() {
        let r: Role = serde_json::from_str("\"assistant\"").expect("valid role");
        assert_eq!(r, Role::Assistant);
        assert_eq!(serde_json::to_string(&r).expect("serialize"), "\"assistant\"");
    }

    #[test]
    fn unknown_role_is_rejected() {
        let r: std::result::Result<Role, _> = serde_json::from_str("\"developer\"");
        assert!(r.is_err());
    }

    #[test]
    fn prefix_chars_respects_char_boundaries() {
        assert_eq!(prefix_chars("héllo", 2), "hé");
        assert_eq!(prefix_chars("ab", 8), "ab");
    }
}
