//! Caller identity. Session issuance lives in an external auth provider; this
//! module only turns a request's cookies into an opaque user id and rejects
//! requests that carry no valid identity before any route logic runs.

use crate::types::{ParleyError, Result, UserId};
use crate::AppState;
use async_trait::async_trait;
use axum::http::HeaderMap;
use std::sync::Arc;

/// The authenticated caller, inserted into request extensions by the
/// middleware below.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: UserId,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolves the request headers to a user id, or `None` when the request
    /// carries no valid identity.
    async fn resolve(&self, headers: &HeaderMap) -> Result<Option<UserId>>;
}

/// Production provider: forwards the session cookie to the auth service's
/// verification endpoint and trusts the id it returns.
pub struct RemoteVerifier {
    http: reqwest::Client,
    verify_url: String,
}

impl RemoteVerifier {
    pub fn new(http: reqwest::Client, verify_url: String) -> Self {
        Self { http, verify_url }
    }
}

#[async_trait]
impl IdentityProvider for RemoteVerifier {
    async fn resolve(&self, headers: &HeaderMap) -> Result<Option<UserId>> {
        let mut request = self.http.get(&self.verify_url);
        for header in ["cookie", "authorization"] {
            if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
                request = request.header(header, value);
            }
        }

        let response = request.send().await.map_err(ParleyError::Network)?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ParleyError::Internal(
                format!("Auth provider returned status {}", status),
                tracing_error::SpanTrace::capture(),
            )
            .into());
        }

        let body: serde_json::Value = response.json().await.map_err(ParleyError::Network)?;
        Ok(body
            .get("id")
            .and_then(|v| v.as_str())
            .map(|id| UserId(id.to_string())))
    }
}

/// Development provider: trusts a named request header as the user id. Only
/// wired up when explicitly configured; the server logs a warning at startup.
pub struct HeaderIdentity {
    header: String,
}

impl HeaderIdentity {
    pub fn new(header: String) -> Self {
        Self { header }
    }
}

#[async_trait]
impl IdentityProvider for HeaderIdentity {
    async fn resolve(&self, headers: &HeaderMap) -> Result<Option<UserId>> {
        Ok(headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| UserId(s.to_string())))
    }
}

/// Rejects unauthenticated callers with 401 before any route logic runs.
pub async fn require_identity(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    use axum::response::IntoResponse;

    match state.identity.resolve(req.headers()).await {
        Ok(Some(user_id)) => {
            req.extensions_mut().insert(Caller { user_id });
            next.run(req).await
        }
        Ok(None) => crate::types::ObservedError::from(ParleyError::Unauthorized).into_response(),
        Err(e) => {
            tracing::error!("Identity resolution failed: {}", e);
            crate::types::ObservedError::from(ParleyError::Unauthorized).into_response()
        }
    }
}
