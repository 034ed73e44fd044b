//! HTTP client for the upstream conversational-AI service. The credential is
//! server-held and injected here; a client-supplied key is never accepted.

use crate::constants::{ADVANCE_STREAM_PATH, UPSTREAM_KEY_HEADER};
use crate::types::{ParleyError, Result};
use axum::http::StatusCode;
use bytes::Bytes;

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    fn key(&self) -> Result<&str> {
        match self.api_key.as_deref() {
            Some(k) if !k.is_empty() => Ok(k),
            _ => Err(ParleyError::MissingCredential.into()),
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}/{}", self.base_url, path_and_query.trim_start_matches('/'))
    }

    /// Starts a streaming turn. The returned response's byte stream is owned
    /// by the caller; dropping it aborts the upstream connection, which is how
    /// client cancellation propagates.
    pub async fn advance_stream(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let key = self.key()?;
        let response = self
            .http
            .post(self.url(ADVANCE_STREAM_PATH))
            .header(UPSTREAM_KEY_HEADER, key)
            .header("accept", "text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(ParleyError::Network)?;

        if !response.status().is_success() {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let text = response.text().await.unwrap_or_default();
            let msg = if text.is_empty() {
                "Upstream request failed".to_string()
            } else {
                text
            };
            return Err(ParleyError::Upstream(status, msg).into());
        }

        Ok(response)
    }

    /// Generic passthrough used by the reverse-proxy fallback. `host` and
    /// `content-length` never cross; the credential is always injected.
    pub async fn forward(
        &self,
        method: axum::http::Method,
        path_and_query: &str,
        headers: &axum::http::HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let key = self.key()?;
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|_| ParleyError::Validation("Unsupported HTTP method".to_string()))?;

        let mut request = self.http.request(method, self.url(path_and_query));
        for (name, value) in headers {
            let lower = name.as_str().to_ascii_lowercase();
            if lower == "host" || lower == "content-length" || lower == UPSTREAM_KEY_HEADER {
                continue;
            }
            if let Ok(v) = value.to_str() {
                request = request.header(name.as_str(), v);
            }
        }
        request = request.header(UPSTREAM_KEY_HEADER, key);
        if !body.is_empty() {
            request = request.body(body);
        }

        request.send().await.map_err(|e| ParleyError::Network(e).into())
    }
}
