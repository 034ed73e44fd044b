use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub database: String,
    pub upstream_credential: String,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let mut db_ok = true;
    let credential_ok = state.upstream.has_credential();

    if let Err(e) = sqlx::query("SELECT 1").fetch_one(&state.db).await {
        tracing::error!("Readiness check: DB error: {}", e);
        db_ok = false;
    }
    if !credential_ok {
        tracing::error!("Readiness check: upstream credential missing");
    }

    let ready = db_ok && credential_ok;
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" }.to_string(),
            database: if db_ok { "ok" } else { "error" }.to_string(),
            upstream_credential: if credential_ok { "ok" } else { "missing" }.to_string(),
        }),
    )
}
