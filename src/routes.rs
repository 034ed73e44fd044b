//! Inbound HTTP surface. Authentication runs before any route logic; a fixed
//! set of thread/message operations is dispatched here, and everything else
//! outside the `/threads` prefix falls through to a generic reverse proxy.

use crate::auth::Caller;
use crate::bridge::{self, TurnContext};
use crate::constants::{PROJECT_ID, PROJECT_NAME, THREAD_NAME_MAX_CHARS};
use crate::rows::{self, NewMessage};
use crate::store::{self, ThreadPatch};
use crate::types::{prefix_chars, ParleyError, Result, ThreadId};
use crate::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

pub fn router(state: Arc<AppState>) -> Router {
    let max_body = state.args.max_body_size;

    // Everything behind authentication: the fixed thread/message surface plus
    // the reverse-proxy fallback. Health probes stay outside.
    let api = Router::new()
        .route("/projects", get(project_probe).fallback(reverse_proxy))
        .route(
            "/threads/project/*rest",
            get(list_threads).fallback(threads_not_found),
        )
        .route(
            "/threads/advancestream",
            post(advance_stream_new).fallback(threads_not_found),
        )
        .route(
            "/threads/:id",
            get(retrieve_thread)
                .put(update_thread)
                .delete(delete_thread)
                .fallback(threads_not_found),
        )
        .route(
            "/threads/:id/generate-name",
            post(generate_name).fallback(threads_not_found),
        )
        .route(
            "/threads/:id/cancel",
            post(cancel_thread).fallback(threads_not_found),
        )
        .route(
            "/threads/:id/advancestream",
            post(advance_stream_continue).fallback(threads_not_found),
        )
        .route(
            "/threads/:id/messages",
            get(list_messages)
                .post(append_message)
                .fallback(threads_not_found),
        )
        .route(
            "/threads/:id/messages/:msg_id/component-state",
            put(merge_component_state).fallback(threads_not_found),
        )
        .fallback(reverse_proxy)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_identity,
        ));

    Router::new()
        .route("/health", get(crate::health::liveness))
        .route("/readyz", get(crate::health::readiness))
        .merge(api)
        .layer(middleware::from_fn(crate::logging::request_id_middleware))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

fn parse_body(bytes: &Bytes) -> Result<Value> {
    serde_json::from_slice(bytes)
        .map_err(|_| ParleyError::Validation("Invalid JSON body".to_string()).into())
}

async fn threads_not_found() -> Response {
    crate::types::ObservedError::from(ParleyError::NotFound).into_response()
}

/// Capability probe: the single logical project plus the caller's id.
async fn project_probe(Extension(caller): Extension<Caller>) -> Json<Value> {
    Json(json!({
        "id": PROJECT_ID,
        "isTokenRequired": false,
        "name": PROJECT_NAME,
        "providerType": "llm",
        "userId": caller.user_id.0,
    }))
}

async fn list_threads(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Value>> {
    let threads = store::list_threads(&state.db, &caller.user_id).await?;
    let items: Vec<Value> = threads
        .iter()
        .map(|row| json!(rows::thread_to_wire(row)))
        .collect();
    let total = items.len();
    Ok(Json(json!({
        "items": items,
        "total": total,
        "count": total,
    })))
}

async fn retrieve_thread(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let thread_id = ThreadId(id);
    let thread = store::get_thread(&state.db, &caller.user_id, &thread_id)
        .await?
        .ok_or(ParleyError::NotFound)?;
    let messages = store::list_messages(&state.db, &caller.user_id, &thread_id)
        .await?
        .unwrap_or_default();

    let mut body = serde_json::to_value(rows::thread_to_wire(&thread))
        .map_err(ParleyError::Serialization)?;
    body["messages"] = Value::Array(
        messages
            .iter()
            .map(|row| json!(rows::message_to_wire(row)))
            .collect(),
    );
    Ok(Json(body))
}

async fn update_thread(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    bytes: Bytes,
) -> Result<Json<Value>> {
    let body = parse_body(&bytes)?;
    let patch = ThreadPatch {
        name: body
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        metadata: body.get("metadata").filter(|v| v.is_object()).cloned(),
    };

    let thread = store::update_thread(&state.db, &caller.user_id, &ThreadId(id), &patch)
        .await?
        .ok_or(ParleyError::NotFound)?;
    Ok(Json(json!(rows::thread_to_wire(&thread))))
}

async fn delete_thread(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    if !store::delete_thread(&state.db, &caller.user_id, &ThreadId(id)).await? {
        return Err(ParleyError::NotFound.into());
    }
    Ok(Json(json!(true)))
}

/// Derives a display name from the first user message's text.
async fn generate_name(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let thread_id = ThreadId(id);
    let messages = store::list_messages(&state.db, &caller.user_id, &thread_id)
        .await?
        .ok_or(ParleyError::NotFound)?;

    let name = match store::first_user_text(&messages) {
        Some(seed) => {
            if seed.chars().count() > THREAD_NAME_MAX_CHARS {
                format!("{}…", prefix_chars(&seed, THREAD_NAME_MAX_CHARS))
            } else {
                seed
            }
        }
        None => format!("Thread {}", thread_id.short()),
    };

    let thread = store::rename_thread(&state.db, &caller.user_id, &thread_id, &name)
        .await?
        .ok_or(ParleyError::NotFound)?;
    Ok(Json(json!(rows::thread_to_wire(&thread))))
}

/// Generation cancellation is client-driven (the caller tears down its stream
/// and the bridge persists what accumulated), so this is an existence check
/// plus acknowledgement.
async fn cancel_thread(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    store::get_thread(&state.db, &caller.user_id, &ThreadId(id))
        .await?
        .ok_or(ParleyError::NotFound)?;
    Ok(Json(json!(true)))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let messages = store::list_messages(&state.db, &caller.user_id, &ThreadId(id))
        .await?
        .ok_or(ParleyError::NotFound)?;
    Ok(Json(Value::Array(
        messages
            .iter()
            .map(|row| json!(rows::message_to_wire(row)))
            .collect(),
    )))
}

async fn append_message(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    bytes: Bytes,
) -> Result<Json<Value>> {
    let body = parse_body(&bytes)?;
    let msg: NewMessage = serde_json::from_value(body)
        .map_err(|e| ParleyError::Validation(format!("Invalid message: {}", e)))?;

    let row = store::append_message(&state.db, &caller.user_id, &ThreadId(id), &msg)
        .await?
        .ok_or(ParleyError::NotFound)?;
    Ok(Json(json!(rows::message_to_wire(&row))))
}

async fn merge_component_state(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((id, msg_id)): Path<(String, String)>,
    bytes: Bytes,
) -> Result<Json<Value>> {
    let body = parse_body(&bytes)?;
    let patch = body
        .get("state")
        .and_then(|v| v.as_object())
        .cloned()
        .ok_or_else(|| ParleyError::Validation("Missing state object".to_string()))?;

    let row = store::merge_component_state(&state.db, &caller.user_id, &ThreadId(id), &msg_id, &patch)
        .await?
        .ok_or(ParleyError::NotFound)?;
    Ok(Json(json!(rows::message_to_wire(&row))))
}

async fn advance_stream_new(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    bytes: Bytes,
) -> Result<Response> {
    run_advance_stream(state, caller, None, bytes).await
}

async fn advance_stream_continue(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    bytes: Bytes,
) -> Result<Response> {
    run_advance_stream(state, caller, Some(ThreadId(id)), bytes).await
}

/// One streamed turn: resolve (or create and seed) the thread, durably append
/// the caller's message, open the upstream stream, and hand the byte stream to
/// the bridge. See `bridge::relay` for the termination semantics.
async fn run_advance_stream(
    state: Arc<AppState>,
    caller: Caller,
    thread_id: Option<ThreadId>,
    bytes: Bytes,
) -> Result<Response> {
    let body = parse_body(&bytes)?;
    let Some(obj) = body.as_object() else {
        return Err(ParleyError::Validation("Invalid JSON body".to_string()).into());
    };
    let Some(msg_value) = obj.get("messageToAppend") else {
        return Err(ParleyError::Validation("Invalid JSON body".to_string()).into());
    };
    let message_to_append: NewMessage = serde_json::from_value(msg_value.clone())
        .map_err(|e| ParleyError::Validation(format!("Invalid messageToAppend: {}", e)))?;
    if !message_to_append.has_content() {
        return Err(ParleyError::Validation("Message content is required".to_string()).into());
    }

    // Seeds are validated before any row is created.
    let seeds: Vec<NewMessage> = match obj.get("initialMessages").and_then(|v| v.as_array()) {
        Some(initial) => initial
            .iter()
            .map(|entry| {
                serde_json::from_value(entry.clone()).map_err(|e| {
                    ParleyError::Validation(format!("Invalid initial message: {}", e))
                })
            })
            .collect::<std::result::Result<_, _>>()?,
        None => Vec::new(),
    };

    let thread_id = match thread_id {
        Some(id) => {
            store::get_thread(&state.db, &caller.user_id, &id)
                .await?
                .ok_or(ParleyError::NotFound)?;
            id
        }
        None => {
            let thread = store::create_thread(&state.db, &caller.user_id).await?;
            let id = ThreadId(thread.id);
            for seed in &seeds {
                let row = rows::new_message_to_row(seed, &id.0);
                store::insert_message_row(&state.db, &row).await?;
            }
            id
        }
    };

    // History as it stood before this turn's message.
    let history = store::list_messages(&state.db, &caller.user_id, &thread_id)
        .await?
        .ok_or(ParleyError::NotFound)?;
    let initial_messages: Vec<Value> = history.iter().map(rows::message_to_history_entry).collect();

    // The caller's message is durable before upstream is contacted.
    store::append_message(&state.db, &caller.user_id, &thread_id, &message_to_append)
        .await?
        .ok_or(ParleyError::NotFound)?;

    let mut compute = obj.clone();
    compute.insert("contextKey".into(), Value::String(caller.user_id.0.clone()));
    compute.insert("initialMessages".into(), Value::Array(initial_messages));
    compute.insert("messageToAppend".into(), msg_value.clone());
    compute.insert("clientTools".into(), json!([]));

    let upstream_response = state
        .upstream
        .advance_stream(&Value::Object(compute))
        .await?;

    let ctx = TurnContext::new(caller.user_id.clone(), thread_id);
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    let byte_stream = Box::pin(upstream_response.bytes_stream());
    tokio::spawn(
        bridge::relay(byte_stream, ctx, state.db.clone(), tx).instrument(tracing::Span::current()),
    );

    let body = Body::from_stream(
        ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>),
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .map_err(|e| {
            ParleyError::Internal(
                format!("Failed to build stream response: {}", e),
                tracing_error::SpanTrace::capture(),
            )
            .into()
        })
}

/// Generic passthrough for everything the router does not recognize outside
/// the `/threads` prefix. Unmatched `/threads` paths are a 404, never proxied.
async fn reverse_proxy(State(state): State<Arc<AppState>>, req: Request) -> Result<Response> {
    let path = req.uri().path().to_string();
    if path == "/threads" || path.starts_with("/threads/") {
        return Err(ParleyError::NotFound.into());
    }

    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or(path);
    let headers = req.headers().clone();
    let body = axum::body::to_bytes(req.into_body(), state.args.max_body_size)
        .await
        .map_err(|_| ParleyError::Validation("Failed to read request body".to_string()))?;

    let upstream_response = state
        .upstream
        .forward(method, &path_and_query, &headers, body)
        .await?;

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_response.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        // content-encoding is stripped so the transport layer does not decode
        // twice; framing headers are recomputed for the re-streamed body.
        if lower == "content-encoding" || lower == "content-length" || lower == "transfer-encoding"
        {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(n, v);
        }
    }

    let body = Body::from_stream(
        upstream_response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other)),
    );
    builder.body(body).map_err(|e| {
        ParleyError::Internal(
            format!("Failed to build proxy response: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into()
    })
}
