use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-parley-request-id";

/// Global panic hook that routes panics through tracing before the default
/// hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Stamps every request with a generated id and wraps downstream handling in
/// a span carrying it.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    next.run(req).instrument(span).await
}

/// Counters for one relayed stream, logged once at stream end.
#[derive(Default)]
pub struct StreamMetric {
    pub chunks: usize,
    pub bytes_in: usize,
    pub data_lines: usize,
    pub bytes_out: usize,
    pub malformed_lines: usize,
    pub error_lines: usize,
    pub sentinels: usize,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes_in += len;
    }

    pub fn record_data(&mut self, forwarded_len: usize) {
        self.data_lines += 1;
        self.bytes_out += forwarded_len;
    }

    pub fn record_malformed(&mut self) {
        self.malformed_lines += 1;
    }

    pub fn record_error_line(&mut self) {
        self.error_lines += 1;
    }

    pub fn record_sentinel(&mut self) {
        self.sentinels += 1;
    }

    pub fn log_summary(&self, thread_short: &str, persisted_messages: usize) {
        info!(
            target: "relay",
            "[STREAM END] Thread: {} | Chunks: {} ({} bytes) | Data lines: {} ({} bytes out) | \
             Malformed: {} | Errors: {} | Sentinel: {} | Messages persisted: {}",
            thread_short,
            self.chunks,
            self.bytes_in,
            self.data_lines,
            self.bytes_out,
            self.malformed_lines,
            self.error_lines,
            self.sentinels > 0,
            persisted_messages
        );
    }
}
