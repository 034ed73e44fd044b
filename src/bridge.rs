//! The stream relay and persistence bridge.
//!
//! One instance bridges one turn: it consumes the upstream event stream,
//! rewrites upstream message ids to locally generated ones, forwards events to
//! the caller in arrival order, accumulates the final state of every response
//! message, and persists the accumulated batch exactly once when the stream
//! ends — whether it ends with the sentinel, an upstream failure, or the
//! caller hanging up.

use crate::constants::{MAX_LINE_BYTES, MAX_STREAM_LINES};
use crate::db::DbPool;
use crate::framing::{
    classify_line, data_line, persistence_error_line, LineBuffer, StreamLine, DONE_LINE,
};
use crate::logging::StreamMetric;
use crate::types::{Result, ThreadId, UserId};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-request staging state. Constructed for one stream, discarded when the
/// stream ends; never shared across requests.
pub struct TurnContext {
    pub user_id: UserId,
    pub thread_id: ThreadId,
    /// First-seen upstream id -> locally generated id.
    id_map: HashMap<String, String>,
    /// Final message state keyed by local id; later chunks overwrite earlier
    /// ones (last write wins).
    pending: HashMap<String, serde_json::Value>,
    /// Local ids in first-sighting order, so the terminal batch writes in
    /// stream order.
    pending_order: Vec<String>,
    persisted: bool,
}

impl TurnContext {
    pub fn new(user_id: UserId, thread_id: ThreadId) -> Self {
        Self {
            user_id,
            thread_id,
            id_map: HashMap::new(),
            pending: HashMap::new(),
            pending_order: Vec::new(),
            persisted: false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Applies id remapping and thread stamping to a decoded data chunk.
    ///
    /// Upstream ids are not stable or unique across threads, so the first
    /// sighting of an id allocates a fresh local UUID and every later event
    /// naming that upstream id is rewritten to the same local id. The chunk's
    /// response message (when present) is recorded under its local id so the
    /// terminal persist writes the latest state of each logical message.
    pub fn absorb_chunk(&mut self, chunk: &mut serde_json::Value) {
        let Some(dto) = chunk.get_mut("responseMessageDto") else {
            return;
        };
        if !dto.is_object() {
            return;
        }

        let upstream_id = dto
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if let Some(upstream_id) = upstream_id {
            let local_id = self
                .id_map
                .entry(upstream_id)
                .or_insert_with(|| Uuid::new_v4().to_string())
                .clone();
            dto["id"] = serde_json::Value::String(local_id.clone());

            if !self.pending.contains_key(&local_id) {
                self.pending_order.push(local_id.clone());
            }
            let mut staged = dto.clone();
            staged["threadId"] = serde_json::Value::String(self.thread_id.0.clone());
            self.pending.insert(local_id, staged);
        }

        dto["threadId"] = serde_json::Value::String(self.thread_id.0.clone());
    }

    /// One-shot terminal persistence: upserts every accumulated message, then
    /// touches the thread's `updated_at`. Safe to call from both the
    /// natural-completion and the cancellation path; only the first call
    /// writes.
    pub async fn finalize(&mut self, pool: &DbPool) -> Result<()> {
        if self.persisted {
            return Ok(());
        }
        self.persisted = true;

        if !self.pending.is_empty() {
            let mut rows = Vec::with_capacity(self.pending_order.len());
            for local_id in &self.pending_order {
                let Some(dto) = self.pending.get(local_id) else {
                    continue;
                };
                match crate::rows::final_message_to_row(dto, &self.thread_id.0) {
                    Some(row) => rows.push(row),
                    None => {
                        tracing::error!(
                            thread = %self.thread_id,
                            message = %local_id,
                            "Streamed message has no usable id/role; skipping persist for this row"
                        );
                    }
                }
            }
            crate::store::upsert_message_rows(pool, &rows).await?;
        }

        crate::store::touch_thread(pool, &self.thread_id).await
    }
}

/// Pumps one upstream byte stream to the caller through `tx`.
///
/// Send failures mean the caller hung up; the loop stops and the trailing
/// `finalize` persists whatever accumulated. Dropping `upstream` on return
/// aborts the upstream connection.
pub async fn relay<S, E>(mut upstream: S, mut ctx: TurnContext, db: DbPool, tx: mpsc::Sender<Bytes>)
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut buf = LineBuffer::new();
    let mut metrics = StreamMetric::new();
    let mut line_count: usize = 0;

    'read: loop {
        // A closed channel means the caller hung up; stop reading right away
        // so the upstream connection is torn down promptly instead of at the
        // next forwarded line.
        let chunk = tokio::select! {
            biased;
            _ = tx.closed() => {
                tracing::debug!(thread = %ctx.thread_id, "Client disconnected, stopping stream");
                break 'read;
            }
            chunk = upstream.next() => match chunk {
                Some(c) => c,
                None => break 'read,
            },
        };
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(thread = %ctx.thread_id, "Upstream read error: {}", e);
                break 'read;
            }
        };
        buf.extend(&bytes);
        metrics.record_chunk(bytes.len());

        while let Some(line) = buf.next_line() {
            line_count += 1;
            if line_count > MAX_STREAM_LINES {
                tracing::error!(
                    thread = %ctx.thread_id,
                    "Stream exceeded max line limit ({})",
                    MAX_STREAM_LINES
                );
                break 'read;
            }
            if line.len() > MAX_LINE_BYTES {
                tracing::warn!(
                    thread = %ctx.thread_id,
                    "Dropping oversized stream line ({} bytes)",
                    line.len()
                );
                metrics.record_malformed();
                continue;
            }

            match classify_line(&line) {
                StreamLine::Empty => {}
                StreamLine::Done => {
                    // The caller must never observe "done" before the data is
                    // durable (or the durability failure has been surfaced),
                    // so persistence runs before the sentinel is forwarded.
                    if let Err(e) = ctx.finalize(&db).await {
                        log_persist_failure(&ctx, &e);
                        if tx
                            .send(Bytes::from(persistence_error_line(&e.to_string())))
                            .await
                            .is_err()
                        {
                            break 'read;
                        }
                    }
                    metrics.record_sentinel();
                    if tx
                        .send(Bytes::from(format!("{}\n", DONE_LINE)))
                        .await
                        .is_err()
                    {
                        break 'read;
                    }
                }
                StreamLine::ErrorPassthrough => {
                    metrics.record_error_line();
                    if tx
                        .send(Bytes::from(format!("{}\n", line.trim())))
                        .await
                        .is_err()
                    {
                        break 'read;
                    }
                }
                StreamLine::Data(payload) => {
                    let mut value: serde_json::Value = match serde_json::from_str(payload) {
                        Ok(v) => v,
                        Err(_) => {
                            // Malformed payloads are dropped, not fatal.
                            metrics.record_malformed();
                            continue;
                        }
                    };
                    ctx.absorb_chunk(&mut value);
                    let out = data_line(&value);
                    metrics.record_data(out.len());
                    if tx.send(Bytes::from(out)).await.is_err() {
                        break 'read;
                    }
                }
            }
        }
    }

    // Reached on upstream EOF without a sentinel, upstream read errors, and
    // caller cancellation alike. The latch inside finalize keeps this from
    // double-writing after a sentinel already persisted.
    if let Err(e) = ctx.finalize(&db).await {
        log_persist_failure(&ctx, &e);
        let _ = tx
            .send(Bytes::from(persistence_error_line(&e.to_string())))
            .await;
    }

    metrics.log_summary(ctx.thread_id.short(), ctx.pending_count());
}

fn log_persist_failure(ctx: &TurnContext, e: &crate::types::ObservedError) {
    tracing::error!(
        user = %ctx.user_id,
        thread = %ctx.thread_id,
        pending = ctx.pending_count(),
        "Failed to persist streamed messages: {}",
        e
    );
}
