use bytes::Bytes;
use futures_util::StreamExt;
use parley::bridge::{relay, TurnContext};
use parley::db::{init_db, DbPool};
use parley::store;
use parley::types::{ThreadId, UserId};
use tokio::sync::mpsc;

async fn setup() -> (DbPool, tempfile::NamedTempFile, UserId, ThreadId) {
    let file = tempfile::NamedTempFile::new().expect("temp db file");
    let pool = init_db(file.path()).await.expect("init db");
    let user = UserId("user-a".to_string());
    let thread = store::create_thread(&pool, &user).await.expect("create thread");
    (pool, file, user, ThreadId(thread.id))
}

fn chunks(parts: &[&str]) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Unpin
{
    futures_util::stream::iter(
        parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect::<Vec<_>>(),
    )
}

async fn run_relay<S>(stream: S, ctx: TurnContext, pool: &DbPool) -> Vec<String>
where
    S: futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(64);
    let handle = tokio::spawn(relay(stream, ctx, pool.clone(), tx));

    let mut out = Vec::new();
    while let Some(bytes) = rx.recv().await {
        out.push(String::from_utf8(bytes.to_vec()).expect("utf8 output"));
    }
    handle.await.expect("relay task");
    out
}

async fn message_count(pool: &DbPool, thread_id: &ThreadId) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE thread_id = ?1")
        .bind(&thread_id.0)
        .fetch_one(pool)
        .await
        .expect("count messages")
}

async fn thread_updated_at(pool: &DbPool, thread_id: &ThreadId) -> String {
    sqlx::query_scalar("SELECT updated_at FROM threads WHERE id = ?1")
        .bind(&thread_id.0)
        .fetch_one(pool)
        .await
        .expect("thread updated_at")
}

#[tokio::test]
async fn repeated_chunks_persist_one_row_and_sentinel_comes_last() {
    let (pool, _file, user, thread_id) = setup().await;

    // Two chunks refine the same upstream message id; the second line arrives
    // split across two read chunks mid-string.
    let stream = chunks(&[
        "data: {\"responseMessageDto\":{\"id\":\"u1\",\"role\":\"assistant\",\"content\":\"h\"}}\n",
        "data: {\"responseMessageDto\":{\"id\":\"u1\",\"role\":\"assistant\",\"content\":\"h\u{00e9}",
        "llo\"}}\ndata: DONE\n",
    ]);

    let out = run_relay(stream, TurnContext::new(user, thread_id.clone()), &pool).await;

    assert_eq!(out.len(), 3);
    assert_eq!(out.last().map(String::as_str), Some("data: DONE\n"));
    assert!(!out[0].contains("\"u1\""), "upstream id must be remapped");
    assert!(!out[1].contains("\"u1\""));
    assert!(out[1].contains("héllo"));

    // Both forwarded chunks carry the same local id.
    let first: serde_json::Value =
        serde_json::from_str(out[0].trim_start_matches("data: ")).expect("first chunk json");
    let second: serde_json::Value =
        serde_json::from_str(out[1].trim_start_matches("data: ")).expect("second chunk json");
    assert_eq!(
        first["responseMessageDto"]["id"],
        second["responseMessageDto"]["id"]
    );
    assert_eq!(second["responseMessageDto"]["threadId"], thread_id.0);

    // One upserted row, holding the latest state.
    assert_eq!(message_count(&pool, &thread_id).await, 1);
    let content: String = sqlx::query_scalar("SELECT content FROM messages WHERE thread_id = ?1")
        .bind(&thread_id.0)
        .fetch_one(&pool)
        .await
        .expect("content");
    assert!(content.contains("héllo"));
}

#[tokio::test]
async fn malformed_json_lines_are_skipped_not_fatal() {
    let (pool, _file, user, thread_id) = setup().await;

    let stream = chunks(&[
        "data: {not json at all\n",
        "data: {\"responseMessageDto\":{\"id\":\"u1\",\"role\":\"assistant\",\"content\":\"ok\"}}\n",
        "data: DONE\n",
    ]);

    let out = run_relay(stream, TurnContext::new(user, thread_id.clone()), &pool).await;

    // The malformed line is dropped; the stream keeps going.
    assert_eq!(out.len(), 2);
    assert!(out[0].contains("\"ok\""));
    assert_eq!(out.last().map(String::as_str), Some("data: DONE\n"));
    assert_eq!(message_count(&pool, &thread_id).await, 1);
}

#[tokio::test]
async fn upstream_error_lines_pass_through_verbatim() {
    let (pool, _file, user, thread_id) = setup().await;

    let stream = chunks(&["error: upstream overloaded\n", "data: DONE\n"]);
    let out = run_relay(stream, TurnContext::new(user, thread_id.clone()), &pool).await;

    assert_eq!(out[0], "error: upstream overloaded\n");
    assert_eq!(out.last().map(String::as_str), Some("data: DONE\n"));
}

#[tokio::test]
async fn empty_lines_and_crlf_are_tolerated() {
    let (pool, _file, user, thread_id) = setup().await;

    let stream = chunks(&[
        "\r\n\r\n",
        "data: {\"responseMessageDto\":{\"id\":\"u1\",\"role\":\"assistant\",\"content\":\"x\"}}\r\n",
        "data: DONE\r\n",
    ]);
    let out = run_relay(stream, TurnContext::new(user, thread_id.clone()), &pool).await;

    assert_eq!(out.len(), 2);
    assert_eq!(out.last().map(String::as_str), Some("data: DONE\n"));
}

#[tokio::test]
async fn cancellation_mid_stream_still_persists_accumulated_state() {
    let (pool, _file, user, thread_id) = setup().await;
    let before = thread_updated_at(&pool, &thread_id).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    // Upstream would keep streaming forever; the client hangs up after the
    // first chunk.
    let stream = chunks(&[
        "data: {\"responseMessageDto\":{\"id\":\"u1\",\"role\":\"assistant\",\"content\":\"partial\"}}\n",
        "data: {\"responseMessageDto\":{\"id\":\"u1\",\"role\":\"assistant\",\"content\":\"more\"}}\n",
    ])
    .chain(futures_util::stream::pending());

    let (tx, mut rx) = mpsc::channel::<Bytes>(1);
    let handle = tokio::spawn(relay(
        Box::pin(stream),
        TurnContext::new(user, thread_id.clone()),
        pool.clone(),
        tx,
    ));

    let first = rx.recv().await.expect("first forwarded line");
    assert!(String::from_utf8_lossy(&first).contains("partial"));
    drop(rx);

    handle.await.expect("relay task exits after cancellation");

    assert_eq!(message_count(&pool, &thread_id).await, 1);
    let after = thread_updated_at(&pool, &thread_id).await;
    assert!(after > before, "thread updated_at must advance on cancel");
}

#[tokio::test]
async fn eof_without_sentinel_still_persists_once() {
    let (pool, _file, user, thread_id) = setup().await;

    let stream = chunks(&[
        "data: {\"responseMessageDto\":{\"id\":\"u1\",\"role\":\"assistant\",\"content\":\"cut\"}}\n",
    ]);
    let out = run_relay(stream, TurnContext::new(user, thread_id.clone()), &pool).await;

    assert!(out.iter().all(|l| l != "data: DONE\n"));
    assert_eq!(message_count(&pool, &thread_id).await, 1);
}

#[tokio::test]
async fn finalize_is_one_shot() {
    let (pool, _file, user, thread_id) = setup().await;

    let mut ctx = TurnContext::new(user, thread_id.clone());
    let mut chunk = serde_json::json!({
        "responseMessageDto": {"id": "u1", "role": "assistant", "content": "hi"}
    });
    ctx.absorb_chunk(&mut chunk);

    ctx.finalize(&pool).await.expect("first finalize");
    assert_eq!(message_count(&pool, &thread_id).await, 1);

    // Clear the table; a second finalize must not write again.
    sqlx::query("DELETE FROM messages WHERE thread_id = ?1")
        .bind(&thread_id.0)
        .execute(&pool)
        .await
        .expect("clear messages");
    ctx.finalize(&pool).await.expect("second finalize");
    assert_eq!(message_count(&pool, &thread_id).await, 0);
}

#[tokio::test]
async fn streamed_message_with_unknown_role_is_skipped_at_persist() {
    let (pool, _file, user, thread_id) = setup().await;

    let stream = chunks(&[
        "data: {\"responseMessageDto\":{\"id\":\"u1\",\"role\":\"robot\",\"content\":\"?\"}}\n",
        "data: {\"responseMessageDto\":{\"id\":\"u2\",\"role\":\"assistant\",\"content\":\"ok\"}}\n",
        "data: DONE\n",
    ]);
    let out = run_relay(stream, TurnContext::new(user, thread_id.clone()), &pool).await;

    // Both chunks are still forwarded; only the valid one is persisted.
    assert_eq!(out.len(), 3);
    assert_eq!(message_count(&pool, &thread_id).await, 1);
    let role: String = sqlx::query_scalar("SELECT role FROM messages WHERE thread_id = ?1")
        .bind(&thread_id.0)
        .fetch_one(&pool)
        .await
        .expect("role");
    assert_eq!(role, "assistant");
}
