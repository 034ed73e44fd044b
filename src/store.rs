//! Owner-scoped CRUD over the `threads` and `messages` tables.
//!
//! Every operation that touches a thread or its messages filters by the owning
//! user. A thread owned by someone else is reported as absent, so callers
//! cannot distinguish "does not exist" from "not yours".

use crate::db::DbPool;
use crate::rows::{MessageRow, NewMessage, ThreadRow};
use crate::types::{now_rfc3339, ParleyError, Result, Role, ThreadId, UserId};
use serde_json::Value;

const THREAD_COLUMNS: &str = "id, user_id, name, metadata, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, thread_id, role, content, component_state, additional_context, \
     component, tool_call_request, tool_calls, tool_call_id, parent_message_id, reasoning, \
     reasoning_duration_ms, error, is_cancelled, metadata, created_at";

pub async fn list_threads(pool: &DbPool, user: &UserId) -> Result<Vec<ThreadRow>> {
    let rows = sqlx::query_as::<_, ThreadRow>(&format!(
        "SELECT {THREAD_COLUMNS} FROM threads WHERE user_id = ?1 ORDER BY updated_at DESC"
    ))
    .bind(&user.0)
    .fetch_all(pool)
    .await
    .map_err(ParleyError::Database)?;
    Ok(rows)
}

pub async fn get_thread(
    pool: &DbPool,
    user: &UserId,
    thread_id: &ThreadId,
) -> Result<Option<ThreadRow>> {
    let row = sqlx::query_as::<_, ThreadRow>(&format!(
        "SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1 AND user_id = ?2"
    ))
    .bind(&thread_id.0)
    .bind(&user.0)
    .fetch_optional(pool)
    .await
    .map_err(ParleyError::Database)?;
    Ok(row)
}

pub async fn create_thread(pool: &DbPool, user: &UserId) -> Result<ThreadRow> {
    let id = ThreadId::generate();
    let now = now_rfc3339();
    sqlx::query(
        "INSERT INTO threads (id, user_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
    )
    .bind(&id.0)
    .bind(&user.0)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(ParleyError::Database)?;

    Ok(ThreadRow {
        id: id.0,
        user_id: user.0.clone(),
        name: None,
        metadata: None,
        created_at: now.clone(),
        updated_at: now,
    })
}

#[derive(Debug, Default)]
pub struct ThreadPatch {
    pub name: Option<String>,
    pub metadata: Option<Value>,
}

impl ThreadPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.metadata.is_none()
    }
}

pub async fn update_thread(
    pool: &DbPool,
    user: &UserId,
    thread_id: &ThreadId,
    patch: &ThreadPatch,
) -> Result<Option<ThreadRow>> {
    if patch.is_empty() {
        return Err(ParleyError::Validation("No valid fields to update".to_string()).into());
    }

    let result = sqlx::query(
        "UPDATE threads SET name = COALESCE(?1, name), metadata = COALESCE(?2, metadata), \
         updated_at = ?3 WHERE id = ?4 AND user_id = ?5",
    )
    .bind(&patch.name)
    .bind(patch.metadata.as_ref().map(|m| m.to_string()))
    .bind(now_rfc3339())
    .bind(&thread_id.0)
    .bind(&user.0)
    .execute(pool)
    .await
    .map_err(ParleyError::Database)?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    get_thread(pool, user, thread_id).await
}

pub async fn rename_thread(
    pool: &DbPool,
    user: &UserId,
    thread_id: &ThreadId,
    name: &str,
) -> Result<Option<ThreadRow>> {
    update_thread(
        pool,
        user,
        thread_id,
        &ThreadPatch {
            name: Some(name.to_string()),
            metadata: None,
        },
    )
    .await
}

/// Scoped delete. Messages cascade via the foreign key.
pub async fn delete_thread(pool: &DbPool, user: &UserId, thread_id: &ThreadId) -> Result<bool> {
    let result = sqlx::query("DELETE FROM threads WHERE id = ?1 AND user_id = ?2")
        .bind(&thread_id.0)
        .bind(&user.0)
        .execute(pool)
        .await
        .map_err(ParleyError::Database)?;
    Ok(result.rows_affected() > 0)
}

/// Messages in creation order. `None` when the thread is absent or not owned.
pub async fn list_messages(
    pool: &DbPool,
    user: &UserId,
    thread_id: &ThreadId,
) -> Result<Option<Vec<MessageRow>>> {
    if get_thread(pool, user, thread_id).await?.is_none() {
        return Ok(None);
    }

    let rows = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY created_at ASC"
    ))
    .bind(&thread_id.0)
    .fetch_all(pool)
    .await
    .map_err(ParleyError::Database)?;
    Ok(Some(rows))
}

pub async fn insert_message_row(pool: &DbPool, row: &MessageRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO messages (id, thread_id, role, content, component_state, additional_context, \
         component, tool_call_request, tool_calls, tool_call_id, parent_message_id, reasoning, \
         reasoning_duration_ms, error, is_cancelled, metadata, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
    )
    .bind(&row.id)
    .bind(&row.thread_id)
    .bind(&row.role)
    .bind(&row.content)
    .bind(&row.component_state)
    .bind(&row.additional_context)
    .bind(&row.component)
    .bind(&row.tool_call_request)
    .bind(&row.tool_calls)
    .bind(&row.tool_call_id)
    .bind(&row.parent_message_id)
    .bind(&row.reasoning)
    .bind(row.reasoning_duration_ms)
    .bind(&row.error)
    .bind(row.is_cancelled)
    .bind(&row.metadata)
    .bind(&row.created_at)
    .execute(pool)
    .await
    .map_err(ParleyError::Database)?;
    Ok(())
}

/// Appends one message to an owned thread and touches the thread's
/// `updated_at`. `None` when the thread is absent or not owned.
pub async fn append_message(
    pool: &DbPool,
    user: &UserId,
    thread_id: &ThreadId,
    msg: &NewMessage,
) -> Result<Option<MessageRow>> {
    if !msg.has_content() {
        return Err(ParleyError::Validation("Message content is required".to_string()).into());
    }
    if get_thread(pool, user, thread_id).await?.is_none() {
        return Ok(None);
    }

    let row = crate::rows::new_message_to_row(msg, &thread_id.0);
    insert_message_row(pool, &row).await?;
    touch_thread(pool, thread_id).await?;
    Ok(Some(row))
}

/// Shallow merge of caller-supplied keys over the message's component state.
/// Read-modify-write; new keys overwrite old ones. `None` when the thread or
/// message is absent or not owned.
pub async fn merge_component_state(
    pool: &DbPool,
    user: &UserId,
    thread_id: &ThreadId,
    message_id: &str,
    patch: &serde_json::Map<String, Value>,
) -> Result<Option<MessageRow>> {
    if get_thread(pool, user, thread_id).await?.is_none() {
        return Ok(None);
    }

    let current = sqlx::query_as::<_, MessageRow>(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND thread_id = ?2"
    ))
    .bind(message_id)
    .bind(&thread_id.0)
    .fetch_optional(pool)
    .await
    .map_err(ParleyError::Database)?;

    let Some(current) = current else {
        return Ok(None);
    };

    let mut state = current
        .component_state
        .as_deref()
        .and_then(|s| serde_json::from_str::<Value>(s).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    for (k, v) in patch {
        state.insert(k.clone(), v.clone());
    }
    let merged = Value::Object(state).to_string();

    sqlx::query("UPDATE messages SET component_state = ?1 WHERE id = ?2")
        .bind(&merged)
        .bind(message_id)
        .execute(pool)
        .await
        .map_err(ParleyError::Database)?;

    let mut updated = current;
    updated.component_state = Some(merged);
    Ok(Some(updated))
}

/// Terminal write batch for one stream: upsert every accumulated message,
/// then advance the thread's `updated_at`.
pub async fn upsert_message_rows(pool: &DbPool, rows: &[MessageRow]) -> Result<()> {
    for row in rows {
        sqlx::query(
            "INSERT OR REPLACE INTO messages (id, thread_id, role, content, component_state, \
             additional_context, component, tool_call_request, tool_calls, tool_call_id, \
             parent_message_id, reasoning, reasoning_duration_ms, error, is_cancelled, metadata, \
             created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )
        .bind(&row.id)
        .bind(&row.thread_id)
        .bind(&row.role)
        .bind(&row.content)
        .bind(&row.component_state)
        .bind(&row.additional_context)
        .bind(&row.component)
        .bind(&row.tool_call_request)
        .bind(&row.tool_calls)
        .bind(&row.tool_call_id)
        .bind(&row.parent_message_id)
        .bind(&row.reasoning)
        .bind(row.reasoning_duration_ms)
        .bind(&row.error)
        .bind(row.is_cancelled)
        .bind(&row.metadata)
        .bind(&row.created_at)
        .execute(pool)
        .await
        .map_err(ParleyError::Database)?;
    }
    Ok(())
}

pub async fn touch_thread(pool: &DbPool, thread_id: &ThreadId) -> Result<()> {
    sqlx::query("UPDATE threads SET updated_at = ?1 WHERE id = ?2")
        .bind(now_rfc3339())
        .bind(&thread_id.0)
        .execute(pool)
        .await
        .map_err(ParleyError::Database)?;
    Ok(())
}

/// Seed text for a generated thread name: the first user message's text parts,
/// joined and trimmed.
pub fn first_user_text(rows: &[MessageRow]) -> Option<String> {
    for row in rows {
        if Role::parse(&row.role) != Some(Role::User) {
            continue;
        }
        let content: Value = match serde_json::from_str(&row.content) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let text = match &content {
            Value::String(s) => s.trim().to_string(),
            Value::Array(parts) => parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string(),
            _ => String::new(),
        };
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_row(content: &str) -> MessageRow {
        MessageRow {
            id: "m".into(),
            thread_id: "t".into(),
            role: "user".into(),
            content: content.into(),
            component_state: None,
            additional_context: None,
            component: None,
            tool_call_request: None,
            tool_calls: None,
            tool_call_id: None,
            parent_message_id: None,
            reasoning: None,
            reasoning_duration_ms: None,
            error: None,
            is_cancelled: false,
            metadata: None,
            created_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn first_user_text_joins_text_parts() {
        let rows = vec![user_row(
            r#"[{"type":"text","text":"plan my"},{"type":"image"},{"type":"text","text":"week"}]"#,
        )];
        assert_eq!(first_user_text(&rows), Some("plan my week".to_string()));
    }

    #[test]
    fn first_user_text_skips_non_user_and_empty_messages() {
        let mut assistant = user_row("\"reply\"");
        assistant.role = "assistant".into();
        let rows = vec![assistant, user_row("\"  \""), user_row("\"hello\"")];
        assert_eq!(first_user_text(&rows), Some("hello".to_string()));
    }

    #[test]
    fn empty_patch_is_rejected() {
        assert!(ThreadPatch::default().is_empty());
        assert!(!ThreadPatch {
            name: Some("n".into()),
            metadata: None
        }
        .is_empty());
    }
}
