//! Pure conversions between storage rows and the wire shapes clients expect.
//! No I/O lives here; the store hands rows in, handlers hand DTOs out.

use crate::constants::PROJECT_ID;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ThreadRow {
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    pub metadata: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub thread_id: String,
    pub role: String,
    pub content: String,
    pub component_state: Option<String>,
    pub additional_context: Option<String>,
    pub component: Option<String>,
    pub tool_call_request: Option<String>,
    pub tool_calls: Option<String>,
    pub tool_call_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub reasoning: Option<String>,
    pub reasoning_duration_ms: Option<i64>,
    pub error: Option<String>,
    pub is_cancelled: bool,
    pub metadata: Option<String>,
    pub created_at: String,
}

/// Thread as served to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDto {
    pub id: String,
    pub created_at: String,
    pub updated_at: String,
    pub project_id: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub context_key: String,
    pub generation_stage: &'static str,
    pub status_message: &'static str,
}

/// Message as served to clients. Two fields keep their historical snake_case
/// names on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub id: String,
    pub thread_id: String,
    pub role: String,
    pub content: Value,
    pub created_at: String,
    pub component_state: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_request: Option<Value>,
    #[serde(rename = "tool_calls", skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(rename = "tool_call_id", skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(rename = "reasoningDurationMS", skip_serializing_if = "Option::is_none")]
    pub reasoning_duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_cancelled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

fn parse_json_column(raw: &Option<String>) -> Option<Value> {
    raw.as_deref().and_then(|s| serde_json::from_str(s).ok())
}

pub fn thread_to_wire(row: &ThreadRow) -> ThreadDto {
    ThreadDto {
        id: row.id.clone(),
        created_at: row.created_at.clone(),
        updated_at: row.updated_at.clone(),
        project_id: PROJECT_ID,
        name: row.name.clone(),
        metadata: parse_json_column(&row.metadata),
        context_key: row.user_id.clone(),
        generation_stage: "IDLE",
        status_message: "",
    }
}

pub fn message_to_wire(row: &MessageRow) -> MessageDto {
    MessageDto {
        id: row.id.clone(),
        thread_id: row.thread_id.clone(),
        role: row.role.clone(),
        content: serde_json::from_str(&row.content).unwrap_or(Value::Null),
        created_at: row.created_at.clone(),
        component_state: parse_json_column(&row.component_state)
            .unwrap_or_else(|| Value::Object(Default::default())),
        additional_context: parse_json_column(&row.additional_context),
        component: parse_json_column(&row.component),
        tool_call_request: parse_json_column(&row.tool_call_request),
        tool_calls: parse_json_column(&row.tool_calls),
        tool_call_id: row.tool_call_id.clone(),
        parent_message_id: row.parent_message_id.clone(),
        reasoning: parse_json_column(&row.reasoning),
        reasoning_duration_ms: row.reasoning_duration_ms,
        error: row.error.clone(),
        is_cancelled: if row.is_cancelled { Some(true) } else { None },
        metadata: parse_json_column(&row.metadata),
    }
}

/// Message history entry in the shape the upstream service consumes.
pub fn message_to_history_entry(row: &MessageRow) -> Value {
    let mut entry = serde_json::Map::new();
    entry.insert("role".into(), Value::String(row.role.clone()));
    entry.insert(
        "content".into(),
        serde_json::from_str(&row.content).unwrap_or(Value::Null),
    );
    if let Some(v) = parse_json_column(&row.additional_context) {
        entry.insert("additionalContext".into(), v);
    }
    if let Some(v) = parse_json_column(&row.component) {
        entry.insert("component".into(), v);
    }
    if let Some(v) = parse_json_column(&row.tool_call_request) {
        entry.insert("toolCallRequest".into(), v);
    }
    Value::Object(entry)
}

/// Inbound message body for appends, seeds and turn requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub role: crate::types::Role,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub additional_context: Option<Value>,
    #[serde(default)]
    pub component_state: Option<Value>,
    #[serde(default)]
    pub component: Option<Value>,
    #[serde(default)]
    pub tool_call_request: Option<Value>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl NewMessage {
    pub fn has_content(&self) -> bool {
        !self.content.is_null()
    }
}

fn json_column(v: &Option<Value>) -> Option<String> {
    v.as_ref().map(|v| v.to_string())
}

pub fn new_message_to_row(msg: &NewMessage, thread_id: &str) -> MessageRow {
    MessageRow {
        id: crate::types::MessageId::generate().0,
        thread_id: thread_id.to_string(),
        role: msg.role.as_str().to_string(),
        content: msg.content.to_string(),
        component_state: Some(
            msg.component_state
                .clone()
                .unwrap_or_else(|| Value::Object(Default::default()))
                .to_string(),
        ),
        additional_context: json_column(&msg.additional_context),
        component: json_column(&msg.component),
        tool_call_request: json_column(&msg.tool_call_request),
        tool_calls: None,
        tool_call_id: None,
        parent_message_id: None,
        reasoning: None,
        reasoning_duration_ms: None,
        error: None,
        is_cancelled: false,
        metadata: None,
        created_at: msg
            .created_at
            .clone()
            .unwrap_or_else(crate::types::now_rfc3339),
    }
}

/// A streamed final message (the upstream response DTO after id remapping)
/// flattened into a storage row. Unknown fields in the DTO are ignored; a
/// missing role is reported by the caller, not defaulted.
pub fn final_message_to_row(dto: &Value, thread_id: &str) -> Option<MessageRow> {
    let obj = dto.as_object()?;
    let id = obj.get("id")?.as_str()?.to_string();
    let role = obj.get("role")?.as_str()?;
    crate::types::Role::parse(role)?;

    let opt_json = |key: &str| -> Option<String> {
        obj.get(key).filter(|v| !v.is_null()).map(|v| v.to_string())
    };
    let opt_str = |key: &str| -> Option<String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    Some(MessageRow {
        id,
        thread_id: thread_id.to_string(),
        role: role.to_string(),
        content: obj.get("content").cloned().unwrap_or(Value::Null).to_string(),
        component_state: Some(
            obj.get("componentState")
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()))
                .to_string(),
        ),
        additional_context: opt_json("additionalContext"),
        component: opt_json("component"),
        tool_call_request: opt_json("toolCallRequest"),
        tool_calls: opt_json("tool_calls"),
        tool_call_id: opt_str("tool_call_id"),
        parent_message_id: opt_str("parentMessageId"),
        reasoning: opt_json("reasoning"),
        reasoning_duration_ms: obj.get("reasoningDurationMS").and_then(|v| v.as_i64()),
        error: opt_str("error"),
        is_cancelled: obj
            .get("isCancelled")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        metadata: opt_json("metadata"),
        created_at: opt_str("createdAt").unwrap_or_else(crate::types::now_rfc3339),
    })
}
