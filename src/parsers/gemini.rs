use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use super::ParseOutcome;
use crate::models::{Agent, ParsedMessage, ParsedSession, Role, ToolCall, ToolResult};

// ---------------------------------------------------------------------------
// Wire format: one JSON document per chat file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatFile {
    session_id: String,
    start_time: Option<String>,
    last_updated: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessage {
    #[serde(rename = "type")]
    msg_type: String,
    timestamp: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    thoughts: Vec<serde_json::Value>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatToolCall {
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: serde_json::Value,
    result: Option<serde_json::Value>,
}

/// Parse a Gemini CLI chat file. The session id lives in the document;
/// the project comes from the classifier's directory resolution and is
/// passed through unchanged.
pub fn parse(path: &Path, project_hint: Option<&str>) -> Result<ParseOutcome> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let chat: ChatFile = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    if chat.session_id.is_empty() {
        return Ok(None);
    }

    let mut messages: Vec<ParsedMessage> = Vec::new();
    for (idx, entry) in chat.messages.iter().enumerate() {
        let role = match entry.msg_type.as_str() {
            "user" => Role::User,
            "gemini" => Role::Assistant,
            // system / error / info lines are CLI chrome
            _ => continue,
        };

        let timestamp = entry
            .timestamp
            .as_deref()
            .and_then(super::claude::parse_timestamp);

        let mut msg = ParsedMessage::text(role, entry.content.clone(), timestamp);
        msg.has_thinking = !entry.thoughts.is_empty();

        for (call_idx, call) in entry.tool_calls.iter().enumerate() {
            // Tool calls without an id still pair with their inline
            // result under a synthetic one.
            let call_id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("gemini-{idx}-{call_idx}"));
            msg.tool_calls
                .push(ToolCall::new(call_id.clone(), call.name.clone(), &call.args));
            if let Some(result) = &call.result {
                let content_length = match result {
                    serde_json::Value::String(s) => s.len() as i64,
                    other => other.to_string().len() as i64,
                };
                msg.tool_results.push(ToolResult {
                    tool_use_id: call_id,
                    content_length,
                });
            }
        }

        messages.push(msg);
    }

    if messages.is_empty() {
        return Ok(None);
    }

    let started_at = chat
        .start_time
        .as_deref()
        .and_then(super::claude::parse_timestamp)
        .or_else(|| messages.first().and_then(|m| m.timestamp));
    let ended_at = chat
        .last_updated
        .as_deref()
        .and_then(super::claude::parse_timestamp)
        .or_else(|| messages.last().and_then(|m| m.timestamp));

    let session = ParsedSession {
        id: Agent::Gemini.session_id(&chat.session_id),
        agent: Agent::Gemini,
        project: project_hint.unwrap_or_default().to_string(),
        started_at,
        ended_at,
        parent_session_id: None,
    };

    Ok(Some((session, messages)))
}
