use anyhow::{Context, Result};
use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;

use super::{ParseOutcome, project_from_cwd};
use crate::models::{Agent, ParsedMessage, ParsedSession, Role, ToolCall, ToolResult};

// ---------------------------------------------------------------------------
// Wire format: session-state event stream, one JSON object per line
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventLine {
    #[serde(rename = "type")]
    event_type: String,
    timestamp: Option<String>,
    session_id: Option<String>,
    cwd: Option<String>,
    content: Option<serde_json::Value>,
    tool_name: Option<String>,
    tool_call_id: Option<String>,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Parse a Copilot CLI session-state transcript. The file is either
/// `session-state/<uuid>.jsonl` or `session-state/<uuid>/events.jsonl`;
/// the uuid doubles as the raw session id when no `session.start` event
/// names one.
pub fn parse(path: &Path) -> Result<ParseOutcome> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut raw_id: Option<String> = None;
    let mut project = String::new();
    let mut messages: Vec<ParsedMessage> = Vec::new();

    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        let event: EventLine = match serde_json::from_str(&line) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("skipping malformed line in {}: {e}", path.display());
                continue;
            }
        };

        let timestamp = event
            .timestamp
            .as_deref()
            .and_then(super::claude::parse_timestamp);

        match event.event_type.as_str() {
            "session.start" => {
                if raw_id.is_none() {
                    raw_id = event.session_id;
                }
                if let Some(cwd) = event.cwd.as_deref() {
                    project = project_from_cwd(cwd);
                }
            }
            "user.message" => {
                messages.push(ParsedMessage::text(
                    Role::User,
                    text_of(event.content.as_ref()),
                    timestamp,
                ));
            }
            "assistant.message" => {
                messages.push(ParsedMessage::text(
                    Role::Assistant,
                    text_of(event.content.as_ref()),
                    timestamp,
                ));
            }
            "tool.invocation" => {
                let (Some(name), Some(call_id)) = (event.tool_name, event.tool_call_id) else {
                    continue;
                };
                let call = ToolCall::new(call_id, name, &event.arguments);
                // Invocations belong to the assistant turn that issued
                // them; a leading invocation gets its own carrier.
                match messages.last_mut().filter(|m| m.role == Role::Assistant) {
                    Some(last) => last.tool_calls.push(call),
                    None => {
                        let mut msg = ParsedMessage::text(Role::Assistant, String::new(), timestamp);
                        msg.tool_calls.push(call);
                        messages.push(msg);
                    }
                }
            }
            "tool.result" => {
                let Some(call_id) = event.tool_call_id else {
                    continue;
                };
                let mut msg = ParsedMessage::text(Role::User, String::new(), timestamp);
                msg.tool_results.push(ToolResult {
                    tool_use_id: call_id,
                    content_length: text_of(event.content.as_ref()).len() as i64,
                });
                messages.push(msg);
            }
            _ => {}
        }
    }

    if messages.is_empty() {
        return Ok(None);
    }

    let raw_id = raw_id.unwrap_or_else(|| id_from_layout(path));
    if raw_id.is_empty() {
        return Ok(None);
    }

    let session = ParsedSession {
        id: Agent::Copilot.session_id(&raw_id),
        agent: Agent::Copilot,
        project,
        started_at: messages.first().and_then(|m| m.timestamp),
        ended_at: messages.last().and_then(|m| m.timestamp),
        parent_session_id: None,
    };

    Ok(Some((session, messages)))
}

/// `<uuid>/events.jsonl` takes the directory name; the bare form takes
/// the file stem.
fn id_from_layout(path: &Path) -> String {
    if path.file_name().is_some_and(|n| n == "events.jsonl") {
        path.parent()
            .and_then(|p| p.file_name())
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    } else {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

fn text_of(content: Option<&serde_json::Value>) -> String {
    match content {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
