use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;
use std::sync::OnceLock;

use super::{ParseOutcome, project_from_cwd};
use crate::models::{Agent, ParsedMessage, ParsedSession, Role, ToolCall, ToolResult};

// ---------------------------------------------------------------------------
// Wire format: rollout JSONL with a session_meta line followed by items
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RolloutLine {
    timestamp: Option<String>,
    #[serde(rename = "type")]
    line_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SessionMeta {
    id: Option<String>,
    cwd: Option<String>,
    originator: Option<String>,
}

/// The standard 8-4-4-4-12 hex uuid embedded at the end of a rollout
/// filename stem.
pub fn uuid_from_stem(stem: &str) -> Option<String> {
    static UUID_RE: OnceLock<Regex> = OnceLock::new();
    let re = UUID_RE.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
            .expect("uuid regex")
    });
    re.find_iter(stem).last().map(|m| m.as_str().to_lowercase())
}

/// Parse a Codex rollout transcript.
///
/// Rollouts produced by `codex exec` have no interactive user turn and
/// are reported as non-interactive unless `include_exec` is set.
pub fn parse(path: &Path, include_exec: bool) -> Result<ParseOutcome> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut raw_id = uuid_from_stem(&stem);

    let mut project = String::new();
    let mut exec_originator = false;
    let mut messages: Vec<ParsedMessage> = Vec::new();

    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        let parsed: RolloutLine = match serde_json::from_str(&line) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("skipping malformed line in {}: {e}", path.display());
                continue;
            }
        };

        let timestamp = parsed
            .timestamp
            .as_deref()
            .and_then(super::claude::parse_timestamp);

        match parsed.line_type.as_str() {
            "session_meta" => {
                if let Ok(meta) = serde_json::from_value::<SessionMeta>(parsed.payload) {
                    if raw_id.is_none() {
                        raw_id = meta.id;
                    }
                    if let Some(cwd) = meta.cwd.as_deref() {
                        project = project_from_cwd(cwd);
                    }
                    exec_originator = meta
                        .originator
                        .as_deref()
                        .is_some_and(|o| o.contains("exec"));
                }
            }
            "response_item" => {
                if let Some(msg) = item_to_message(&parsed.payload, timestamp) {
                    messages.push(msg);
                }
            }
            _ => {}
        }
    }

    let Some(raw_id) = raw_id else {
        return Ok(None);
    };

    let has_user_turn = messages
        .iter()
        .any(|m| m.role == Role::User && !m.content.trim().is_empty());

    if messages.is_empty() || (!include_exec && (exec_originator || !has_user_turn)) {
        return Ok(None);
    }

    let session = ParsedSession {
        id: Agent::Codex.session_id(&raw_id),
        agent: Agent::Codex,
        project,
        started_at: messages.first().and_then(|m| m.timestamp),
        ended_at: messages.last().and_then(|m| m.timestamp),
        parent_session_id: None,
    };

    Ok(Some((session, messages)))
}

fn item_to_message(
    payload: &serde_json::Value,
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
) -> Option<ParsedMessage> {
    let item_type = payload.get("type").and_then(|t| t.as_str())?;

    match item_type {
        "message" => {
            let role = match payload.get("role").and_then(|r| r.as_str()) {
                Some("user") => Role::User,
                Some("assistant") => Role::Assistant,
                _ => return None,
            };
            let content = joined_text(payload.get("content"));
            Some(ParsedMessage::text(role, content, timestamp))
        }
        "reasoning" => {
            let mut msg = ParsedMessage::text(Role::Assistant, String::new(), timestamp);
            msg.has_thinking = true;
            Some(msg)
        }
        "function_call" | "local_shell_call" => {
            let name = payload
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("local_shell")
                .to_string();
            let call_id = payload.get("call_id").and_then(|c| c.as_str())?.to_string();
            // Arguments arrive as a JSON-encoded string.
            let input = payload
                .get("arguments")
                .and_then(|a| a.as_str())
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_else(|| payload.get("arguments").cloned().unwrap_or_default());

            let mut msg = ParsedMessage::text(Role::Assistant, String::new(), timestamp);
            msg.tool_calls.push(ToolCall::new(call_id, name, &input));
            Some(msg)
        }
        "function_call_output" => {
            let call_id = payload.get("call_id").and_then(|c| c.as_str())?.to_string();
            let output_len = match payload.get("output") {
                Some(serde_json::Value::String(s)) => s.len() as i64,
                Some(other) => other.to_string().len() as i64,
                None => 0,
            };
            let mut msg = ParsedMessage::text(Role::User, String::new(), timestamp);
            msg.tool_results.push(ToolResult {
                tool_use_id: call_id,
                content_length: output_len,
            });
            Some(msg)
        }
        _ => None,
    }
}

fn joined_text(content: Option<&serde_json::Value>) -> String {
    match content {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(blocks)) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect();
            parts.join("\n")
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_rollout(dir: &TempDir, name: &str, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        path
    }

    const META: &str = r#"{"timestamp":"2024-01-15T10:00:00Z","type":"session_meta","payload":{"id":"abc12345-1234-5678-9abc-def012345678","timestamp":"2024-01-15T10:00:00Z","cwd":"/home/u/backend","originator":"codex_cli_rs"}}"#;
    const USER: &str = r#"{"timestamp":"2024-01-15T10:00:01Z","type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"fix the bug"}]}}"#;
    const ASSISTANT: &str = r#"{"timestamp":"2024-01-15T10:00:09Z","type":"response_item","payload":{"type":"message","role":"assistant","content":[{"type":"output_text","text":"done"}]}}"#;

    #[test]
    fn test_uuid_from_stem() {
        assert_eq!(
            uuid_from_stem("rollout-20240115-abc12345-1234-5678-9abc-def012345678").as_deref(),
            Some("abc12345-1234-5678-9abc-def012345678"),
        );
        assert!(uuid_from_stem("rollout-20240115").is_none());
    }

    #[test]
    fn test_parse_interactive_rollout() {
        let tmp = TempDir::new().unwrap();
        let path = write_rollout(
            &tmp,
            "rollout-20240115-abc12345-1234-5678-9abc-def012345678.jsonl",
            &[META, USER, ASSISTANT],
        );

        let (session, messages) = parse(&path, false).unwrap().unwrap();
        assert_eq!(session.id, "codex:abc12345-1234-5678-9abc-def012345678");
        assert_eq!(session.project, "backend");
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_exec_rollout_needs_opt_in() {
        let exec_meta = META.replace("codex_cli_rs", "codex_exec");
        let tmp = TempDir::new().unwrap();
        let path = write_rollout(
            &tmp,
            "rollout-20240115-abc12345-1234-5678-9abc-def012345678.jsonl",
            &[&exec_meta, USER, ASSISTANT],
        );

        assert!(parse(&path, false).unwrap().is_none());
        assert!(parse(&path, true).unwrap().is_some());
    }

    #[test]
    fn test_function_call_and_output() {
        let call = r#"{"timestamp":"2024-01-15T10:00:02Z","type":"response_item","payload":{"type":"function_call","name":"shell","call_id":"call_1","arguments":"{\"command\":[\"ls\"]}"}}"#;
        let output = r#"{"timestamp":"2024-01-15T10:00:03Z","type":"response_item","payload":{"type":"function_call_output","call_id":"call_1","output":"src\ntests"}}"#;

        let tmp = TempDir::new().unwrap();
        let path = write_rollout(
            &tmp,
            "rollout-20240115-abc12345-1234-5678-9abc-def012345678.jsonl",
            &[META, USER, call, output],
        );

        let (_, messages) = parse(&path, false).unwrap().unwrap();
        let with_call = messages.iter().find(|m| !m.tool_calls.is_empty()).unwrap();
        assert_eq!(with_call.tool_calls[0].tool_use_id, "call_1");

        let with_result = messages.iter().find(|m| !m.tool_results.is_empty()).unwrap();
        assert_eq!(with_result.tool_results[0].content_length, 9);
    }

    #[test]
    fn test_no_user_turn_is_non_interactive() {
        let tmp = TempDir::new().unwrap();
        let path = write_rollout(
            &tmp,
            "rollout-20240115-abc12345-1234-5678-9abc-def012345678.jsonl",
            &[META, ASSISTANT],
        );
        assert!(parse(&path, false).unwrap().is_none());
    }
}
