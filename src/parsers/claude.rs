use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::BufRead;
use std::path::Path;

use super::{ParseOutcome, project_from_cwd};
use crate::models::{Agent, ParsedMessage, ParsedSession, Role, ToolCall, ToolResult};

// ---------------------------------------------------------------------------
// Wire format: one JSON object per line, tagged by `type`
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TranscriptLine {
    #[serde(rename = "user")]
    User(Envelope),
    #[serde(rename = "assistant")]
    Assistant(Envelope),
    #[serde(rename = "progress")]
    Progress(serde_json::Value),
    #[serde(rename = "system")]
    System(serde_json::Value),
    #[serde(rename = "summary")]
    Summary(serde_json::Value),
    #[serde(rename = "file-history-snapshot")]
    FileHistorySnapshot(serde_json::Value),
    #[serde(rename = "queue-operation")]
    QueueOperation(serde_json::Value),
}

/// Shared between user and assistant lines. Old transcripts omit most of
/// these fields, so everything past the payload is optional.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "parentSessionId")]
    parent_session_id: Option<String>,
    timestamp: Option<String>,
    cwd: Option<String>,
    #[serde(rename = "isSidechain")]
    is_sidechain: Option<bool>,
    message: Payload,
}

#[derive(Debug, Deserialize)]
struct Payload {
    content: ContentValue,
}

/// Content is either a plain string (user text) or an array of blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ContentValue {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {
        #[allow(dead_code)]
        thinking: String,
    },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
    },
    #[serde(rename = "image")]
    Image(serde_json::Value),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a Claude Code session transcript.
///
/// `project_hint` is the directory-derived name from discovery; the
/// per-message cwd wins when present because the directory encoding
/// mangles path separators.
pub fn parse(path: &Path, project_hint: Option<&str>) -> Result<ParseOutcome> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);

    let mut session_id: Option<String> = None;
    let mut parent_session_id: Option<String> = None;
    let mut project = String::new();
    let mut messages: Vec<ParsedMessage> = Vec::new();

    for line in reader.lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        let parsed: TranscriptLine = match serde_json::from_str(&line) {
            Ok(p) => p,
            Err(e) => {
                // Individual malformed lines are tolerated; the rest of
                // the transcript is still worth indexing.
                tracing::debug!("skipping malformed line in {}: {e}", path.display());
                continue;
            }
        };

        let (role, envelope) = match parsed {
            TranscriptLine::User(env) => (Role::User, env),
            TranscriptLine::Assistant(env) => (Role::Assistant, env),
            _ => continue,
        };

        // Sidechain turns belong to a subagent transcript, not this one.
        if envelope.is_sidechain == Some(true) {
            continue;
        }

        if session_id.is_none() {
            session_id = envelope.session_id.clone();
        }
        if parent_session_id.is_none() {
            parent_session_id = envelope.parent_session_id.clone();
        }
        if project.is_empty() {
            if let Some(cwd) = envelope.cwd.as_deref() {
                project = project_from_cwd(cwd);
            }
        }

        messages.push(envelope_to_message(role, &envelope));
    }

    if messages.is_empty() {
        return Ok(None);
    }

    // Old transcripts without a sessionId field fall back to the
    // filename stem, which is the session uuid on disk.
    let raw_id = session_id.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    });
    if raw_id.is_empty() {
        return Ok(None);
    }

    if project.is_empty() {
        project = project_hint.unwrap_or_default().to_string();
    }

    let session = ParsedSession {
        id: Agent::Claude.session_id(&raw_id),
        agent: Agent::Claude,
        project,
        started_at: messages.first().and_then(|m| m.timestamp),
        ended_at: messages.last().and_then(|m| m.timestamp),
        parent_session_id,
    };

    Ok(Some((session, messages)))
}

fn envelope_to_message(role: Role, envelope: &Envelope) -> ParsedMessage {
    let timestamp = envelope
        .timestamp
        .as_deref()
        .and_then(parse_timestamp);

    let mut msg = ParsedMessage::text(role, String::new(), timestamp);

    match &envelope.message.content {
        ContentValue::Text(text) => {
            msg.content = text.clone();
        }
        ContentValue::Blocks(blocks) => {
            let mut text_parts: Vec<&str> = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text),
                    ContentBlock::Thinking { .. } => msg.has_thinking = true,
                    ContentBlock::ToolUse { id, name, input } => {
                        msg.tool_calls
                            .push(ToolCall::new(id.clone(), name.clone(), input));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => {
                        msg.tool_results.push(ToolResult {
                            tool_use_id: tool_use_id.clone(),
                            content_length: result_content_length(content),
                        });
                    }
                    ContentBlock::Image(_) => {}
                }
            }
            msg.content = text_parts.join("\n");
        }
    }

    msg
}

/// Byte length of a tool result body. Results are either a plain string
/// or an array of content blocks with embedded text.
fn result_content_length(content: &serde_json::Value) -> i64 {
    match content {
        serde_json::Value::String(s) => s.len() as i64,
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .map(|b| {
                b.get("text")
                    .and_then(|t| t.as_str())
                    .map(|s| s.len() as i64)
                    .unwrap_or_else(|| b.to_string().len() as i64)
            })
            .sum(),
        serde_json::Value::Null => 0,
        other => other.to_string().len() as i64,
    }
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_lines(lines: &[&str]) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_minimal_user_line() {
        let f = write_lines(&[
            r#"{"type":"user","timestamp":"2024-01-01T00:00:00Z","cwd":"/home/u/p","message":{"content":"hi"}}"#,
        ]);
        let (session, messages) = parse(f.path(), None).unwrap().unwrap();

        assert_eq!(session.agent, Agent::Claude);
        assert_eq!(session.project, "p");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hi");
    }

    #[test]
    fn test_session_id_from_field_wins_over_stem() {
        let f = write_lines(&[
            r#"{"type":"user","sessionId":"abc-123","timestamp":"2024-01-01T00:00:00Z","message":{"content":"hello"}}"#,
        ]);
        let (session, _) = parse(f.path(), None).unwrap().unwrap();
        // Claude ids carry no agent prefix.
        assert_eq!(session.id, "abc-123");
    }

    #[test]
    fn test_assistant_blocks() {
        let f = write_lines(&[
            r#"{"type":"user","sessionId":"s","timestamp":"2024-01-01T00:00:00Z","message":{"content":"run ls"}}"#,
            r#"{"type":"assistant","sessionId":"s","timestamp":"2024-01-01T00:00:05Z","message":{"role":"assistant","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"on it"},{"type":"tool_use","id":"toolu_1","name":"Bash","input":{"command":"ls"}}]}}"#,
        ]);
        let (_, messages) = parse(f.path(), None).unwrap().unwrap();

        let assistant = &messages[1];
        assert_eq!(assistant.role, Role::Assistant);
        assert!(assistant.has_thinking);
        assert_eq!(assistant.content, "on it");
        assert_eq!(assistant.tool_calls.len(), 1);
        assert_eq!(assistant.tool_calls[0].tool_name, "Bash");
    }

    #[test]
    fn test_tool_result_carrier() {
        let f = write_lines(&[
            r#"{"type":"user","sessionId":"s","timestamp":"2024-01-01T00:00:00Z","message":{"content":"go"}}"#,
            r#"{"type":"user","sessionId":"s","timestamp":"2024-01-01T00:00:10Z","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"file1\nfile2"}]}}"#,
        ]);
        let (_, messages) = parse(f.path(), None).unwrap().unwrap();

        assert_eq!(messages[1].tool_results.len(), 1);
        assert_eq!(messages[1].tool_results[0].content_length, 11);
        assert!(messages[1].content.is_empty());
    }

    #[test]
    fn test_skips_noise_and_sidechains() {
        let f = write_lines(&[
            r#"{"type":"summary","summary":"a talk","leafUuid":"x"}"#,
            r#"{"type":"progress","uuid":"p1","sessionId":"s","timestamp":"2024-01-01T00:00:00Z"}"#,
            r#"{"type":"user","sessionId":"s","isSidechain":true,"timestamp":"2024-01-01T00:00:00Z","message":{"content":"subagent turn"}}"#,
            r#"{"type":"user","sessionId":"s","timestamp":"2024-01-01T00:00:01Z","message":{"content":"real turn"}}"#,
        ]);
        let (_, messages) = parse(f.path(), None).unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "real turn");
    }

    #[test]
    fn test_empty_file_is_non_interactive() {
        let f = write_lines(&[r#"{"type":"summary","summary":"nothing else"}"#]);
        assert!(parse(f.path(), None).unwrap().is_none());
    }

    #[test]
    fn test_malformed_lines_tolerated() {
        let f = write_lines(&[
            "not json at all",
            r#"{"type":"user","sessionId":"s","timestamp":"2024-01-01T00:00:00Z","message":{"content":"still here"}}"#,
        ]);
        let (_, messages) = parse(f.path(), None).unwrap().unwrap();
        assert_eq!(messages.len(), 1);
    }
}
