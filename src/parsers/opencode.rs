use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Deserialize;
use std::path::Path;

use super::{ParseOutcome, project_from_cwd};
use crate::models::{Agent, ParsedMessage, ParsedSession, Role, ToolCall, ToolResult};

// ---------------------------------------------------------------------------
// External database layout (owned by the OpenCode CLI, consumed read-only)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SessionData {
    directory: Option<String>,
    #[serde(rename = "parentID")]
    parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageData {
    role: Option<String>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum MessagePart {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "reasoning")]
    Reasoning(serde_json::Value),
    #[serde(rename = "tool")]
    Tool {
        #[serde(rename = "callID")]
        call_id: String,
        tool: String,
        #[serde(default)]
        state: ToolState,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ToolState {
    #[serde(default)]
    input: serde_json::Value,
    output: Option<String>,
}

/// `(session_id, time_updated_ns)` for every session in the database.
#[derive(Debug, Clone)]
pub struct SessionListing {
    pub session_id: String,
    /// `None` when the row has never been updated; callers fall back to
    /// the database file's own mtime.
    pub updated_ns: Option<i64>,
}

/// Open the OpenCode database read-only. The CLI owns the file; we never
/// write to it.
pub fn open_db(db_path: &Path) -> Result<Connection> {
    Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open opencode db {}", db_path.display()))
}

/// List all sessions with their upstream modification times.
pub fn list_sessions(db_path: &Path) -> Result<Vec<SessionListing>> {
    let conn = open_db(db_path)?;
    let mut stmt = conn
        .prepare("SELECT id, time_updated FROM session ORDER BY id")
        .context("failed to query opencode sessions")?;
    let rows = stmt.query_map([], |row| {
        Ok(SessionListing {
            session_id: row.get(0)?,
            updated_ns: row.get::<_, Option<i64>>(1)?.map(|ms| ms * 1_000_000),
        })
    })?;
    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?);
    }
    Ok(sessions)
}

/// Parse a single session out of the database. Returns `None` when the
/// session has vanished or carries no messages (the upstream store
/// mutates in place, so either can happen between listing and parsing).
pub fn parse_session(db_path: &Path, session_id: &str) -> Result<ParseOutcome> {
    let conn = open_db(db_path)?;

    let session_row: Option<(String, Option<i64>, Option<i64>)> = conn
        .prepare("SELECT data, time_created, time_updated FROM session WHERE id = ?1")?
        .query_row(params![session_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .optional()
        .context("failed to load opencode session")?;

    let Some((data, time_created, time_updated)) = session_row else {
        return Ok(None);
    };

    let session_data: SessionData = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse opencode session {session_id}"))?;

    let mut messages = Vec::new();
    let mut stmt = conn.prepare(
        "SELECT data, time_created FROM message
         WHERE session_id = ?1 ORDER BY time_created, id",
    )?;
    let rows = stmt.query_map(params![session_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
    })?;

    for row in rows {
        let (data, time_created) = row?;
        let msg_data: MessageData = match serde_json::from_str(&data) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!("skipping malformed opencode message in {session_id}: {e}");
                continue;
            }
        };
        if let Some(msg) = row_to_message(&msg_data, time_created) {
            messages.push(msg);
        }
    }

    if messages.is_empty() {
        return Ok(None);
    }

    let project = session_data
        .directory
        .as_deref()
        .map(project_from_cwd)
        .unwrap_or_default();

    let session = ParsedSession {
        id: Agent::OpenCode.session_id(session_id),
        agent: Agent::OpenCode,
        project,
        started_at: time_created.and_then(ms_to_datetime),
        ended_at: time_updated.and_then(ms_to_datetime),
        parent_session_id: session_data
            .parent_id
            .map(|p| Agent::OpenCode.session_id(&p)),
    };

    Ok(Some((session, messages)))
}

fn row_to_message(data: &MessageData, time_created: Option<i64>) -> Option<ParsedMessage> {
    let role = match data.role.as_deref() {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        _ => return None,
    };

    let mut msg = ParsedMessage::text(role, String::new(), time_created.and_then(ms_to_datetime));
    let mut text_parts: Vec<&str> = Vec::new();

    for part in &data.parts {
        match part {
            MessagePart::Text { text } => text_parts.push(text),
            MessagePart::Reasoning(_) => msg.has_thinking = true,
            MessagePart::Tool {
                call_id,
                tool,
                state,
            } => {
                msg.tool_calls
                    .push(ToolCall::new(call_id.clone(), tool.clone(), &state.input));
                if let Some(output) = &state.output {
                    msg.tool_results.push(ToolResult {
                        tool_use_id: call_id.clone(),
                        content_length: output.len() as i64,
                    });
                }
            }
            MessagePart::Other => {}
        }
    }

    msg.content = text_parts.join("\n");
    Some(msg)
}

fn ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Build a database shaped like the one the OpenCode CLI maintains.
    fn fixture_db(dir: &Path) -> std::path::PathBuf {
        let db_path = dir.join("opencode.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE session (
                 id TEXT PRIMARY KEY,
                 data TEXT NOT NULL,
                 time_created INTEGER,
                 time_updated INTEGER
             );
             CREATE TABLE message (
                 id TEXT PRIMARY KEY,
                 session_id TEXT NOT NULL,
                 data TEXT NOT NULL,
                 time_created INTEGER
             );",
        )
        .unwrap();

        conn.execute(
            "INSERT INTO session VALUES ('ses_1', ?1, 1706770800000, 1706771100000)",
            params![r#"{"title":"refactor","directory":"/home/u/web-app"}"#],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO message VALUES ('msg_1', 'ses_1', ?1, 1706770800000)",
            params![
                r#"{"role":"user","parts":[{"type":"text","text":"rename the module"}]}"#
            ],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO message VALUES ('msg_2', 'ses_1', ?1, 1706770860000)",
            params![
                r#"{"role":"assistant","parts":[{"type":"text","text":"renaming"},{"type":"tool","callID":"c1","tool":"edit_file","state":{"input":{"path":"mod.rs"},"output":"ok"}}]}"#
            ],
        )
        .unwrap();
        // A session created but never updated: time_updated stays NULL.
        conn.execute(
            "INSERT INTO session VALUES ('ses_2', ?1, 1706772000000, NULL)",
            params![r#"{"directory":"/home/u/other"}"#],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO message VALUES ('msg_3', 'ses_2', ?1, 1706772000000)",
            params![r#"{"role":"user","parts":[{"type":"text","text":"just started"}]}"#],
        )
        .unwrap();
        db_path
    }

    #[test]
    fn test_list_sessions() {
        let tmp = TempDir::new().unwrap();
        let db_path = fixture_db(tmp.path());

        let sessions = list_sessions(&db_path).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "ses_1");
        assert_eq!(sessions[0].updated_ns, Some(1706771100000 * 1_000_000));
    }

    #[test]
    fn test_list_sessions_null_time_updated() {
        let tmp = TempDir::new().unwrap();
        let db_path = fixture_db(tmp.path());

        let sessions = list_sessions(&db_path).unwrap();
        let fresh = sessions.iter().find(|s| s.session_id == "ses_2").unwrap();
        assert_eq!(fresh.updated_ns, None);
    }

    #[test]
    fn test_parse_session() {
        let tmp = TempDir::new().unwrap();
        let db_path = fixture_db(tmp.path());

        let (session, messages) = parse_session(&db_path, "ses_1").unwrap().unwrap();
        assert_eq!(session.id, "opencode:ses_1");
        assert_eq!(session.project, "web_app");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].tool_calls[0].tool_name, "edit_file");
        assert_eq!(messages[1].tool_results[0].content_length, 2);
    }

    #[test]
    fn test_missing_session_is_none() {
        let tmp = TempDir::new().unwrap();
        let db_path = fixture_db(tmp.path());
        assert!(parse_session(&db_path, "ses_gone").unwrap().is_none());
    }
}
