use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{FileInfo, Message, ParsedMessage, ParsedSession, Role, Session};
use crate::store::Store;

/// How message rows reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// File-backed agents: insert only ordinals above the stored
    /// maximum. Falls back to a replace when the new set is shorter than
    /// what is stored (the file shrank, so it mutated).
    Append,
    /// Delete and re-insert everything. Used for forced single-session
    /// syncs and the database-backed agent.
    Replace,
}

/// The only component that mutates the store. Turns parser output into
/// session + message rows: pairs tool results with their calls, filters
/// carrier messages, assigns dense ordinals, and picks the append or
/// replace path.
pub struct Writer {
    store: Arc<Store>,
    machine: String,
}

impl Writer {
    pub fn new(store: Arc<Store>, machine: String) -> Self {
        Self { store, machine }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Write one parsed session. Returns the number of message rows
    /// inserted.
    pub fn write(
        &self,
        parsed: &ParsedSession,
        raw_messages: Vec<ParsedMessage>,
        file: FileInfo,
        mode: WriteMode,
    ) -> Result<usize> {
        let messages = prepare_messages(&parsed.id, raw_messages);

        let user_count = messages.iter().filter(|m| m.role == Role::User).count() as i64;
        let first_message = messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| truncate_chars(&m.content, 200))
            .unwrap_or_default();

        let session = Session {
            id: parsed.id.clone(),
            agent: parsed.agent,
            project: parsed.project.clone(),
            machine: self.machine.clone(),
            started_at: parsed.started_at,
            ended_at: parsed.ended_at,
            message_count: messages.len() as i64,
            user_message_count: user_count,
            first_message,
            parent_session_id: parsed.parent_session_id.clone(),
            file,
        };

        let replace = match mode {
            WriteMode::Replace => true,
            WriteMode::Append => {
                let max = self.store.max_ordinal(&session.id)?;
                // A strict extension appends; anything shorter than the
                // stored range means in-place mutation.
                (messages.len() as i64) < max + 1
            }
        };

        self.store.write_session(&session, &messages, replace)
    }
}

/// Pairing, filtering, and ordinal assignment, in that order.
///
/// Pairing must happen before the displayable filter: the carrier user
/// messages that hold tool results are dropped, but the result sizes
/// they carry live on in the matched calls.
pub fn prepare_messages(session_id: &str, raw: Vec<ParsedMessage>) -> Vec<Message> {
    let mut raw = raw;

    // Index of tool_use_id -> (message index, call index). Later
    // duplicates of an id are ignored; ids are unique within a session.
    let mut call_index: HashMap<String, (usize, usize)> = HashMap::new();
    for (msg_idx, msg) in raw.iter().enumerate() {
        for (c_idx, call) in msg.tool_calls.iter().enumerate() {
            call_index
                .entry(call.tool_use_id.clone())
                .or_insert((msg_idx, c_idx));
        }
    }

    // Walk every result and write its size onto the matched call.
    // Unmatched results are dropped without residue.
    let mut pairs: Vec<((usize, usize), i64)> = Vec::new();
    for msg in &raw {
        for result in &msg.tool_results {
            if let Some(&slot) = call_index.get(&result.tool_use_id) {
                pairs.push((slot, result.content_length));
            }
        }
    }
    for ((msg_idx, c_idx), len) in pairs {
        raw[msg_idx].tool_calls[c_idx].result_content_length = len;
    }

    // Displayable filter: pure result carriers (user role, whitespace
    // content, no calls of their own) disappear before ordinals exist.
    raw.retain(|m| {
        !(m.role == Role::User && m.content.trim().is_empty() && m.tool_calls.is_empty())
    });

    raw.into_iter()
        .enumerate()
        .map(|(ordinal, m)| Message {
            session_id: session_id.to_string(),
            ordinal: ordinal as i64,
            role: m.role,
            content_length: m.content.len() as i64,
            has_tool_use: !m.tool_calls.is_empty(),
            content: m.content,
            timestamp: m.timestamp,
            has_thinking: m.has_thinking,
            tool_calls: m.tool_calls,
        })
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqliteConfig;
    use crate::models::{Agent, ToolCall, ToolResult};
    use tempfile::TempDir;

    fn user(content: &str) -> ParsedMessage {
        ParsedMessage::text(Role::User, content.into(), None)
    }

    fn assistant(content: &str) -> ParsedMessage {
        ParsedMessage::text(Role::Assistant, content.into(), None)
    }

    fn with_call(mut msg: ParsedMessage, id: &str, tool: &str) -> ParsedMessage {
        msg.tool_calls.push(ToolCall::new(
            id.into(),
            tool.into(),
            &serde_json::json!({}),
        ));
        msg
    }

    fn carrier(id: &str, len: i64) -> ParsedMessage {
        let mut msg = user("");
        msg.tool_results.push(ToolResult {
            tool_use_id: id.into(),
            content_length: len,
        });
        msg
    }

    #[test]
    fn test_dense_ordinals_after_filter() {
        let messages = prepare_messages(
            "s",
            vec![
                user("question"),
                with_call(assistant("answer"), "t1", "Bash"),
                carrier("t1", 42),
                user("followup"),
            ],
        );

        let ordinals: Vec<i64> = messages.iter().map(|m| m.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
        assert_eq!(messages[2].content, "followup");
    }

    #[test]
    fn test_pairing_survives_carrier_filter() {
        let messages = prepare_messages(
            "s",
            vec![with_call(assistant(""), "t1", "Read"), carrier("t1", 1234)],
        );

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].tool_calls[0].result_content_length, 1234);
    }

    #[test]
    fn test_unmatched_results_drop_unmatched_calls_keep_zero() {
        let messages = prepare_messages(
            "s",
            vec![
                with_call(assistant("doing"), "t1", "Bash"),
                carrier("t-unknown", 999),
            ],
        );

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].tool_calls[0].result_content_length, 0);
    }

    #[test]
    fn test_whitespace_user_message_filtered() {
        let messages = prepare_messages("s", vec![user("   \n"), assistant("reply")]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
    }

    #[test]
    fn test_writer_counts_and_first_message() {
        let tmp = TempDir::new().unwrap();
        let store =
            Arc::new(Store::open(&tmp.path().join("test.db"), &SqliteConfig::default()).unwrap());
        let writer = Writer::new(store.clone(), "testhost".into());

        let parsed = ParsedSession {
            id: "s1".into(),
            agent: Agent::Claude,
            project: "proj".into(),
            started_at: None,
            ended_at: None,
            parent_session_id: None,
        };
        let inserted = writer
            .write(
                &parsed,
                vec![user("first question"), assistant("the answer"), user("thanks")],
                FileInfo::default(),
                WriteMode::Append,
            )
            .unwrap();
        assert_eq!(inserted, 3);

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.message_count, 3);
        assert_eq!(session.user_message_count, 2);
        assert_eq!(session.first_message, "first question");
        assert_eq!(session.machine, "testhost");
    }

    #[test]
    fn test_append_mode_only_inserts_tail() {
        let tmp = TempDir::new().unwrap();
        let store =
            Arc::new(Store::open(&tmp.path().join("test.db"), &SqliteConfig::default()).unwrap());
        let writer = Writer::new(store.clone(), "m".into());

        let parsed = ParsedSession {
            id: "s1".into(),
            agent: Agent::Claude,
            project: "p".into(),
            started_at: None,
            ended_at: None,
            parent_session_id: None,
        };

        writer
            .write(
                &parsed,
                vec![user("one")],
                FileInfo::default(),
                WriteMode::Append,
            )
            .unwrap();
        let inserted = writer
            .write(
                &parsed,
                vec![user("one"), assistant("two")],
                FileInfo::default(),
                WriteMode::Append,
            )
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(store.max_ordinal("s1").unwrap(), 1);
    }

    #[test]
    fn test_shrunk_file_triggers_replace() {
        let tmp = TempDir::new().unwrap();
        let store =
            Arc::new(Store::open(&tmp.path().join("test.db"), &SqliteConfig::default()).unwrap());
        let writer = Writer::new(store.clone(), "m".into());

        let parsed = ParsedSession {
            id: "s1".into(),
            agent: Agent::Claude,
            project: "p".into(),
            started_at: None,
            ended_at: None,
            parent_session_id: None,
        };

        writer
            .write(
                &parsed,
                vec![user("one"), assistant("two"), user("three")],
                FileInfo::default(),
                WriteMode::Append,
            )
            .unwrap();
        writer
            .write(
                &parsed,
                vec![user("only")],
                FileInfo::default(),
                WriteMode::Append,
            )
            .unwrap();

        let messages = store.get_all_messages("s1").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "only");
    }
}
