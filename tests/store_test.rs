//! Store-level invariants: dense ordinals, append monotonicity, replace
//! correctness, and idempotent replay.

use lantern::config::SqliteConfig;
use lantern::models::{Agent, FileInfo, Message, Role, Session, ToolCall, ToolCategory};
use lantern::store::Store;
use std::sync::Arc;
use tempfile::TempDir;

fn open_store(tmp: &TempDir) -> Arc<Store> {
    Arc::new(Store::open(&tmp.path().join("test.db"), &SqliteConfig::default()).unwrap())
}

fn session(id: &str) -> Session {
    Session {
        id: id.into(),
        agent: Agent::Claude,
        project: "p".into(),
        machine: "m".into(),
        started_at: None,
        ended_at: None,
        message_count: 0,
        user_message_count: 0,
        first_message: String::new(),
        parent_session_id: None,
        file: FileInfo {
            path: format!("/logs/{id}.jsonl"),
            size: 1,
            mtime_ns: 1,
            hash: String::new(),
        },
    }
}

fn message(session_id: &str, ordinal: i64, content: &str) -> Message {
    Message {
        session_id: session_id.into(),
        ordinal,
        role: if ordinal % 2 == 0 {
            Role::User
        } else {
            Role::Assistant
        },
        content: content.into(),
        timestamp: None,
        has_thinking: false,
        has_tool_use: false,
        content_length: content.len() as i64,
        tool_calls: Vec::new(),
    }
}

fn stored_ordinals(store: &Store, session_id: &str) -> Vec<i64> {
    store
        .get_all_messages(session_id)
        .unwrap()
        .iter()
        .map(|m| m.ordinal)
        .collect()
}

#[test]
fn test_dense_ordinals_after_appends() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let s = session("s1");

    for step in 1..=5i64 {
        let messages: Vec<Message> = (0..step)
            .map(|i| message("s1", i, &format!("turn {i}")))
            .collect();
        store.write_session(&s, &messages, false).unwrap();

        let expected: Vec<i64> = (0..step).collect();
        assert_eq!(stored_ordinals(&store, "s1"), expected);
    }
}

#[test]
fn test_append_monotonicity() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let s = session("s1");

    let earlier = vec![message("s1", 0, "alpha"), message("s1", 1, "beta")];
    store.write_session(&s, &earlier, false).unwrap();
    let before: Vec<String> = store
        .get_all_messages("s1")
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();

    let later = vec![
        message("s1", 0, "alpha"),
        message("s1", 1, "beta"),
        message("s1", 2, "gamma"),
    ];
    store.write_session(&s, &later, false).unwrap();
    let after: Vec<String> = store
        .get_all_messages("s1")
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();

    // The earlier corpus is a prefix of the later one.
    assert_eq!(&after[..before.len()], &before[..]);
    assert_eq!(after.len(), 3);
}

#[test]
fn test_replace_same_count_changes_content_only() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let mut s = session("s1");

    store
        .write_session(
            &s,
            &[message("s1", 0, "draft"), message("s1", 1, "old reply")],
            false,
        )
        .unwrap();

    s.message_count = 2;
    store
        .write_session(
            &s,
            &[message("s1", 0, "final"), message("s1", 1, "new reply")],
            true,
        )
        .unwrap();

    let messages = store.get_all_messages("s1").unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "final");
    assert_eq!(messages[1].content, "new reply");
    assert_eq!(stored_ordinals(&store, "s1"), vec![0, 1]);
}

#[test]
fn test_insert_replay_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    store.upsert_session(&session("s1")).unwrap();

    let batch = vec![message("s1", 0, "hello"), message("s1", 1, "there")];
    store.insert_messages(&batch).unwrap();
    store.insert_messages(&batch).unwrap();

    assert_eq!(stored_ordinals(&store, "s1"), vec![0, 1]);
    // Replay must not duplicate full-text rows either.
    assert_eq!(store.search("hello", 10).unwrap().len(), 1);
}

#[test]
fn test_replace_cleans_full_text_rows() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let s = session("s1");

    store
        .write_session(&s, &[message("s1", 0, "obsolete wording")], false)
        .unwrap();
    store
        .write_session(&s, &[message("s1", 0, "fresh wording")], true)
        .unwrap();

    assert!(store.search("obsolete", 10).unwrap().is_empty());
    assert_eq!(store.search("fresh", 10).unwrap().len(), 1);
}

#[test]
fn test_tool_call_cascade_on_replace() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);
    let s = session("s1");

    let mut with_call = message("s1", 0, "running");
    with_call.has_tool_use = true;
    with_call.tool_calls.push(ToolCall {
        tool_use_id: "t1".into(),
        tool_name: "Bash".into(),
        category: ToolCategory::Execution,
        input_json: "{}".into(),
        skill_name: None,
        result_content_length: 5,
    });
    store.write_session(&s, &[with_call], false).unwrap();

    store
        .write_session(&s, &[message("s1", 0, "no tools now")], true)
        .unwrap();

    let messages = store.get_all_messages("s1").unwrap();
    assert!(messages[0].tool_calls.is_empty());
}

#[test]
fn test_two_sessions_same_raw_id_different_agents() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp);

    let claude = session("shared-id");
    let mut codex = session("codex:shared-id");
    codex.agent = Agent::Codex;
    codex.file.path = "/codex/shared.jsonl".into();

    store.upsert_session(&claude).unwrap();
    store.upsert_session(&codex).unwrap();

    assert!(store.get_session("shared-id").unwrap().is_some());
    assert!(store.get_session("codex:shared-id").unwrap().is_some());
}
