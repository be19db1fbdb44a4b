use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::SqliteConfig;
use crate::db;
use crate::models::{Agent, Message, Role, Session, ToolCall, ToolCategory};

/// The single writer-owned handle to the relational + full-text store.
///
/// All mutation goes through this type; readers share the same connection
/// behind the mutex. Every method is idempotent on replay, and
/// `write_session` applies a session upsert and its message writes as one
/// atomic unit.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

/// A full-text search hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub session_id: String,
    pub ordinal: i64,
    pub snippet: String,
}

impl Store {
    pub fn open(path: &Path, sqlite_config: &SqliteConfig) -> Result<Self> {
        let conn = db::open_with_config(path, sqlite_config)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if a writer panicked mid-call; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub fn upsert_session(&self, session: &Session) -> Result<()> {
        let conn = self.lock();
        upsert_session_inner(&conn, session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.lock();
        let result = conn
            .prepare_cached(
                "SELECT id, agent, project, machine, started_at, ended_at,
                    message_count, user_message_count, first_message, parent_session_id,
                    file_path, file_size, file_mtime_ns, file_hash
             FROM sessions WHERE id = ?1",
            )?
            .query_row(params![id], row_to_session)
            .optional()
            .context("failed to load session");
        result
    }

    /// Find the session whose id (or agent-local raw id) starts with the
    /// given prefix. Used to resolve user-supplied short ids.
    pub fn find_session_by_id_prefix(&self, prefix: &str) -> Result<Option<Session>> {
        let conn = self.lock();
        let like = format!("{}%", prefix.replace('%', "").replace('_', "\\_"));
        let result = conn
            .prepare_cached(
                "SELECT id, agent, project, machine, started_at, ended_at,
                    message_count, user_message_count, first_message, parent_session_id,
                    file_path, file_size, file_mtime_ns, file_hash
             FROM sessions
             WHERE id LIKE ?1 ESCAPE '\\' OR raw_id LIKE ?1 ESCAPE '\\'
             ORDER BY id LIMIT 1",
            )?
            .query_row(params![like], row_to_session)
            .optional()
            .context("failed to look up session by prefix");
        result
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Highest stored ordinal for a session, or -1 when it has no rows.
    pub fn max_ordinal(&self, session_id: &str) -> Result<i64> {
        let conn = self.lock();
        max_ordinal_inner(&conn, session_id)
    }

    /// Insert messages (with their tool calls and full-text rows) in one
    /// transaction. Existing ordinals are left untouched, which makes
    /// replays idempotent and append-only syncs cheap.
    pub fn insert_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        insert_messages_inner(&tx, messages)?;
        tx.commit().context("failed to commit message insert")
    }

    /// Delete and re-insert every message of a session atomically. Used
    /// when upstream content mutates in place.
    pub fn replace_session_messages(&self, session_id: &str, messages: &[Message]) -> Result<()> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        delete_session_messages_inner(&tx, session_id)?;
        insert_messages_inner(&tx, messages)?;
        tx.commit().context("failed to commit message replace")
    }

    /// Atomic unit for one session: upsert the session row and apply its
    /// message writes in a single transaction. With `replace` false, only
    /// messages with ordinal above the stored maximum are inserted.
    /// Returns the number of message rows inserted.
    pub fn write_session(
        &self,
        session: &Session,
        messages: &[Message],
        replace: bool,
    ) -> Result<usize> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;

        upsert_session_inner(&tx, session)?;

        let inserted = if replace {
            delete_session_messages_inner(&tx, &session.id)?;
            insert_messages_inner(&tx, messages)?
        } else {
            let max = max_ordinal_inner(&tx, &session.id)?;
            let new: Vec<&Message> = messages.iter().filter(|m| m.ordinal > max).collect();
            insert_message_refs_inner(&tx, &new)?
        };

        tx.commit().context("failed to commit session write")?;
        Ok(inserted)
    }

    pub fn get_all_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock();

        let mut messages: Vec<Message> = conn
            .prepare_cached(
                "SELECT session_id, ordinal, role, content, timestamp,
                        has_thinking, has_tool_use, content_length
                 FROM messages WHERE session_id = ?1 ORDER BY ordinal",
            )?
            .query_map(params![session_id], row_to_message)?
            .collect::<Result<_, _>>()
            .context("failed to load messages")?;

        let mut stmt = conn.prepare_cached(
            "SELECT ordinal, tool_use_id, tool_name, category, input_json,
                    skill_name, result_content_length
             FROM tool_calls WHERE session_id = ?1 ORDER BY ordinal",
        )?;
        let calls = stmt.query_map(params![session_id], |row| {
            let ordinal: i64 = row.get(0)?;
            let tool_name: String = row.get(2)?;
            Ok((
                ordinal,
                ToolCall {
                    tool_use_id: row.get(1)?,
                    category: ToolCategory::for_tool(&tool_name),
                    tool_name,
                    input_json: row.get(4)?,
                    skill_name: row.get(5)?,
                    result_content_length: row.get(6)?,
                },
            ))
        })?;

        let mut by_ordinal: HashMap<i64, Vec<ToolCall>> = HashMap::new();
        for call in calls {
            let (ordinal, call) = call?;
            by_ordinal.entry(ordinal).or_default().push(call);
        }
        for msg in &mut messages {
            if let Some(calls) = by_ordinal.remove(&msg.ordinal) {
                msg.tool_calls = calls;
            }
        }

        Ok(messages)
    }

    // -----------------------------------------------------------------------
    // Fingerprints
    // -----------------------------------------------------------------------

    pub fn get_session_file_info(&self, session_id: &str) -> Result<Option<(i64, i64)>> {
        let conn = self.lock();
        let result = conn
            .prepare_cached("SELECT file_size, file_mtime_ns FROM sessions WHERE id = ?1")?
            .query_row(params![session_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .context("failed to load session file info");
        result
    }

    pub fn get_file_info_by_path(&self, path: &str) -> Result<Option<(i64, i64)>> {
        let conn = self.lock();
        let result = conn
            .prepare_cached(
                "SELECT file_size, file_mtime_ns FROM sessions WHERE file_path = ?1 LIMIT 1",
            )?
            .query_row(params![path], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()
            .context("failed to load file info by path");
        result
    }

    /// Invalidate every stored fingerprint so the next sync re-reads all
    /// files. -1 can never equal a real mtime.
    pub fn reset_all_mtimes(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute("UPDATE sessions SET file_mtime_ns = -1", [])
            .context("failed to reset mtimes")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Skip cache persistence
    // -----------------------------------------------------------------------

    pub fn load_skipped_files(&self) -> Result<HashMap<String, i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached("SELECT path, mtime_ns FROM skipped_files")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut map = HashMap::new();
        for row in rows {
            let (path, mtime) = row?;
            map.insert(path, mtime);
        }
        Ok(map)
    }

    pub fn replace_skipped_files(&self, entries: &HashMap<String, i64>) -> Result<()> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM skipped_files", [])?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT INTO skipped_files (path, mtime_ns) VALUES (?1, ?2)")?;
            for (path, mtime) in entries {
                stmt.execute(params![path, mtime])?;
            }
        }
        tx.commit().context("failed to replace skipped files")
    }

    pub fn delete_skipped_file(&self, path: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM skipped_files WHERE path = ?1", params![path])
            .context("failed to delete skip entry")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Full-text search
    // -----------------------------------------------------------------------

    pub fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchHit>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT session_id, ordinal, snippet(fts_messages, 2, '[', ']', '…', 16)
             FROM fts_messages WHERE fts_messages MATCH ?1
             ORDER BY rank LIMIT ?2",
        )?;
        let hits = stmt
            .query_map(params![query, limit], |row| {
                Ok(SearchHit {
                    session_id: row.get(0)?,
                    ordinal: row.get(1)?,
                    snippet: row.get(2)?,
                })
            })?
            .collect::<Result<_, _>>()
            .context("search query failed")?;
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (shared by the transactional composites)
// ---------------------------------------------------------------------------

fn upsert_session_inner(conn: &Connection, session: &Session) -> Result<()> {
    let raw_id = session
        .id
        .strip_prefix(&format!("{}:", session.agent.as_str()))
        .unwrap_or(&session.id);

    // An empty parser project keeps whatever is already stored; a
    // non-empty one wins (the parser saw the real cwd).
    conn.prepare_cached(
        "INSERT INTO sessions
           (id, agent, raw_id, project, machine, started_at, ended_at,
            message_count, user_message_count, first_message, parent_session_id,
            file_path, file_size, file_mtime_ns, file_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(id) DO UPDATE SET
           project = CASE WHEN excluded.project = '' THEN sessions.project
                          ELSE excluded.project END,
           machine = excluded.machine,
           started_at = excluded.started_at,
           ended_at = excluded.ended_at,
           message_count = excluded.message_count,
           user_message_count = excluded.user_message_count,
           first_message = CASE WHEN excluded.first_message = '' THEN sessions.first_message
                                ELSE excluded.first_message END,
           parent_session_id = excluded.parent_session_id,
           file_path = excluded.file_path,
           file_size = excluded.file_size,
           file_mtime_ns = excluded.file_mtime_ns,
           file_hash = excluded.file_hash",
    )?
    .execute(params![
        session.id,
        session.agent.as_str(),
        raw_id,
        session.project,
        session.machine,
        session.started_at.map(|t| t.to_rfc3339()),
        session.ended_at.map(|t| t.to_rfc3339()),
        session.message_count,
        session.user_message_count,
        session.first_message,
        session.parent_session_id,
        session.file.path,
        session.file.size,
        session.file.mtime_ns,
        session.file.hash,
    ])
    .with_context(|| format!("failed to upsert session {}", session.id))?;
    Ok(())
}

fn max_ordinal_inner(conn: &Connection, session_id: &str) -> Result<i64> {
    let max: Option<i64> = conn
        .prepare_cached("SELECT MAX(ordinal) FROM messages WHERE session_id = ?1")?
        .query_row(params![session_id], |row| row.get(0))?;
    Ok(max.unwrap_or(-1))
}

fn insert_messages_inner(conn: &Connection, messages: &[Message]) -> Result<usize> {
    let refs: Vec<&Message> = messages.iter().collect();
    insert_message_refs_inner(conn, &refs)
}

fn insert_message_refs_inner(conn: &Connection, messages: &[&Message]) -> Result<usize> {
    let mut inserted = 0;
    {
        let mut msg_stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO messages
               (session_id, ordinal, role, content, timestamp,
                has_thinking, has_tool_use, content_length)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        let mut fts_stmt = conn.prepare_cached(
            "INSERT INTO fts_messages (session_id, ordinal, content) VALUES (?1, ?2, ?3)",
        )?;
        let mut call_stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO tool_calls
               (session_id, ordinal, tool_use_id, tool_name, category,
                input_json, skill_name, result_content_length)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;

        for msg in messages {
            let changes = msg_stmt
                .execute(params![
                    msg.session_id,
                    msg.ordinal,
                    msg.role.as_str(),
                    msg.content,
                    msg.timestamp.map(|t| t.to_rfc3339()),
                    msg.has_thinking as i32,
                    msg.has_tool_use as i32,
                    msg.content_length,
                ])
                .with_context(|| {
                    format!("failed to insert message {}#{}", msg.session_id, msg.ordinal)
                })?;
            if changes == 0 {
                continue; // replayed row, full-text entry already present
            }
            inserted += 1;

            fts_stmt.execute(params![msg.session_id, msg.ordinal, msg.content])?;

            for call in &msg.tool_calls {
                call_stmt.execute(params![
                    msg.session_id,
                    msg.ordinal,
                    call.tool_use_id,
                    call.tool_name,
                    call.category.as_str(),
                    call.input_json,
                    call.skill_name,
                    call.result_content_length,
                ])?;
            }
        }
    }
    Ok(inserted)
}

fn delete_session_messages_inner(conn: &Connection, session_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM tool_calls WHERE session_id = ?1",
        params![session_id],
    )?;
    conn.execute(
        "DELETE FROM messages WHERE session_id = ?1",
        params![session_id],
    )?;
    conn.execute(
        "DELETE FROM fts_messages WHERE session_id = ?1",
        params![session_id],
    )?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    let agent_str: String = row.get(1)?;
    let agent: Agent = agent_str.parse().unwrap_or(Agent::Claude);
    Ok(Session {
        id: row.get(0)?,
        agent,
        project: row.get(2)?,
        machine: row.get(3)?,
        started_at: parse_ts(row.get::<_, Option<String>>(4)?),
        ended_at: parse_ts(row.get::<_, Option<String>>(5)?),
        message_count: row.get(6)?,
        user_message_count: row.get(7)?,
        first_message: row.get(8)?,
        parent_session_id: row.get(9)?,
        file: crate::models::FileInfo {
            path: row.get(10)?,
            size: row.get(11)?,
            mtime_ns: row.get(12)?,
            hash: row.get(13)?,
        },
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    Ok(Message {
        session_id: row.get(0)?,
        ordinal: row.get(1)?,
        role: if role_str == "assistant" {
            Role::Assistant
        } else {
            Role::User
        },
        content: row.get(3)?,
        timestamp: parse_ts(row.get::<_, Option<String>>(4)?),
        has_thinking: row.get::<_, i32>(5)? != 0,
        has_tool_use: row.get::<_, i32>(6)? != 0,
        content_length: row.get(7)?,
        tool_calls: Vec::new(),
    })
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}
