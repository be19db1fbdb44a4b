use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// The closed set of agents whose transcripts we ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Claude,
    Codex,
    Copilot,
    Gemini,
    #[serde(rename = "opencode")]
    OpenCode,
}

impl Agent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Agent::Claude => "claude",
            Agent::Codex => "codex",
            Agent::Copilot => "copilot",
            Agent::Gemini => "gemini",
            Agent::OpenCode => "opencode",
        }
    }

    /// Build the globally unique session id from an agent-local raw id.
    /// Claude ids are stored bare for historical reasons; everything above
    /// the parser treats the result as opaque.
    pub fn session_id(&self, raw_id: &str) -> String {
        match self {
            Agent::Claude => raw_id.to_string(),
            _ => format!("{}:{}", self.as_str(), raw_id),
        }
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Agent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Agent::Claude),
            "codex" => Ok(Agent::Codex),
            "copilot" => Ok(Agent::Copilot),
            "gemini" => Ok(Agent::Gemini),
            "opencode" => Ok(Agent::OpenCode),
            other => Err(format!("unknown agent: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Message roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

// ---------------------------------------------------------------------------
// Tool calls and results
// ---------------------------------------------------------------------------

/// Coarse bucket for a tool call, derived from the tool name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Read,
    Edit,
    Execution,
    Search,
    Web,
    Task,
    Other,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Read => "read",
            ToolCategory::Edit => "edit",
            ToolCategory::Execution => "execution",
            ToolCategory::Search => "search",
            ToolCategory::Web => "web",
            ToolCategory::Task => "task",
            ToolCategory::Other => "other",
        }
    }

    /// Flat match over well-known tool names across all five agents.
    pub fn for_tool(name: &str) -> Self {
        match name {
            "Read" | "NotebookRead" | "read_file" | "view" | "cat" => ToolCategory::Read,
            "Write" | "Edit" | "MultiEdit" | "NotebookEdit" | "write_file" | "edit_file"
            | "apply_patch" | "str_replace" | "patch" => ToolCategory::Edit,
            "Bash" | "BashOutput" | "KillShell" | "shell" | "exec" | "run_terminal_command"
            | "local_shell" | "run_shell_command" => ToolCategory::Execution,
            "Grep" | "Glob" | "LS" | "grep" | "glob" | "list" | "search_file_content"
            | "find_files" => ToolCategory::Search,
            "WebFetch" | "WebSearch" | "web_search" | "webfetch" | "fetch" => ToolCategory::Web,
            "Task" | "Agent" | "task" | "agent" | "Skill" => ToolCategory::Task,
            _ => ToolCategory::Other,
        }
    }
}

/// Structured record of an assistant's tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub tool_use_id: String,
    pub tool_name: String,
    pub category: ToolCategory,
    pub input_json: String,
    pub skill_name: Option<String>,
    /// Bytes of the paired tool result body. Filled by the writer during
    /// pairing; unmatched calls keep 0.
    pub result_content_length: i64,
}

impl ToolCall {
    pub fn new(tool_use_id: String, tool_name: String, input: &serde_json::Value) -> Self {
        let skill_name = match tool_name.as_str() {
            "Skill" => input.get("skill").and_then(|v| v.as_str()).map(String::from),
            "SlashCommand" => input
                .get("command")
                .and_then(|v| v.as_str())
                .map(String::from),
            _ => None,
        };
        Self {
            category: ToolCategory::for_tool(&tool_name),
            input_json: input.to_string(),
            skill_name,
            tool_use_id,
            tool_name,
            result_content_length: 0,
        }
    }
}

/// Transient carrier for a tool result body. Never persisted as its own
/// row; only used to fill `result_content_length` on the matching call.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content_length: i64,
}

// ---------------------------------------------------------------------------
// Parser output
// ---------------------------------------------------------------------------

/// Session metadata produced by a per-agent parser.
#[derive(Debug, Clone)]
pub struct ParsedSession {
    /// Globally unique id, already carrying the agent prefix rule.
    pub id: String,
    pub agent: Agent,
    /// Normalized short project name; may be empty when the source gives
    /// no hint (the writer then keeps any previously stored value).
    pub project: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub parent_session_id: Option<String>,
}

/// One message in parser output order (the file's byte order). Ordinals
/// are assigned later by the writer, after pairing and filtering.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub has_thinking: bool,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
}

impl ParsedMessage {
    pub fn text(role: Role, content: String, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            role,
            content,
            timestamp,
            has_thinking: false,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted rows
// ---------------------------------------------------------------------------

/// File identity for skip decisions plus an integrity hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: i64,
    /// Nanoseconds since the epoch. All mtimes in the store use this unit.
    pub mtime_ns: i64,
    /// SHA-256 hex of the file bytes, computed after a successful parse.
    pub hash: String,
}

/// A session row as stored.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub agent: Agent,
    pub project: String,
    pub machine: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    pub user_message_count: i64,
    pub first_message: String,
    pub parent_session_id: Option<String>,
    #[serde(skip)]
    pub file: FileInfo,
}

/// A message row as stored, dense-ordinal within its session.
#[derive(Debug, Clone)]
pub struct Message {
    pub session_id: String,
    pub ordinal: i64,
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub has_thinking: bool,
    pub has_tool_use: bool,
    pub content_length: i64,
    pub tool_calls: Vec<ToolCall>,
}

// ---------------------------------------------------------------------------
// Discovery and progress
// ---------------------------------------------------------------------------

/// A candidate transcript produced by discovery or the path classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub agent: Agent,
    /// Project hint from the source layout. Parsers may refine it.
    pub project: Option<String>,
}

/// Counters published after each sync pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncStats {
    pub total_sessions: usize,
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
    pub warnings: usize,
}

impl std::fmt::Display for SyncStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} total, {} synced, {} skipped, {} failed, {} warnings",
            self.total_sessions, self.synced, self.skipped, self.failed, self.warnings
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Discovering,
    Syncing,
    Done,
}

/// Progress event emitted after each completed parse job.
/// `sessions_done` is monotone within one sync.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Progress {
    pub phase: SyncPhase,
    pub sessions_total: usize,
    pub sessions_done: usize,
    pub messages_indexed: usize,
}
