pub mod claude;
pub mod codex;
pub mod copilot;
pub mod gemini;
pub mod opencode;

use anyhow::Result;
use std::path::Path;

use crate::models::{Agent, DiscoveredFile, ParsedMessage, ParsedSession};

/// Knobs for a single parse invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Codex only: surface exec-style rollouts that carry no interactive
    /// user turn. Off by default; forced syncs of a single session retry
    /// with it on.
    pub include_exec: bool,
}

/// Parser output: `None` means the file was recognized but is not an
/// interactive session (the caller tombstones it).
pub type ParseOutcome = Option<(ParsedSession, Vec<ParsedMessage>)>;

/// Dispatch to the per-agent parser for a file-backed candidate.
///
/// The agent set is closed, so this is a flat match rather than a trait
/// object. OpenCode is database-backed and has its own entry point in
/// `parsers::opencode`.
pub fn parse(file: &DiscoveredFile, opts: &ParseOptions) -> Result<ParseOutcome> {
    match file.agent {
        Agent::Claude => claude::parse(&file.path, file.project.as_deref()),
        Agent::Codex => codex::parse(&file.path, opts.include_exec),
        Agent::Copilot => copilot::parse(&file.path),
        Agent::Gemini => gemini::parse(&file.path, file.project.as_deref()),
        Agent::OpenCode => {
            anyhow::bail!("opencode sessions are parsed from the database, not a path")
        }
    }
}

/// Normalize a directory or project name into the short form stored on
/// sessions: word characters survive, everything else becomes `_`.
pub fn normalize_project(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    normalized.trim_matches('_').to_string()
}

/// Short project name from a working directory: the final path segment,
/// normalized.
pub fn project_from_cwd(cwd: &str) -> String {
    let trimmed = cwd.trim_end_matches(['/', '\\']);
    let last = Path::new(trimmed)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    normalize_project(&last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_project() {
        assert_eq!(normalize_project("my-app"), "my_app");
        assert_eq!(normalize_project("My App 2"), "My_App_2");
        assert_eq!(normalize_project("---"), "");
    }

    #[test]
    fn test_project_from_cwd() {
        assert_eq!(project_from_cwd("/home/u/my-app"), "my_app");
        assert_eq!(project_from_cwd("/home/u/my-app/"), "my_app");
        assert_eq!(project_from_cwd("/"), "");
    }
}
