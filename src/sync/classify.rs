use std::path::{Component, Path, PathBuf};

use super::projects::GeminiProjectMap;
use crate::config::RootsConfig;
use crate::models::{Agent, DiscoveredFile};
use crate::parsers::codex;

/// Maps raw filesystem paths (typically watcher notifications) back to
/// per-agent candidates, or rejects them. The rules are the exact
/// inverse of the discovery layouts.
pub struct Classifier {
    claude_roots: Vec<PathBuf>,
    codex_roots: Vec<PathBuf>,
    copilot_roots: Vec<PathBuf>,
    gemini_roots: Vec<(PathBuf, GeminiProjectMap)>,
    opencode_dbs: Vec<PathBuf>,
}

impl Classifier {
    pub fn new(roots: &RootsConfig) -> Self {
        let gemini_roots = roots
            .gemini_roots()
            .into_iter()
            .map(|root| {
                let map = GeminiProjectMap::load(&root);
                (root, map)
            })
            .collect();

        Self {
            claude_roots: roots.claude_roots(),
            codex_roots: roots.codex_roots(),
            copilot_roots: roots.copilot_roots(),
            gemini_roots,
            opencode_dbs: roots.opencode_dbs(),
        }
    }

    pub fn gemini_project_map(&self, root: &Path) -> Option<&GeminiProjectMap> {
        self.gemini_roots
            .iter()
            .find(|(r, _)| r == root)
            .map(|(_, m)| m)
    }

    /// Classify an absolute path. Returns `None` for anything that does
    /// not match a configured layout exactly.
    pub fn classify(&self, path: &Path) -> Option<DiscoveredFile> {
        let path = clean_path(path);

        for root in &self.claude_roots {
            if let Some(found) = classify_claude(root, &path) {
                return Some(found);
            }
        }
        for root in &self.codex_roots {
            if let Some(found) = classify_codex(root, &path) {
                return Some(found);
            }
        }
        for root in &self.copilot_roots {
            if let Some(found) = classify_copilot(root, &path) {
                return Some(found);
            }
        }
        for (root, map) in &self.gemini_roots {
            if let Some(found) = classify_gemini(root, map, &path) {
                return Some(found);
            }
        }
        for db in &self.opencode_dbs {
            // The database itself or its WAL sidecar changing means some
            // session changed; the db-backed sync sorts out which.
            let db = clean_path(db);
            if path == db || path == wal_sidecar(&db) {
                return Some(DiscoveredFile {
                    path: db,
                    agent: Agent::OpenCode,
                    project: None,
                });
            }
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Per-agent rules
// ---------------------------------------------------------------------------

/// `<root>/<projectDir>/<sessionID>.jsonl`, exactly two segments deep.
/// Subagent transcripts (`agent-*` stems) are not sessions.
fn classify_claude(root: &Path, path: &Path) -> Option<DiscoveredFile> {
    let rel = relative_under(root, path)?;
    let segments = segments_of(&rel)?;
    if segments.len() != 2 {
        return None;
    }
    let file_name = &segments[1];
    let stem = file_name.strip_suffix(".jsonl")?;
    if stem.is_empty() || stem.starts_with("agent-") {
        return None;
    }
    Some(DiscoveredFile {
        path: path.to_path_buf(),
        agent: Agent::Claude,
        // The raw dir name; the parser resolves the real project from cwd.
        project: Some(segments[0].clone()),
    })
}

/// `<root>/<YYYY>/<MM>/<DD>/rollout-*-<uuid>.jsonl` with all-digit date
/// segments.
fn classify_codex(root: &Path, path: &Path) -> Option<DiscoveredFile> {
    let rel = relative_under(root, path)?;
    let segments = segments_of(&rel)?;
    if segments.len() != 4 {
        return None;
    }
    if !segments[..3].iter().all(|s| is_all_digits(s)) {
        return None;
    }
    let stem = segments[3].strip_suffix(".jsonl")?;
    if !stem.starts_with("rollout-") || codex::uuid_from_stem(stem).is_none() {
        return None;
    }
    Some(DiscoveredFile {
        path: path.to_path_buf(),
        agent: Agent::Codex,
        project: None,
    })
}

/// `<root>/session-state/<uuid>.jsonl` or
/// `<root>/session-state/<uuid>/events.jsonl`. When both exist for the
/// same uuid the directory form is canonical and the bare form rejects.
fn classify_copilot(root: &Path, path: &Path) -> Option<DiscoveredFile> {
    let state_dir = root.join("session-state");
    let rel = relative_under(&state_dir, path)?;
    let segments = segments_of(&rel)?;

    match segments.len() {
        1 => {
            let stem = segments[0].strip_suffix(".jsonl")?;
            if stem.is_empty() {
                return None;
            }
            let dir_form = state_dir.join(stem).join("events.jsonl");
            if dir_form.is_file() {
                return None;
            }
            Some(DiscoveredFile {
                path: path.to_path_buf(),
                agent: Agent::Copilot,
                project: None,
            })
        }
        2 if segments[1] == "events.jsonl" => Some(DiscoveredFile {
            path: path.to_path_buf(),
            agent: Agent::Copilot,
            project: None,
        }),
        _ => None,
    }
}

/// `<root>/tmp/<dir>/chats/session-*.json`, with `<dir>` resolved
/// through the cached project map.
fn classify_gemini(root: &Path, map: &GeminiProjectMap, path: &Path) -> Option<DiscoveredFile> {
    let rel = relative_under(root, path)?;
    let segments = segments_of(&rel)?;
    if segments.len() != 4 || segments[0] != "tmp" || segments[2] != "chats" {
        return None;
    }
    let file_name = &segments[3];
    if !file_name.starts_with("session-") || !file_name.ends_with(".json") {
        return None;
    }
    Some(DiscoveredFile {
        path: path.to_path_buf(),
        agent: Agent::Gemini,
        project: Some(map.resolve(&segments[1])),
    })
}

fn wal_sidecar(db: &Path) -> PathBuf {
    let mut name = db.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push("-wal");
    db.with_file_name(name)
}

// ---------------------------------------------------------------------------
// Path containment
// ---------------------------------------------------------------------------

/// True when `path` sits strictly under `dir`. Robust to trailing
/// separators and to `..` escape attempts in either argument.
pub fn is_under(dir: &Path, path: &Path) -> bool {
    relative_under(&clean_path(dir), &clean_path(path)).is_some()
}

/// The relative path of `path` under `dir`, or `None` when `path` is
/// `dir` itself, a sibling, or escapes via `..`.
fn relative_under(dir: &Path, path: &Path) -> Option<PathBuf> {
    let dir = clean_path(dir);
    let rel = path.strip_prefix(&dir).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    for comp in rel.components() {
        match comp {
            Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(rel.to_path_buf())
}

/// Lexically normalize a path: drop `.`, resolve `..` against preceding
/// segments. No filesystem access.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

fn segments_of(rel: &Path) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => segments.push(s.to_string_lossy().to_string()),
            _ => return None,
        }
    }
    Some(segments)
}

fn is_all_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RootsConfig;
    use tempfile::TempDir;

    fn test_classifier(tmp: &TempDir) -> Classifier {
        let root = tmp.path().to_string_lossy().to_string();
        Classifier::new(&RootsConfig {
            claude: vec![format!("{root}/claude/projects")],
            codex: vec![format!("{root}/codex/sessions")],
            copilot: vec![format!("{root}/copilot")],
            gemini: vec![format!("{root}/gemini")],
            opencode: vec![format!("{root}/opencode/opencode.db")],
        })
    }

    #[test]
    fn test_claude_exact_depth() {
        let tmp = TempDir::new().unwrap();
        let c = test_classifier(&tmp);
        let root = tmp.path();

        let ok = c
            .classify(&root.join("claude/projects/-home-u-p/abc.jsonl"))
            .unwrap();
        assert_eq!(ok.agent, Agent::Claude);
        assert_eq!(ok.project.as_deref(), Some("-home-u-p"));

        // Too shallow, too deep, wrong extension, subagent stem
        assert!(c.classify(&root.join("claude/projects/abc.jsonl")).is_none());
        assert!(c
            .classify(&root.join("claude/projects/p/nested/abc.jsonl"))
            .is_none());
        assert!(c.classify(&root.join("claude/projects/p/abc.json")).is_none());
        assert!(c
            .classify(&root.join("claude/projects/p/agent-xyz.jsonl"))
            .is_none());
    }

    #[test]
    fn test_codex_date_segments() {
        let tmp = TempDir::new().unwrap();
        let c = test_classifier(&tmp);
        let root = tmp.path();

        let ok = c.classify(&root.join(
            "codex/sessions/2024/01/15/rollout-20240115-abc12345-1234-5678-9abc-def012345678.jsonl",
        ));
        assert_eq!(ok.unwrap().agent, Agent::Codex);

        // Directly under root, non-digit dirs, missing uuid
        assert!(c
            .classify(&root.join(
                "codex/sessions/rollout-20240115-abc12345-1234-5678-9abc-def012345678.jsonl"
            ))
            .is_none());
        assert!(c
            .classify(&root.join(
                "codex/sessions/2024/jan/15/rollout-20240115-abc12345-1234-5678-9abc-def012345678.jsonl"
            ))
            .is_none());
        assert!(c
            .classify(&root.join("codex/sessions/2024/01/15/rollout-20240115.jsonl"))
            .is_none());
    }

    #[test]
    fn test_copilot_bare_and_dir_forms() {
        let tmp = TempDir::new().unwrap();
        let c = test_classifier(&tmp);
        let root = tmp.path();

        assert!(c
            .classify(&root.join("copilot/session-state/u1.jsonl"))
            .is_some());
        assert!(c
            .classify(&root.join("copilot/session-state/u1/events.jsonl"))
            .is_some());
        assert!(c
            .classify(&root.join("copilot/session-state/u1/other.jsonl"))
            .is_none());

        // When the directory form exists on disk the bare form rejects.
        std::fs::create_dir_all(root.join("copilot/session-state/u2")).unwrap();
        std::fs::write(root.join("copilot/session-state/u2/events.jsonl"), "").unwrap();
        assert!(c
            .classify(&root.join("copilot/session-state/u2.jsonl"))
            .is_none());
    }

    #[test]
    fn test_gemini_layout_and_project() {
        let tmp = TempDir::new().unwrap();
        let c = test_classifier(&tmp);
        let root = tmp.path();

        let hex = "a".repeat(64);
        let hashed = c
            .classify(&root.join(format!("gemini/tmp/{hex}/chats/session-1.json")))
            .unwrap();
        assert_eq!(hashed.agent, Agent::Gemini);
        assert_eq!(hashed.project.as_deref(), Some("unknown"));

        let named = c
            .classify(&root.join("gemini/tmp/my-app/chats/session-1.json"))
            .unwrap();
        assert_eq!(named.project.as_deref(), Some("my_app"));

        assert!(c
            .classify(&root.join("gemini/tmp/my-app/session-1.json"))
            .is_none());
        assert!(c
            .classify(&root.join("gemini/tmp/my-app/chats/notes.json"))
            .is_none());
    }

    #[test]
    fn test_opencode_db_and_wal() {
        let tmp = TempDir::new().unwrap();
        let c = test_classifier(&tmp);
        let root = tmp.path();

        let db = c.classify(&root.join("opencode/opencode.db")).unwrap();
        assert_eq!(db.agent, Agent::OpenCode);

        let wal = c.classify(&root.join("opencode/opencode.db-wal")).unwrap();
        assert_eq!(wal.agent, Agent::OpenCode);
        assert_eq!(wal.path, root.join("opencode/opencode.db"));
    }

    #[test]
    fn test_outside_roots_rejected() {
        let tmp = TempDir::new().unwrap();
        let c = test_classifier(&tmp);
        assert!(c.classify(Path::new("/etc/passwd")).is_none());
        assert!(c.classify(&tmp.path().join("random.jsonl")).is_none());
    }

    #[test]
    fn test_is_under_no_escape() {
        let dir = Path::new("/a/b");
        assert!(is_under(dir, Path::new("/a/b/c")));
        assert!(is_under(Path::new("/a/b/"), Path::new("/a/b/c")));
        assert!(!is_under(dir, Path::new("/a/b")));
        assert!(!is_under(dir, Path::new("/a/b/..")));
        assert!(!is_under(dir, Path::new("/a/b/c/../..")));
        assert!(!is_under(dir, Path::new("/a")));
        assert!(!is_under(dir, Path::new("/a/bc")));
    }

    #[test]
    fn test_escape_through_dotdot_rejected() {
        let tmp = TempDir::new().unwrap();
        let c = test_classifier(&tmp);
        let sneaky = tmp
            .path()
            .join("claude/projects/p/../../../etc/session.jsonl");
        assert!(c.classify(&sneaky).is_none());
    }
}
