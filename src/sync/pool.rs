use std::sync::mpsc;
use std::sync::Mutex;

use super::skip::SkipCache;
use crate::fingerprint;
use crate::models::{Agent, DiscoveredFile, ParsedMessage, ParsedSession};
use crate::parsers::{self, ParseOptions};
use crate::store::Store;

/// What happened to one candidate file.
pub enum JobOutcome {
    /// Skip-cache or fingerprint hit; nothing was read.
    Skipped,
    Parsed(ParsedSession, Vec<ParsedMessage>),
    /// Recognized but not an interactive session. Tombstoned like a
    /// failure, but not counted as one.
    NonInteractive,
    Failed(String),
}

pub struct JobResult {
    pub file: DiscoveredFile,
    pub size: i64,
    pub mtime_ns: i64,
    /// SHA-256 of the file bytes; filled only on a successful parse.
    pub hash: String,
    pub outcome: JobOutcome,
}

/// Parsing is blocking file I/O, so the pool fans out over real threads.
pub fn worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.clamp(2, 8)
}

/// Fan the candidate files over the worker pool. Results are delivered
/// to `on_result` on the caller's thread, in completion order; the call
/// returns once every job has been drained.
pub fn run(
    files: Vec<DiscoveredFile>,
    skip: &SkipCache,
    store: &Store,
    opts: ParseOptions,
    mut on_result: impl FnMut(JobResult),
) {
    if files.is_empty() {
        return;
    }

    let queue = Mutex::new(files.into_iter());
    let (tx, rx) = mpsc::channel::<JobResult>();

    std::thread::scope(|scope| {
        for _ in 0..worker_count() {
            let tx = tx.clone();
            let queue = &queue;
            scope.spawn(move || loop {
                let next = queue.lock().unwrap_or_else(|e| e.into_inner()).next();
                let Some(file) = next else {
                    break;
                };
                if tx.send(process_file(file, skip, store, &opts)).is_err() {
                    break;
                }
            });
        }
        drop(tx);

        for result in rx {
            on_result(result);
        }
    });
}

/// One job: stat once, consult the skip cache, consult the stored
/// fingerprint, then parse.
pub fn process_file(
    file: DiscoveredFile,
    skip: &SkipCache,
    store: &Store,
    opts: &ParseOptions,
) -> JobResult {
    let (size, mtime_ns) = match fingerprint::stat_file(&file.path) {
        Ok(pair) => pair,
        Err(e) => {
            return JobResult {
                file,
                size: 0,
                mtime_ns: 0,
                hash: String::new(),
                outcome: JobOutcome::Failed(format!("{e:#}")),
            };
        }
    };

    if skip.has(&file.path, mtime_ns) {
        return JobResult {
            file,
            size,
            mtime_ns,
            hash: String::new(),
            outcome: JobOutcome::Skipped,
        };
    }

    if fingerprint_matches(&file, size, mtime_ns, store) {
        return JobResult {
            file,
            size,
            mtime_ns,
            hash: String::new(),
            outcome: JobOutcome::Skipped,
        };
    }

    match parsers::parse(&file, opts) {
        Ok(Some((session, messages))) => {
            let hash = fingerprint::hash_file(&file.path).unwrap_or_default();
            JobResult {
                file,
                size,
                mtime_ns,
                hash,
                outcome: JobOutcome::Parsed(session, messages),
            }
        }
        Ok(None) => JobResult {
            file,
            size,
            mtime_ns,
            hash: String::new(),
            outcome: JobOutcome::NonInteractive,
        },
        Err(e) => JobResult {
            file,
            size,
            mtime_ns,
            hash: String::new(),
            outcome: JobOutcome::Failed(format!("{e:#}")),
        },
    }
}

/// Claude files can skip by session fingerprint because the session id
/// is the filename stem; the other agents need a parse to learn their
/// id, so they skip by path fingerprint instead.
fn fingerprint_matches(file: &DiscoveredFile, size: i64, mtime_ns: i64, store: &Store) -> bool {
    match file.agent {
        Agent::Claude => {
            let Some(stem) = file.path.file_stem().map(|s| s.to_string_lossy().to_string())
            else {
                return false;
            };
            match store.get_session(&stem) {
                Ok(Some(session)) => {
                    session.file.size == size
                        && session.file.mtime_ns == mtime_ns
                        // An unresolved project means an older parser
                        // gave up on the cwd; re-parse even though the
                        // file itself is unchanged.
                        && !project_is_placeholder(&session.project)
                }
                _ => false,
            }
        }
        _ => match store.get_file_info_by_path(&file.path.to_string_lossy()) {
            Ok(Some((stored_size, stored_mtime))) => {
                stored_size == size && stored_mtime == mtime_ns
            }
            _ => false,
        },
    }
}

/// Project names that still look like Claude's percent-encoded project
/// directories rather than a real cwd-derived name.
pub fn project_is_placeholder(project: &str) -> bool {
    project.is_empty() || project.starts_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqliteConfig;
    use crate::models::{FileInfo, Session};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_store(dir: &Path) -> Arc<Store> {
        Arc::new(Store::open(&dir.join("test.db"), &SqliteConfig::default()).unwrap())
    }

    fn claude_file(path: &Path) -> DiscoveredFile {
        DiscoveredFile {
            path: path.to_path_buf(),
            agent: Agent::Claude,
            project: None,
        }
    }

    fn write_claude_session(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(
            &path,
            r#"{"type":"user","sessionId":"s-pool","timestamp":"2024-01-01T00:00:00Z","cwd":"/home/u/p","message":{"content":"hi"}}"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_worker_count_bounds() {
        let n = worker_count();
        assert!((2..=8).contains(&n));
    }

    #[test]
    fn test_process_parses_new_file() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(tmp.path());
        let skip = SkipCache::default();
        let path = write_claude_session(tmp.path(), "s-pool.jsonl");

        let result = process_file(claude_file(&path), &skip, &store, &ParseOptions::default());
        assert!(matches!(result.outcome, JobOutcome::Parsed(..)));
        assert!(!result.hash.is_empty());
        assert!(result.mtime_ns > 0);
    }

    #[test]
    fn test_skip_cache_hit_short_circuits() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(tmp.path());
        let skip = SkipCache::default();
        let path = write_claude_session(tmp.path(), "s-pool.jsonl");

        let (_, mtime) = fingerprint::stat_file(&path).unwrap();
        skip.add(&path, mtime);

        let result = process_file(claude_file(&path), &skip, &store, &ParseOptions::default());
        assert!(matches!(result.outcome, JobOutcome::Skipped));
    }

    #[test]
    fn test_claude_fingerprint_skip_and_placeholder_reparse() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(tmp.path());
        let skip = SkipCache::default();
        let path = write_claude_session(tmp.path(), "s-pool.jsonl");
        let (size, mtime) = fingerprint::stat_file(&path).unwrap();

        let mut session = Session {
            id: "s-pool".into(),
            agent: Agent::Claude,
            project: "p".into(),
            machine: String::new(),
            started_at: None,
            ended_at: None,
            message_count: 1,
            user_message_count: 1,
            first_message: "hi".into(),
            parent_session_id: None,
            file: FileInfo {
                path: path.to_string_lossy().to_string(),
                size,
                mtime_ns: mtime,
                hash: String::new(),
            },
        };
        store.upsert_session(&session).unwrap();

        let result = process_file(claude_file(&path), &skip, &store, &ParseOptions::default());
        assert!(matches!(result.outcome, JobOutcome::Skipped));

        // Same fingerprint but a placeholder project forces a re-parse.
        session.project = "-home-u-p".into();
        store.upsert_session(&session).unwrap();
        let result = process_file(claude_file(&path), &skip, &store, &ParseOptions::default());
        assert!(matches!(result.outcome, JobOutcome::Parsed(..)));
    }

    #[test]
    fn test_missing_file_fails() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(tmp.path());
        let skip = SkipCache::default();

        let result = process_file(
            claude_file(&tmp.path().join("gone.jsonl")),
            &skip,
            &store,
            &ParseOptions::default(),
        );
        assert!(matches!(result.outcome, JobOutcome::Failed(_)));
    }

    #[test]
    fn test_run_drains_every_file() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(tmp.path());
        let skip = SkipCache::default();

        let mut files = Vec::new();
        for i in 0..10 {
            let path = tmp.path().join(format!("s{i}.jsonl"));
            std::fs::write(
                &path,
                format!(
                    r#"{{"type":"user","sessionId":"s{i}","timestamp":"2024-01-01T00:00:00Z","message":{{"content":"hello {i}"}}}}"#
                ),
            )
            .unwrap();
            files.push(claude_file(&path));
        }

        let mut parsed = 0;
        run(files, &skip, &store, ParseOptions::default(), |result| {
            if let JobOutcome::Parsed(session, messages) = &result.outcome {
                assert_eq!(messages.len(), 1);
                assert_eq!(session.agent, Agent::Claude);
                parsed += 1;
            }
        });
        assert_eq!(parsed, 10);
    }
}
