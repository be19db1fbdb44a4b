pub mod classify;
pub mod discovery;
pub mod opencode;
pub mod pool;
pub mod projects;
pub mod skip;
pub mod watcher;
pub mod writer;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use classify::Classifier;
use pool::JobOutcome;
use skip::SkipCache;
use writer::{WriteMode, Writer};

use crate::config::LanternConfig;
use crate::fingerprint;
use crate::models::{
    Agent, DiscoveredFile, FileInfo, ParsedMessage, ParsedSession, Progress, SyncPhase, SyncStats,
};
use crate::notifications::{self, NotificationSender};
use crate::parsers::{self, ParseOptions};
use crate::store::Store;

pub type ProgressFn = dyn Fn(Progress) + Send + Sync;

/// The one operation with a caller-visible failure contract. Full and
/// path-scoped syncs degrade instead and report through `SyncStats`.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no session source found for '{0}'")]
    NotFound(String),
    #[error("source for '{0}' is not an interactive session")]
    NonInteractive(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Long-lived orchestrator. Owns the skip cache and the published
/// stats; serializes every sync behind one mutex so overlapping calls
/// never interleave writes.
pub struct Engine {
    store: Arc<Store>,
    classifier: Classifier,
    writer: Writer,
    skip: SkipCache,
    config: LanternConfig,
    /// Serializes sync_all / sync_paths / resync_all. Held for the
    /// duration of a pass; the skip lock nests inside it, never the
    /// other way around.
    sync_mu: Mutex<()>,
    stats: Mutex<SyncStats>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    notify_tx: NotificationSender,
}

impl Engine {
    /// Initialize at startup: hydrate the persisted skip cache and build
    /// the classifier from the configured roots.
    pub fn new(store: Arc<Store>, config: LanternConfig) -> Result<Self> {
        let skip = SkipCache::hydrate(&store)?;
        let classifier = Classifier::new(&config.roots);
        let writer = Writer::new(store.clone(), config.machine.clone());

        Ok(Self {
            store,
            classifier,
            writer,
            skip,
            config,
            sync_mu: Mutex::new(()),
            stats: Mutex::new(SyncStats::default()),
            last_sync: Mutex::new(None),
            notify_tx: notifications::create_channel(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn notifications(&self) -> NotificationSender {
        self.notify_tx.clone()
    }

    /// Counters from the most recent completed sync.
    pub fn stats(&self) -> SyncStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every configured watchable root (OpenCode contributes the
    /// directory holding the database).
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let roots = &self.config.roots;
        let mut all: Vec<PathBuf> = Vec::new();
        all.extend(roots.claude_roots());
        all.extend(roots.codex_roots());
        all.extend(roots.copilot_roots());
        all.extend(roots.gemini_roots());
        for db in roots.opencode_dbs() {
            if let Some(parent) = db.parent() {
                all.push(parent.to_path_buf());
            }
        }
        all.sort();
        all.dedup();
        all
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Full enumeration, parallel parse, batched write. Serialized: two
    /// overlapping calls run one after the other.
    pub fn sync_all(&self, on_progress: Option<&ProgressFn>) -> SyncStats {
        let _guard = self.sync_mu.lock().unwrap_or_else(|e| e.into_inner());
        self.sync_all_locked(on_progress)
    }

    fn sync_all_locked(&self, on_progress: Option<&ProgressFn>) -> SyncStats {
        emit(on_progress, Progress {
            phase: SyncPhase::Discovering,
            sessions_total: 0,
            sessions_done: 0,
            messages_indexed: 0,
        });

        let files = discovery::discover_all(&self.config.roots, &self.classifier);
        let dbs = self.config.roots.opencode_dbs();
        self.run_pipeline(files, &dbs, on_progress)
    }

    /// Watcher entry point: classify the changed paths and run the same
    /// pipeline bounded to the matches. Takes the same serialization
    /// lock as a full sync, so events queued during one are processed
    /// after it returns.
    pub fn sync_paths(&self, paths: &[PathBuf]) -> SyncStats {
        let mut files: Vec<DiscoveredFile> = Vec::new();
        let mut dbs: BTreeSet<PathBuf> = BTreeSet::new();

        for path in paths {
            match self.classifier.classify(path) {
                Some(found) if found.agent == Agent::OpenCode => {
                    dbs.insert(found.path);
                }
                Some(found) => files.push(found),
                // Classifier rejects are dropped silently and not counted.
                None => {}
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);

        if files.is_empty() && dbs.is_empty() {
            return SyncStats::default();
        }

        tracing::debug!("path-scoped sync over {} files, {} dbs", files.len(), dbs.len());
        let dbs: Vec<PathBuf> = dbs.into_iter().collect();
        let _guard = self.sync_mu.lock().unwrap_or_else(|e| e.into_inner());
        self.run_pipeline(files, &dbs, None)
    }

    /// Clear every skip decision and fingerprint, then run a full sync
    /// under the same lock. Used after schema or parser changes.
    pub fn resync_all(&self, on_progress: Option<&ProgressFn>) -> SyncStats {
        let _guard = self.sync_mu.lock().unwrap_or_else(|e| e.into_inner());

        self.skip.clear();
        if let Err(e) = self.skip.persist(&self.store) {
            tracing::warn!("failed to clear persisted skip cache: {e:#}");
        }
        if let Err(e) = self.store.reset_all_mtimes() {
            tracing::warn!("failed to reset stored mtimes: {e:#}");
        }

        self.sync_all_locked(on_progress)
    }

    /// Force one session back into the store, replacing its messages.
    pub fn sync_single_session(&self, id: &str) -> Result<(), SyncError> {
        let _guard = self.sync_mu.lock().unwrap_or_else(|e| e.into_inner());

        // Prefer the stored source; fall back to discovery for sessions
        // the store has never seen.
        let file = match self.store.get_session(id).ok().flatten().or_else(|| {
            self.store.find_session_by_id_prefix(id).ok().flatten()
        }) {
            Some(session) if session.agent == Agent::OpenCode => {
                return self.resync_opencode_session(&session.id, &session.file.path);
            }
            Some(session) => {
                let path = PathBuf::from(&session.file.path);
                self.classifier.classify(&path).unwrap_or(DiscoveredFile {
                    path,
                    agent: session.agent,
                    project: None,
                })
            }
            None => self
                .find_source_by_prefix(id)
                .ok_or_else(|| SyncError::NotFound(id.to_string()))?,
        };

        self.skip.remove(&file.path);
        if let Err(e) = self
            .store
            .delete_skipped_file(&file.path.to_string_lossy())
        {
            tracing::warn!("failed to drop skip entry: {e:#}");
        }

        let mut outcome = parsers::parse(&file, &ParseOptions::default())
            .map_err(SyncError::Other)?;
        if outcome.is_none() && file.agent == Agent::Codex {
            // Exec rollouts hide from the default pass.
            outcome = parsers::parse(&file, &ParseOptions { include_exec: true })
                .map_err(SyncError::Other)?;
        }
        let Some((session, messages)) = outcome else {
            return Err(SyncError::NonInteractive(id.to_string()));
        };

        let (size, mtime_ns) = fingerprint::stat_file(&file.path).map_err(SyncError::Other)?;
        let hash = fingerprint::hash_file(&file.path).unwrap_or_default();
        let info = FileInfo {
            path: file.path.to_string_lossy().to_string(),
            size,
            mtime_ns,
            hash,
        };

        self.writer
            .write(&session, messages, info, WriteMode::Replace)
            .map_err(SyncError::Other)?;
        Ok(())
    }

    fn resync_opencode_session(&self, id: &str, stored_vpath: &str) -> Result<(), SyncError> {
        let (db_str, raw_id) = stored_vpath
            .rsplit_once("::")
            .ok_or_else(|| SyncError::NotFound(id.to_string()))?;
        let db_path = Path::new(db_str);

        let outcome =
            parsers::opencode::parse_session(db_path, raw_id).map_err(SyncError::Other)?;
        let Some((session, messages)) = outcome else {
            return Err(SyncError::NonInteractive(id.to_string()));
        };

        let mtime_ns = fingerprint::stat_file(db_path).map(|(_, m)| m).unwrap_or(0);
        let info = FileInfo {
            path: stored_vpath.to_string(),
            size: 0,
            mtime_ns,
            hash: String::new(),
        };
        self.writer
            .write(&session, messages, info, WriteMode::Replace)
            .map_err(SyncError::Other)?;
        Ok(())
    }

    /// Match a session id prefix against discovery output using the
    /// identities the filenames encode.
    fn find_source_by_prefix(&self, id: &str) -> Option<DiscoveredFile> {
        let bare = id.split_once(':').map(|(_, r)| r).unwrap_or(id);
        if bare.is_empty() {
            return None;
        }

        discovery::discover_all(&self.config.roots, &self.classifier)
            .into_iter()
            .find(|file| {
                let stem = file
                    .path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                match file.agent {
                    Agent::Claude => stem.starts_with(bare),
                    Agent::Codex => parsers::codex::uuid_from_stem(&stem)
                        .is_some_and(|uuid| uuid.starts_with(bare)),
                    Agent::Copilot => {
                        if stem == "events" {
                            file.path
                                .parent()
                                .and_then(|p| p.file_name())
                                .is_some_and(|n| n.to_string_lossy().starts_with(bare))
                        } else {
                            stem.starts_with(bare)
                        }
                    }
                    // Gemini ids live inside the file; a forced sync of
                    // an undiscovered Gemini session goes through
                    // sync_all instead.
                    Agent::Gemini | Agent::OpenCode => false,
                }
            })
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    /// The shared worker/writer pipeline. Caller holds the sync lock.
    fn run_pipeline(
        &self,
        files: Vec<DiscoveredFile>,
        opencode_dbs: &[PathBuf],
        on_progress: Option<&ProgressFn>,
    ) -> SyncStats {
        let started = std::time::Instant::now();
        let mut stats = SyncStats {
            total_sessions: files.len(),
            ..Default::default()
        };

        let batch_size = self.config.sync.batch_size.max(1);
        let mut batch: Vec<(ParsedSession, Vec<ParsedMessage>, FileInfo)> =
            Vec::with_capacity(batch_size);
        let mut done = 0usize;
        let total = files.len();

        let mut messages_indexed = 0usize;

        let flush = |batch: &mut Vec<(ParsedSession, Vec<ParsedMessage>, FileInfo)>,
                     stats: &mut SyncStats,
                     messages_indexed: &mut usize| {
            for (session, messages, info) in batch.drain(..) {
                match self.writer.write(&session, messages, info, WriteMode::Append) {
                    Ok(inserted) => {
                        stats.synced += 1;
                        *messages_indexed += inserted;
                    }
                    Err(e) => {
                        // One bad session never aborts the pass.
                        stats.failed += 1;
                        stats.warnings += 1;
                        let msg = format!("failed to write {}: {e:#}", session.id);
                        tracing::warn!("{msg}");
                        notifications::warn(&self.notify_tx, msg);
                    }
                }
            }
        };

        pool::run(
            files,
            &self.skip,
            &self.store,
            ParseOptions::default(),
            |result| {
                match result.outcome {
                    JobOutcome::Skipped => stats.skipped += 1,
                    JobOutcome::NonInteractive => {
                        self.skip.add(&result.file.path, result.mtime_ns);
                        stats.skipped += 1;
                    }
                    JobOutcome::Failed(reason) => {
                        self.skip.add(&result.file.path, result.mtime_ns);
                        stats.failed += 1;
                        stats.warnings += 1;
                        let msg = format!("{}: {reason}", result.file.path.display());
                        tracing::warn!("{msg}");
                        notifications::warn(&self.notify_tx, msg);
                    }
                    JobOutcome::Parsed(session, messages) => {
                        self.skip.remove(&result.file.path);
                        let info = FileInfo {
                            path: result.file.path.to_string_lossy().to_string(),
                            size: result.size,
                            mtime_ns: result.mtime_ns,
                            hash: result.hash,
                        };
                        batch.push((session, messages, info));
                        if batch.len() >= batch_size {
                            flush(&mut batch, &mut stats, &mut messages_indexed);
                        }
                    }
                }

                done += 1;
                emit(on_progress, Progress {
                    phase: SyncPhase::Syncing,
                    sessions_total: total,
                    sessions_done: done,
                    messages_indexed,
                });
            },
        );

        flush(&mut batch, &mut stats, &mut messages_indexed);

        for db in opencode_dbs {
            let report = opencode::sync_db(db, &self.writer, &self.notify_tx);
            stats.total_sessions += report.total;
            stats.synced += report.synced;
            stats.skipped += report.skipped;
            stats.failed += report.failed;
            stats.warnings += report.failed;
            messages_indexed += report.messages_indexed;
        }

        if let Err(e) = self.skip.persist(&self.store) {
            tracing::warn!("failed to persist skip cache: {e:#}");
        }

        emit(on_progress, Progress {
            phase: SyncPhase::Done,
            sessions_total: stats.total_sessions,
            sessions_done: done,
            messages_indexed,
        });

        tracing::info!("sync complete in {:.1}s: {stats}", started.elapsed().as_secs_f64());

        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = stats;
        *self.last_sync.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        stats
    }
}

fn emit(on_progress: Option<&ProgressFn>, progress: Progress) {
    if let Some(f) = on_progress {
        f(progress);
    }
}
