use std::path::Path;

use super::writer::{WriteMode, Writer};
use crate::fingerprint;
use crate::models::FileInfo;
use crate::notifications::{self, NotificationSender};
use crate::parsers::opencode;

/// Counters from one database-backed sync pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct DbSyncReport {
    pub total: usize,
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
    pub messages_indexed: usize,
}

/// Virtual path stored as the fingerprint key for a database-backed
/// session. The database is one file, so each session gets a synthetic
/// path scoped to it.
pub fn virtual_path(db_path: &Path, session_id: &str) -> String {
    format!("{}::{}", db_path.display(), session_id)
}

/// Sync every changed session out of one OpenCode database.
///
/// Change detection lists `(session_id, updated)` triples upstream and
/// compares against the stored per-session fingerprint. The upstream
/// store mutates rows in place, so changed sessions always take the
/// full-replace write path. If two snapshots race between the listing
/// and the per-session parse, the later writer wins; there is no retry.
pub fn sync_db(db_path: &Path, writer: &Writer, notify_tx: &NotificationSender) -> DbSyncReport {
    let mut report = DbSyncReport::default();

    if !db_path.is_file() {
        return report;
    }

    let listings = match opencode::list_sessions(db_path) {
        Ok(l) => l,
        Err(e) => {
            let msg = format!("failed to list opencode sessions in {}: {e:#}", db_path.display());
            tracing::warn!("{msg}");
            notifications::warn(notify_tx, msg);
            return report;
        }
    };
    report.total = listings.len();

    // Fallback mtime and the synthetic integrity hash both come from the
    // database file and its WAL sidecar.
    let db_mtime = fingerprint::stat_file(db_path).map(|(_, m)| m).unwrap_or(0);
    let wal_mtime = {
        let mut name = db_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push("-wal");
        fingerprint::stat_file(&db_path.with_file_name(name))
            .map(|(_, m)| m)
            .unwrap_or(0)
    };
    let fallback_mtime = db_mtime.max(wal_mtime);
    let synthetic_hash = fingerprint::hash_bytes(format!("{db_mtime}:{wal_mtime}").as_bytes());

    for listing in listings {
        let vpath = virtual_path(db_path, &listing.session_id);
        let mtime_ns = listing.updated_ns.unwrap_or(fallback_mtime);

        match writer.store().get_file_info_by_path(&vpath) {
            Ok(Some((_, stored_mtime))) if stored_mtime == mtime_ns => {
                report.skipped += 1;
                continue;
            }
            _ => {}
        }

        match opencode::parse_session(db_path, &listing.session_id) {
            Ok(Some((session, messages))) => {
                let file = FileInfo {
                    path: vpath,
                    size: 0,
                    mtime_ns,
                    hash: synthetic_hash.clone(),
                };
                match writer.write(&session, messages, file, WriteMode::Replace) {
                    Ok(inserted) => {
                        report.synced += 1;
                        report.messages_indexed += inserted;
                    }
                    Err(e) => {
                        report.failed += 1;
                        let msg = format!("failed to write {}: {e:#}", session.id);
                        tracing::warn!("{msg}");
                        notifications::warn(notify_tx, msg);
                    }
                }
            }
            // Vanished between the listing and the parse, or empty.
            Ok(None) => report.skipped += 1,
            Err(e) => {
                report.failed += 1;
                let msg = format!(
                    "failed to parse opencode session {}: {e:#}",
                    listing.session_id
                );
                tracing::warn!("{msg}");
                notifications::warn(notify_tx, msg);
            }
        }
    }

    report
}
