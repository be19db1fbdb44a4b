use std::path::Path;
use walkdir::WalkDir;

use super::classify::Classifier;
use crate::config::RootsConfig;
use crate::models::DiscoveredFile;

/// Enumerate candidate transcripts across every configured root.
///
/// Each agent's root is walked only to the depth its layout needs, and
/// every hit is validated through the classifier, so discovery output
/// and watcher-path classification can never disagree. Results are
/// sorted ascending by path for reproducible reruns and monotone
/// progress. Unreadable directories are skipped silently; symlinked
/// directories are followed.
pub fn discover_all(roots: &RootsConfig, classifier: &Classifier) -> Vec<DiscoveredFile> {
    let mut found = Vec::new();

    for root in roots.claude_roots() {
        walk_into(&root, 2, classifier, &mut found);
    }
    for root in roots.codex_roots() {
        walk_into(&root, 4, classifier, &mut found);
    }
    for root in roots.copilot_roots() {
        walk_into(&root.join("session-state"), 2, classifier, &mut found);
    }
    for root in roots.gemini_roots() {
        walk_into(&root.join("tmp"), 3, classifier, &mut found);
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    found.dedup_by(|a, b| a.path == b.path);

    tracing::debug!("discovery found {} candidate files", found.len());
    found
}

fn walk_into(root: &Path, max_depth: usize, classifier: &Classifier, out: &mut Vec<DiscoveredFile>) {
    if !root.is_dir() {
        return;
    }
    for entry in WalkDir::new(root)
        .max_depth(max_depth)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(found) = classifier.classify(entry.path()) {
            out.push(found);
        }
    }
}
