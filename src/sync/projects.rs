use serde::Deserialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

use crate::fingerprint::hash_bytes;
use crate::parsers::normalize_project;

// ---------------------------------------------------------------------------
// Gemini CLI project metadata files
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ProjectsFile {
    #[serde(default)]
    projects: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustedFoldersFile {
    #[serde(default)]
    trusted_folders: Vec<String>,
}

/// Resolves Gemini `tmp/<dir>` names to project names.
///
/// Legacy dirs are the lowercase hex SHA-256 of the absolute project
/// path; newer CLIs use the short name directly. The map is built from
/// `projects.json` and `trustedFolders.json` under the Gemini root,
/// keyed by both the hash and the path's final segment.
#[derive(Debug, Default, Clone)]
pub struct GeminiProjectMap {
    by_dir: HashMap<String, String>,
}

const HEX_HASH_LEN: usize = 64;

impl GeminiProjectMap {
    /// Load the map from a Gemini root. Missing or malformed metadata
    /// files degrade to an empty map; resolution still works via the
    /// name-based fallbacks.
    pub fn load(gemini_root: &Path) -> Self {
        let mut map = Self::default();

        // projects.json wins over trustedFolders.json; within each file
        // entries are first-seen-wins when sorted by path.
        let projects: ProjectsFile = read_json(&gemini_root.join("projects.json"));
        for (abs_path, short_name) in &projects.projects {
            map.insert(abs_path, short_name.clone());
        }

        let trusted: TrustedFoldersFile = read_json(&gemini_root.join("trustedFolders.json"));
        let mut folders = trusted.trusted_folders;
        folders.sort();
        for abs_path in &folders {
            let short = normalize_project(last_segment(abs_path));
            map.insert(abs_path, short);
        }

        map
    }

    fn insert(&mut self, abs_path: &str, short_name: String) {
        let hash = hash_bytes(abs_path.as_bytes());
        self.by_dir.entry(hash).or_insert_with(|| short_name.clone());
        let segment = last_segment(abs_path);
        if !segment.is_empty() {
            self.by_dir.entry(segment.to_string()).or_insert(short_name);
        }
    }

    /// Resolve a `tmp/<dir>` name to a project name.
    pub fn resolve(&self, dir: &str) -> String {
        if let Some(name) = self.by_dir.get(dir) {
            return name.clone();
        }
        if is_hex_hash(dir) {
            return "unknown".to_string();
        }
        normalize_project(dir)
    }
}

fn read_json<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
            tracing::warn!("failed to parse {}: {e}", path.display());
            T::default()
        }),
        Err(_) => T::default(),
    }
}

fn last_segment(path: &str) -> &str {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
}

fn is_hex_hash(dir: &str) -> bool {
    dir.len() == HEX_HASH_LEN && dir.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
