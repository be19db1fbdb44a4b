use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from `lantern.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LanternConfig {
    /// Where the store lives; `~` resolves against the home directory.
    pub db: String,
    /// Log filter used when the environment supplies none.
    pub log_level: String,
    /// Machine name recorded on every session. Transcripts carry no
    /// hostname, so this is configuration rather than parsing.
    pub machine: String,

    pub roots: RootsConfig,
    pub sync: SyncConfig,
    pub sqlite: SqliteConfig,
}

impl Default for LanternConfig {
    fn default() -> Self {
        Self {
            db: "~/.lantern/lantern.db".to_string(),
            log_level: "info".to_string(),
            machine: default_machine(),
            roots: RootsConfig::default(),
            sync: SyncConfig::default(),
            sqlite: SqliteConfig::default(),
        }
    }
}

impl LanternConfig {
    /// The configured store location as a usable path.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.db)
    }

    pub fn resolved_log_level(&self) -> &str {
        &self.log_level
    }
}

fn default_machine() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

/// Source roots per agent. Each entry is a directory laid out the way
/// that agent writes its transcripts; `opencode` entries point at the
/// embedded database file itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RootsConfig {
    pub claude: Vec<String>,
    pub codex: Vec<String>,
    pub copilot: Vec<String>,
    pub gemini: Vec<String>,
    pub opencode: Vec<String>,
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            claude: vec!["~/.claude/projects".into()],
            codex: vec!["~/.codex/sessions".into()],
            copilot: vec!["~/.copilot".into()],
            gemini: vec!["~/.gemini".into()],
            opencode: vec!["~/.local/share/opencode/opencode.db".into()],
        }
    }
}

impl RootsConfig {
    pub fn claude_roots(&self) -> Vec<PathBuf> {
        self.claude.iter().map(|p| expand_tilde(p)).collect()
    }

    pub fn codex_roots(&self) -> Vec<PathBuf> {
        self.codex.iter().map(|p| expand_tilde(p)).collect()
    }

    pub fn copilot_roots(&self) -> Vec<PathBuf> {
        self.copilot.iter().map(|p| expand_tilde(p)).collect()
    }

    pub fn gemini_roots(&self) -> Vec<PathBuf> {
        self.gemini.iter().map(|p| expand_tilde(p)).collect()
    }

    pub fn opencode_dbs(&self) -> Vec<PathBuf> {
        self.opencode.iter().map(|p| expand_tilde(p)).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Watcher debounce window in milliseconds.
    pub debounce_ms: u64,
    /// Poll cadence for trees the watcher could not cover.
    pub watch_poll_minutes: u32,
    /// Cadence of the background full sync in watch mode.
    pub periodic_sync_minutes: u32,
    /// Pending parse results buffered before a batched write.
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            watch_poll_minutes: 2,
            periodic_sync_minutes: 15,
            batch_size: 100,
        }
    }
}

/// Tuning for the store connection. Sync writes are small and bursty
/// while search reads want warm pages, so the defaults lean toward
/// read caching; the busy timeout covers readers overlapping a WAL
/// checkpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    pub cache_size_mb: u32,
    pub mmap_size_mb: u32,
    pub busy_timeout_ms: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            cache_size_mb: 64,
            mmap_size_mb: 256,
            busy_timeout_ms: 5000,
        }
    }
}

/// Resolve a leading `~` or `~/` against the home directory. Anything
/// else, including names that merely start with a tilde (`~backup`),
/// passes through untouched.
pub fn expand_tilde(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let (Some(rest), Some(home)) = (raw.strip_prefix("~/"), dirs::home_dir()) {
        return home.join(rest);
    }
    PathBuf::from(raw)
}

/// `~/.lantern`, the directory holding the config file and the default
/// database. Falls back to the working directory when home is unknown.
pub fn lantern_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lantern")
}

pub fn default_config_path() -> PathBuf {
    lantern_home().join("lantern.toml")
}

/// Read `lantern.toml`. A path given explicitly must exist; the default
/// location is optional, and its absence just means defaults.
pub fn load_config(path: Option<&Path>) -> Result<LanternConfig> {
    let (config_path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path(), false),
    };

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
            return Ok(LanternConfig::default());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config {}", config_path.display()));
        }
    };

    toml::from_str(&contents)
        .with_context(|| format!("invalid config in {}", config_path.display()))
}
