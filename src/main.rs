use clap::{Parser, Subcommand};
use lantern::config::{self, LanternConfig};
use lantern::store::Store;
use lantern::sync::watcher::FsWatcher;
use lantern::sync::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "lantern", version, about = "Sync AI coding-agent sessions into a local searchable store")]
struct Cli {
    /// Custom database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to config file (default: ~/.lantern/lantern.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync pass over every configured root
    Sync {
        /// Drop all skip decisions and fingerprints first
        #[arg(long)]
        full: bool,
    },

    /// Sync continuously: watch the roots and re-sync on change
    Watch,

    /// Force one session back into the store by id (prefixes allowed)
    Session {
        /// Session id or unique prefix
        id: String,
    },

    /// Full-text search across indexed messages
    Search {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Write a default config file to ~/.lantern/lantern.toml
    Init,
}

fn main() {
    let cli = Cli::parse();

    // Load config before tracing init so log_level from config works.
    let cfg = match config::load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config: {e:#}");
            std::process::exit(1);
        }
    };

    // Priority: RUST_LOG env > config file log_level > "info"
    let log_level = cfg.resolved_log_level().to_string();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    match cli.command {
        Commands::Init => run_init(),
        Commands::Sync { full } => run_sync(&cli, cfg, full),
        Commands::Watch => run_watch(&cli, cfg),
        Commands::Session { ref id } => run_session(&cli, cfg.clone(), id),
        Commands::Search { ref query, limit } => run_search(&cli, &cfg, query, limit),
    }
}

fn resolve_db_path(cli: &Cli, cfg: &LanternConfig) -> PathBuf {
    cli.db.clone().unwrap_or_else(|| cfg.resolved_db_path())
}

/// Open the store and build the engine. The store open is the only
/// fatal failure in the process.
fn build_engine(cli: &Cli, cfg: LanternConfig) -> Arc<Engine> {
    let db_path = resolve_db_path(cli, &cfg);
    let store = match Store::open(&db_path, &cfg.sqlite) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("failed to open store: {e:#}");
            std::process::exit(1);
        }
    };
    match Engine::new(store, cfg) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("failed to initialize sync engine: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run_init() {
    let path = config::default_config_path();
    if path.exists() {
        eprintln!("config file already exists: {}", path.display());
        std::process::exit(1);
    }
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("failed to create directory {}: {e}", parent.display());
            std::process::exit(1);
        }
    }
    let template = include_str!("config_template.toml");
    if let Err(e) = std::fs::write(&path, template) {
        eprintln!("failed to write config file: {e}");
        std::process::exit(1);
    }
    println!("wrote default config to {}", path.display());
}

fn run_sync(cli: &Cli, cfg: LanternConfig, full: bool) {
    let engine = build_engine(cli, cfg);
    let stats = if full {
        engine.resync_all(None)
    } else {
        engine.sync_all(None)
    };
    println!("{stats}");
}

fn run_session(cli: &Cli, cfg: LanternConfig, id: &str) {
    let engine = build_engine(cli, cfg);
    match engine.sync_single_session(id) {
        Ok(()) => println!("session '{id}' re-synced"),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn run_search(cli: &Cli, cfg: &LanternConfig, query: &str, limit: u32) {
    let db_path = resolve_db_path(cli, cfg);
    let store = match Store::open(&db_path, &cfg.sqlite) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to open store: {e:#}");
            std::process::exit(1);
        }
    };
    match store.search(query, limit) {
        Ok(hits) => {
            for hit in hits {
                println!("{}#{}: {}", hit.session_id, hit.ordinal, hit.snippet);
            }
        }
        Err(e) => {
            eprintln!("search failed: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run_watch(cli: &Cli, cfg: LanternConfig) {
    let debounce = Duration::from_millis(cfg.sync.debounce_ms);
    let poll_interval = Duration::from_secs(cfg.sync.watch_poll_minutes as u64 * 60);
    let periodic_interval = Duration::from_secs(cfg.sync.periodic_sync_minutes as u64 * 60);

    let engine = build_engine(cli, cfg);

    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    rt.block_on(async {
        // Catch up before watching.
        let initial = {
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || engine.sync_all(None))
                .await
                .expect("initial sync panicked")
        };
        tracing::info!("initial sync: {initial}");

        let watcher = {
            let engine = engine.clone();
            match FsWatcher::new(debounce, move |paths| {
                engine.sync_paths(&paths);
            }) {
                Ok(w) => w,
                Err(e) => {
                    eprintln!("failed to start watcher: {e:#}");
                    std::process::exit(1);
                }
            }
        };

        let mut fully_watched = true;
        for root in engine.watch_roots() {
            let stats = watcher.watch_recursive(&root);
            tracing::info!(
                "watching {} ({} dirs, {} unwatchable)",
                root.display(),
                stats.watched,
                stats.unwatched
            );
            if stats.unwatched > 0 {
                fully_watched = false;
            }
        }

        // Periodic full sync, plus a tighter poll when some tree could
        // not be watched.
        {
            let engine = engine.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(periodic_interval).await;
                    let engine = engine.clone();
                    let _ = tokio::task::spawn_blocking(move || engine.sync_all(None)).await;
                }
            });
        }
        if !fully_watched {
            tracing::warn!("some roots are not watchable; polling every {poll_interval:?}");
            let engine = engine.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(poll_interval).await;
                    let engine = engine.clone();
                    let _ = tokio::task::spawn_blocking(move || engine.sync_all(None)).await;
                }
            });
        }

        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down");
        watcher.stop();
    });
}
