#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use graphingest::cache::ParseCache;
use graphingest::config::{load_config, IngestConfig, DATA_DIR, DEFAULT_CONFIG};
use graphingest::ingest::batcher::BatchHandler;
use graphingest::ingest::dead_letter::read_records;
use graphingest::ingest::watcher::{path_key, scan_directory, start_watcher};
use graphingest::metrics_http::serve_metrics;
use graphingest::models::Priority;
use graphingest::Pipeline;

#[derive(Parser)]
#[command(name = "graphingest")]
#[command(about = "Incremental source-to-graph ingestion pipeline", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Log level filter (e.g. debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines (also GRAPHINGEST_LOG_JSON=1)
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest the whole tree once, then keep ingesting changes until Ctrl+C
    Watch {
        /// Skip the initial full scan
        #[arg(long)]
        no_scan: bool,
    },

    /// Ingest specific files or directories and exit
    Ingest {
        /// Files or directories (relative to the current directory)
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// critical, normal or batch
        #[arg(long, default_value = "normal")]
        priority: Priority,
    },

    /// Inspect or maintain the parse cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show the most recent dead-letter records
    DeadLetters {
        /// Number of records to show (from end)
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },

    /// Manage project configuration (.graphingest/config.toml)
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry count, limits, size and hit rate
    Stats,
    /// Remove every entry
    Clear,
    /// Delete expired and outdated-schema entries now
    Sweep,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Create default config.toml in .graphingest/
    Init,
    /// Show path to the config file
    Path,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    }
    .canonicalize()?;

    match cli.command {
        Commands::Watch { no_scan } => handle_watch(&root, no_scan),
        Commands::Ingest { paths, priority } => handle_ingest(&root, paths, priority),
        Commands::Cache { action } => handle_cache(&root, action),
        Commands::DeadLetters { lines } => handle_dead_letters(&root, lines),
        Commands::Config { action } => handle_config(&root, action),
    }
}

fn init_logging(level: &str, json: bool) {
    let json = json
        || std::env::var("GRAPHINGEST_LOG_JSON")
            .map(|v| v == "1" || v == "true")
            .unwrap_or(false);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("graphingest={}", level).into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Helper: build a multi-threaded tokio runtime for CLI commands.
fn cli_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

fn project_config(root: &Path) -> IngestConfig {
    let mut config = load_config(&root.join(DATA_DIR));
    config.resolve_paths(root);
    config
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(t), Ok(i)) => (t, i),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!("Failed to register signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("SIGINT received, initiating graceful shutdown");
            }
        }
        token.cancel();
    });
}

// === CLI handlers ===

fn handle_watch(root: &Path, no_scan: bool) -> anyhow::Result<()> {
    let rt = cli_runtime()?;
    rt.block_on(async {
        let config = project_config(root);
        let pipeline = Arc::new(Pipeline::open(root, config.clone()).await?);
        let token = pipeline.shutdown_token.clone();
        spawn_signal_handler(token.clone());

        if let Some(addr) = config.metrics.addr.clone() {
            let metrics = pipeline.metrics.clone();
            let cancel = token.clone();
            tokio::spawn(async move { serve_metrics(&addr, metrics, cancel).await });
        }

        let scan = (!no_scan).then(|| {
            let pipeline = pipeline.clone();
            let root = root.to_path_buf();
            tokio::spawn(async move {
                let watcher_cfg = pipeline.config.watcher.clone();
                let scan_root = root.clone();
                let files = tokio::task::spawn_blocking(move || {
                    scan_directory(&scan_root, &watcher_cfg.ignore, &watcher_cfg.extensions)
                })
                .await?;
                tracing::info!("Initial scan found {} files", files.len());

                let service = pipeline.service.at_priority(Priority::Batch);
                let keys: Vec<String> = files.iter().map(|p| path_key(&root, p)).collect();
                let chunk = pipeline.config.batcher.batch_size_threshold.max(1);
                for batch in keys.chunks(chunk) {
                    service.handle_batch(batch.to_vec()).await?;
                }
                anyhow::Ok(())
            })
        });

        println!("Watching {} (press Ctrl+C to stop)", root.display());
        start_watcher(
            root.to_path_buf(),
            pipeline.batcher.clone(),
            config.watcher.clone(),
            token.clone(),
        )
        .await?;

        if let Some(scan) = scan {
            if !scan.is_finished() {
                scan.abort();
            }
            match scan.await {
                Ok(Err(e)) => tracing::error!("Initial scan failed: {:#}", e),
                Err(e) if !e.is_cancelled() => tracing::error!("Initial scan task failed: {}", e),
                _ => {}
            }
        }

        pipeline.shutdown().await;
        println!("{}", serde_json::to_string_pretty(&pipeline.summary().await)?);
        anyhow::Ok(())
    })
}

fn handle_ingest(root: &Path, paths: Vec<PathBuf>, priority: Priority) -> anyhow::Result<()> {
    let config = project_config(root);

    let mut keys = Vec::new();
    for path in paths {
        let path = path.canonicalize()?;
        if !path.starts_with(root) {
            anyhow::bail!("{} is outside the project root {}", path.display(), root.display());
        }
        if path.is_dir() {
            for file in scan_directory(&path, &config.watcher.ignore, &config.watcher.extensions) {
                keys.push(path_key(root, &file));
            }
        } else {
            keys.push(path_key(root, &path));
        }
    }
    keys.sort();
    keys.dedup();

    let rt = cli_runtime()?;
    rt.block_on(async {
        let pipeline = Pipeline::open(root, config).await?;
        let service = pipeline.service.at_priority(priority);
        let chunk = pipeline.config.batcher.batch_size_threshold.max(1);

        println!("Ingesting {} files at {} priority", keys.len(), priority);
        let mut result = Ok(());
        for batch in keys.chunks(chunk) {
            if let Err(e) = service.handle_batch(batch.to_vec()).await {
                result = Err(e);
                break;
            }
        }

        pipeline.shutdown().await;
        println!("{}", serde_json::to_string_pretty(&pipeline.summary().await)?);
        result
    })
}

fn handle_cache(root: &Path, action: CacheAction) -> anyhow::Result<()> {
    let config = project_config(root);
    let rt = cli_runtime()?;
    rt.block_on(async {
        let cache = ParseCache::open(&config.cache.path, &config.cache).await?;
        match action {
            CacheAction::Stats => {
                let stats = cache.get_stats().await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            CacheAction::Clear => {
                cache.clear().await?;
                println!("Cleared: {}", config.cache.path.display());
            }
            CacheAction::Sweep => {
                let removed = cache.sweep_expired().await?;
                println!("Removed {} expired entries", removed);
            }
        }
        anyhow::Ok(())
    })
}

fn handle_dead_letters(root: &Path, lines: usize) -> anyhow::Result<()> {
    let config = project_config(root);
    let rt = cli_runtime()?;
    rt.block_on(async {
        let records = read_records(&config.writer.dead_letter_path).await?;
        if records.is_empty() {
            eprintln!("No dead-letter records in {}", config.writer.dead_letter_path.display());
            return anyhow::Ok(());
        }
        let start = records.len().saturating_sub(lines);
        for record in &records[start..] {
            println!("{}", serde_json::to_string(record)?);
        }
        anyhow::Ok(())
    })
}

fn handle_config(root: &Path, action: Option<ConfigAction>) -> anyhow::Result<()> {
    let data_dir = root.join(DATA_DIR);
    let config_path = data_dir.join("config.toml");

    match action {
        Some(ConfigAction::Path) => {
            println!("{}", config_path.display());
        }
        Some(ConfigAction::Init) => {
            std::fs::create_dir_all(&data_dir)?;
            if config_path.exists() {
                eprintln!("Config already exists: {}", config_path.display());
                return Ok(());
            }
            std::fs::write(&config_path, DEFAULT_CONFIG)?;
            println!("Created: {}", config_path.display());
        }
        None => {
            let config = load_config(&data_dir);
            println!("# Effective config ({})\n", config_path.display());
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
