use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::batcher::Batcher;
use crate::config::{WatcherConfig, DATA_DIR};

/// Key under which a file travels through the pipeline: its path relative to
/// the watched root, with forward slashes.
pub fn path_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.to_string_lossy().replace('\\', "/")
}

/// Gitignore matcher for the project plus our own always-ignored entries.
pub fn build_gitignore(root: &Path, extra_ignores: &[String]) -> Gitignore {
    let mut builder = GitignoreBuilder::new(root);

    let _ = builder.add_line(None, ".git");
    let _ = builder.add_line(None, DATA_DIR);
    for pattern in extra_ignores {
        let _ = builder.add_line(None, pattern);
    }

    let gitignore_path = root.join(".gitignore");
    if gitignore_path.exists() {
        if let Some(e) = builder.add(&gitignore_path) {
            tracing::warn!("Ignoring malformed .gitignore entries: {}", e);
        }
    }

    builder.build().unwrap_or_else(|_| Gitignore::empty())
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Keys worth ingesting from one notify event.
fn event_keys(
    event: &Event,
    root: &Path,
    gitignore: &Gitignore,
    extensions: &[String],
) -> Vec<String> {
    if matches!(event.kind, EventKind::Access(_) | EventKind::Other) {
        return Vec::new();
    }

    event
        .paths
        .iter()
        .filter(|path| path.starts_with(root) && has_extension(path, extensions))
        .filter(|path| {
            !gitignore
                .matched_path_or_any_parents(path, path.is_dir())
                .is_ignore()
        })
        .map(|path| path_key(root, path))
        .collect()
}

/// Feed file-change events under `root` into the batcher until cancelled.
/// Deletions are forwarded too; the task finds nothing to load and skips.
pub async fn start_watcher(
    root: PathBuf,
    batcher: Arc<Batcher>,
    config: WatcherConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let gitignore = build_gitignore(&root, &config.ignore);
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })
    .context("Failed to create file watcher")?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {:?}", root))?;

    tracing::info!("File watcher started for: {:?}", root);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(Ok(event)) => {
                    for key in event_keys(&event, &root, &gitignore, &config.extensions) {
                        tracing::debug!("File event: {:?} {}", event.kind, key);
                        batcher.add_event(key);
                    }
                }
                Some(Err(e)) => tracing::error!("Watcher error: {:?}", e),
                None => {
                    tracing::info!("Watcher channel closed");
                    break;
                }
            }
        }
    }

    tracing::info!("Watcher stopped for: {:?}", root);
    Ok(())
}

/// Every ingestible file under `root`, honouring .gitignore and extra ignores.
pub fn scan_directory(root: &Path, extra_ignores: &[String], extensions: &[String]) -> Vec<PathBuf> {
    use ignore::WalkBuilder;

    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .require_git(false);

    let mut overrides = ignore::overrides::OverrideBuilder::new(root);
    for pattern in extra_ignores {
        if let Err(e) = overrides.add(&format!("!{}", pattern)) {
            tracing::warn!("Invalid ignore pattern {:?}: {}", pattern, e);
        }
    }
    match overrides.build() {
        Ok(ov) => {
            builder.overrides(ov);
        }
        Err(e) => tracing::warn!("Failed to build ignore overrides: {}", e),
    }

    let mut files: Vec<PathBuf> = builder
        .build()
        .flatten()
        .map(|entry| entry.into_path())
        .filter(|path| path.is_file() && has_extension(path, extensions))
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use tempfile::TempDir;

    fn exts() -> Vec<String> {
        vec!["rs".into(), "py".into(), "sql".into()]
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x").unwrap();
    }

    #[test]
    fn test_scan_respects_gitignore_and_extensions() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join(".gitignore"), "build/\n").unwrap();
        for rel in ["a.rs", "b.py", "notes.txt", "sql/c.sql", "build/gen.rs", "vendor/v.rs"] {
            touch(root, rel);
        }
        touch(root, ".graphingest/cache.sql");

        let keys: Vec<String> = scan_directory(root, &["vendor".to_string()], &exts())
            .iter()
            .map(|p| path_key(root, p))
            .collect();
        assert_eq!(keys, vec!["a.rs", "b.py", "sql/c.sql"]);
    }

    #[test]
    fn test_gitignore_defaults() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let gi = build_gitignore(root, &["*.gen.rs".to_string()]);

        let ignored = |rel: &str| {
            gi.matched_path_or_any_parents(root.join(rel), false)
                .is_ignore()
        };
        assert!(ignored(".git/config"));
        assert!(ignored(".graphingest/parse_cache.sqlite"));
        assert!(ignored("src/model.gen.rs"));
        assert!(!ignored("src/model.rs"));
    }

    #[test]
    fn test_event_keys_filtering() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let gi = build_gitignore(root, &[]);

        let created = Event::new(EventKind::Create(CreateKind::File))
            .add_path(root.join("src/lib.rs"))
            .add_path(root.join("README.md"))
            .add_path(root.join(".git/HEAD.rs"));
        assert_eq!(event_keys(&created, root, &gi, &exts()), vec!["src/lib.rs"]);

        let modified = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(root.join("q.SQL"));
        assert_eq!(event_keys(&modified, root, &gi, &exts()), vec!["q.SQL"]);

        let read = Event::new(EventKind::Access(AccessKind::Any)).add_path(root.join("a.rs"));
        assert!(event_keys(&read, root, &gi, &exts()).is_empty());
    }
}
