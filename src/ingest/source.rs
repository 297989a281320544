use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Where a task reads the bytes behind a key.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// `Ok(None)` when the item no longer exists (deleted between event and task).
    async fn load(&self, key: &str) -> std::io::Result<Option<Vec<u8>>>;
}

/// Reads keys as file paths, relative ones resolved against `root`.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, key: &str) -> PathBuf {
        let path = Path::new(key);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl ContentSource for FsSource {
    async fn load(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
