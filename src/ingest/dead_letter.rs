//! Append-only JSON Lines log of records that could not be processed.
//!
//! One line per [`DeadLetterRecord`]. Lines are never rewritten or removed
//! by the pipeline; replay tooling reads them back with [`DeadLetterLog::read_all`].

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::models::DeadLetterRecord;

pub struct DeadLetterLog {
    path: PathBuf,
    /// Opened lazily so a pipeline that never fails leaves no file behind.
    file: Mutex<Option<File>>,
}

impl DeadLetterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk.
    pub async fn append(&self, record: &DeadLetterRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }

        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Append, logging instead of failing. The record is also echoed to the log
    /// so it is never lost silently.
    pub async fn record(&self, record: DeadLetterRecord) {
        tracing::error!(
            stage = %record.stage,
            error = %record.error,
            "Dead-lettered: {}",
            record.item
        );
        if let Err(e) = self.append(&record).await {
            tracing::error!("Failed to append to dead-letter log {:?}: {}", self.path, e);
        }
    }

    /// Read every record back. Unparseable lines are skipped with a warning.
    pub async fn read_all(&self) -> std::io::Result<Vec<DeadLetterRecord>> {
        read_records(&self.path).await
    }
}

pub async fn read_records(path: &Path) -> std::io::Result<Vec<DeadLetterRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut records = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!("Skipping dead-letter line {}: {}", lineno + 1, e),
        }
    }
    Ok(records)
}
