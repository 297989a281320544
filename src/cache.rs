//! Persistent parse-result cache keyed by a hash of the input content.
//!
//! Identity is the blake3 hash of the content bytes alone, so a file that is
//! renamed or re-ingested with identical bytes is still a hit. Entries expire
//! after a TTL, are invalidated by a schema-version bump, and are evicted in
//! least-recently-accessed order when a write pushes the table over its limit.

use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::metrics::PipelineMetrics;

pub type Result<T> = std::result::Result<T, CacheError>;

pub type ContentHash = [u8; 32];

/// Stable content hash used as the cache key.
pub fn content_hash(content: &[u8]) -> ContentHash {
    *blake3::hash(content).as_bytes()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct ParseCache {
    pool: SqlitePool,
    /// Single-writer discipline; readers go straight to the pool (WAL).
    write_lock: Mutex<()>,
    ttl: Duration,
    max_entries: usize,
    schema_version: i64,
    /// Logical access clock; orders entries touched within the same millisecond.
    tick: AtomicI64,
    hits: AtomicU64,
    misses: AtomicU64,
    lru_evictions: AtomicU64,
    ttl_evictions: AtomicU64,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl ParseCache {
    /// Open (or create) the cache database at `path`.
    pub async fn open(path: &Path, config: &CacheConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let cache = Self {
            pool,
            write_lock: Mutex::new(()),
            ttl: config.ttl(),
            max_entries: config.max_entries.max(1),
            schema_version: config.schema_version,
            tick: AtomicI64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lru_evictions: AtomicU64::new(0),
            ttl_evictions: AtomicU64::new(0),
            metrics: None,
        };
        cache.migrate().await?;

        let max_tick: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(access_tick), 0) FROM parse_cache")
                .fetch_one(&cache.pool)
                .await?;
        cache.tick.store(max_tick, Ordering::SeqCst);

        tracing::info!(
            "Parse cache opened at {:?} (schema v{}, max {} entries)",
            path,
            cache.schema_version,
            cache.max_entries
        );
        Ok(cache)
    }

    /// Report hits and misses to the shared pipeline metrics as well.
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS parse_cache (
                content_hash      BLOB PRIMARY KEY,
                serialized_result BLOB NOT NULL,
                created_at        INTEGER NOT NULL,
                last_accessed_at  INTEGER NOT NULL,
                access_tick       INTEGER NOT NULL,
                schema_version    INTEGER NOT NULL,
                size_bytes        INTEGER NOT NULL,
                source_name       TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_parse_cache_access ON parse_cache(access_tick)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn next_tick(&self) -> i64 {
        self.tick.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            PipelineMetrics::incr(&m.cache_hits);
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            PipelineMetrics::incr(&m.cache_misses);
        }
    }

    /// Look up without touching the hit/miss counters.
    async fn lookup(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        let row = match sqlx::query(
            "SELECT serialized_result, created_at, schema_version FROM parse_cache WHERE content_hash = ?",
        )
        .bind(&hash[..])
        .fetch_optional(&self.pool)
        .await
        {
            Ok(row) => row?,
            Err(e) => {
                tracing::warn!("Parse cache read failed, treating as miss: {}", e);
                return None;
            }
        };

        let created_at: i64 = row.get("created_at");
        let schema_version: i64 = row.get("schema_version");

        if schema_version != self.schema_version {
            tracing::debug!(
                "Parse cache entry has schema v{} (current v{}), dropping",
                schema_version,
                self.schema_version
            );
            self.delete(hash).await;
            return None;
        }

        if now_millis().saturating_sub(created_at) > self.ttl.as_millis() as i64 {
            self.ttl_evictions.fetch_add(1, Ordering::Relaxed);
            self.delete(hash).await;
            return None;
        }

        let value: Vec<u8> = row.get("serialized_result");
        self.touch(hash).await;
        Some(value)
    }

    async fn touch(&self, hash: &ContentHash) {
        let _guard = self.write_lock.lock().await;
        if let Err(e) = sqlx::query(
            "UPDATE parse_cache SET last_accessed_at = ?, access_tick = ? WHERE content_hash = ?",
        )
        .bind(now_millis())
        .bind(self.next_tick())
        .bind(&hash[..])
        .execute(&self.pool)
        .await
        {
            tracing::warn!("Parse cache access update failed: {}", e);
        }
    }

    async fn delete(&self, hash: &ContentHash) {
        let _guard = self.write_lock.lock().await;
        if let Err(e) = sqlx::query("DELETE FROM parse_cache WHERE content_hash = ?")
            .bind(&hash[..])
            .execute(&self.pool)
            .await
        {
            tracing::warn!("Parse cache delete failed: {}", e);
        }
    }

    /// Raw cached bytes for `content`, or `None` on miss.
    pub async fn get(&self, content: &[u8]) -> Option<Vec<u8>> {
        let result = self.lookup(&content_hash(content)).await;
        if result.is_some() {
            self.record_hit();
        } else {
            self.record_miss();
        }
        result
    }

    /// Typed lookup. Undecodable entries are deleted and reported as misses.
    pub async fn get_json<T: DeserializeOwned>(&self, content: &[u8]) -> Option<T> {
        let hash = content_hash(content);
        let Some(bytes) = self.lookup(&hash).await else {
            self.record_miss();
            return None;
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                self.record_hit();
                Some(value)
            }
            Err(e) => {
                tracing::warn!("Parse cache entry is corrupt, recomputing: {}", e);
                self.delete(&hash).await;
                self.record_miss();
                None
            }
        }
    }

    /// Upsert the result for `content`, then evict down to `max_entries`.
    pub async fn set(&self, content: &[u8], value: &[u8], source_name: &str) -> Result<()> {
        let hash = content_hash(content);
        let now = now_millis();

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO parse_cache
                (content_hash, serialized_result, created_at, last_accessed_at,
                 access_tick, schema_version, size_bytes, source_name)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO UPDATE SET
                serialized_result = excluded.serialized_result,
                created_at = excluded.created_at,
                last_accessed_at = excluded.last_accessed_at,
                access_tick = excluded.access_tick,
                schema_version = excluded.schema_version,
                size_bytes = excluded.size_bytes,
                source_name = excluded.source_name
            "#,
        )
        .bind(&hash[..])
        .bind(value)
        .bind(now)
        .bind(now)
        .bind(self.next_tick())
        .bind(self.schema_version)
        .bind(value.len() as i64)
        .bind(source_name)
        .execute(&mut *tx)
        .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parse_cache")
            .fetch_one(&mut *tx)
            .await?;
        let excess = count - self.max_entries as i64;
        if excess > 0 {
            let evicted = sqlx::query(
                r#"
                DELETE FROM parse_cache WHERE content_hash IN (
                    SELECT content_hash FROM parse_cache ORDER BY access_tick ASC LIMIT ?
                )
                "#,
            )
            .bind(excess)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            self.lru_evictions.fetch_add(evicted, Ordering::Relaxed);
            tracing::debug!("Parse cache evicted {} LRU entries", evicted);
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_json<T: Serialize>(
        &self,
        content: &[u8],
        value: &T,
        source_name: &str,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(content, &bytes, source_name).await
    }

    /// Remove every entry and reset counters.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("DELETE FROM parse_cache")
            .execute(&self.pool)
            .await?;
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.lru_evictions.store(0, Ordering::Relaxed);
        self.ttl_evictions.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Delete expired and wrong-schema entries eagerly. Returns rows removed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let cutoff = now_millis() - self.ttl.as_millis() as i64;
        let _guard = self.write_lock.lock().await;
        let removed = sqlx::query(
            "DELETE FROM parse_cache WHERE created_at < ? OR schema_version != ?",
        )
        .bind(cutoff)
        .bind(self.schema_version)
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.ttl_evictions.fetch_add(removed, Ordering::Relaxed);
        if removed > 0 {
            tracing::info!("Parse cache sweep removed {} entries", removed);
        }
        Ok(removed)
    }

    /// Rows physically present, regardless of schema or age.
    pub async fn entry_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parse_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn get_stats(&self) -> Result<CacheStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS entries, COALESCE(SUM(size_bytes), 0) AS payload FROM parse_cache",
        )
        .fetch_one(&self.pool)
        .await?;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;

        let mut stats = CacheStats {
            entries: row.get::<i64, _>("entries") as usize,
            max_entries: self.max_entries,
            ttl_days: self.ttl.as_secs() / 86_400,
            schema_version: self.schema_version,
            payload_bytes: row.get::<i64, _>("payload") as u64,
            storage_bytes: (page_count * page_size) as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: 0.0,
            lru_evictions: self.lru_evictions.load(Ordering::Relaxed),
            ttl_evictions: self.ttl_evictions.load(Ordering::Relaxed),
        };
        stats.calculate_hit_rate();
        Ok(stats)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub ttl_days: u64,
    pub schema_version: i64,
    pub payload_bytes: u64,
    /// Approximate on-disk size of the main database file
    pub storage_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f32,
    pub lru_evictions: u64,
    pub ttl_evictions: u64,
}

impl CacheStats {
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        };
    }
}
