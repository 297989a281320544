//! Pipeline wiring: owns every long-lived component for one project root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::cache::ParseCache;
use crate::config::IngestConfig;
use crate::ingest::{
    Batcher, BulkGraphWriter, DeadLetterLog, FsSource, IngestService, WorkerPool,
};
use crate::metrics::PipelineMetrics;
use crate::models::Priority;
use crate::resource_limits::{ResourceLimits, SystemMemoryProbe};
use crate::storage::{GraphStore, SqliteGraphStore};

pub struct Pipeline {
    pub root: PathBuf,
    pub config: IngestConfig,
    pub metrics: Arc<PipelineMetrics>,
    pub store: Arc<SqliteGraphStore>,
    pub cache: Option<Arc<ParseCache>>,
    pub dead_letters: Arc<DeadLetterLog>,
    pub pool: Arc<WorkerPool>,
    pub service: IngestService,
    /// Debounced entry point for live events (NORMAL priority).
    pub batcher: Arc<Batcher>,
    pub shutdown_token: CancellationToken,
}

impl Pipeline {
    /// Open stores, start the worker pool and the batcher timer.
    pub async fn open(root: &Path, mut config: IngestConfig) -> Result<Self> {
        config.resolve_paths(root);
        let metrics = Arc::new(PipelineMetrics::new());

        let store = Arc::new(SqliteGraphStore::new(&config.store.path).await?);
        store.health_check().await?;

        let cache = if config.cache.enabled {
            let cache = ParseCache::open(&config.cache.path, &config.cache)
                .await?
                .with_metrics(metrics.clone());
            Some(Arc::new(cache))
        } else {
            tracing::info!("Parse cache disabled");
            None
        };

        let dead_letters = Arc::new(DeadLetterLog::new(&config.writer.dead_letter_path));
        let writer = Arc::new(BulkGraphWriter::from_config(
            &config.writer,
            store.clone(),
            dead_letters.clone(),
            metrics.clone(),
        ));

        let limits = ResourceLimits::new(
            config.pool.max_queue_size,
            config.pool.memory_threshold_percent,
            config.pool.backpressure_poll(),
            Arc::new(SystemMemoryProbe::new()),
        );
        let pool = Arc::new(WorkerPool::from_config(&config.pool, limits, metrics.clone()));
        pool.start()?;

        let mut service = IngestService::new(
            pool.clone(),
            Arc::new(FsSource::new(root)),
            writer,
            dead_letters.clone(),
        );
        if let Some(cache) = &cache {
            service = service.with_cache(cache.clone());
        }

        let batcher = Arc::new(Batcher::new(
            &config.batcher,
            Arc::new(service.at_priority(Priority::Normal)),
            metrics.clone(),
        ));

        tracing::info!("Pipeline ready for {:?}", root);
        Ok(Self {
            root: root.to_path_buf(),
            config,
            metrics,
            store,
            cache,
            dead_letters,
            pool,
            service,
            batcher,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Flush the batcher, drain the pool, then wait for the final flow writes.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        if let Err(e) = self.batcher.shutdown().await {
            tracing::error!("Final batcher flush failed: {:#}", e);
        }
        self.pool.shutdown(true).await;
        self.service.shutdown().await;
    }

    pub async fn summary(&self) -> serde_json::Value {
        let cache = match &self.cache {
            Some(cache) => match cache.get_stats().await {
                Ok(stats) => serde_json::to_value(stats).unwrap_or_default(),
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            },
            None => serde_json::Value::Null,
        };
        let (entities, relationships) = (
            self.store.count_entities().await.unwrap_or_default(),
            self.store.count_relationships().await.unwrap_or_default(),
        );

        serde_json::json!({
            "pool": self.pool.stats(),
            "batcher": self.batcher.stats(),
            "service": self.service.stats(),
            "cache": cache,
            "store": { "entities": entities, "relationships": relationships },
            "metrics": self.metrics.snapshot(),
        })
    }
}
