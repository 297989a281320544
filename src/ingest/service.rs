//! Glue between the batcher, the worker pool, the parse cache and the writer.
//!
//! Every batch the batcher emits becomes one flow. Each key in the flow is a
//! pool task that loads content, consults the cache, parses on a blocking
//! thread and appends the result to the flow's private buffer. The buffer is
//! written early when it reaches the writer's batch size, and once more when
//! the flow's last task has finished or been cancelled. Both writes run on the
//! service's own tasks, outside any pool task deadline.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::task::TaskTracker;

use super::batcher::BatchHandler;
use super::dead_letter::DeadLetterLog;
use super::parser::{bind_to_path, DefinitionParser, Parser};
use super::pool::WorkerPool;
use super::source::ContentSource;
use super::writer::BulkGraphWriter;
use crate::cache::ParseCache;
use crate::models::{DeadLetterRecord, Entity, ParseOutput, Priority, Relationship};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStats {
    pub flows_started: u64,
    pub flows_completed: u64,
    pub files_ingested: u64,
    pub files_missing: u64,
    pub parse_failures: u64,
    pub entities_written: u64,
    pub relationships_written: u64,
}

#[derive(Default)]
struct Counters {
    flows_started: AtomicU64,
    flows_completed: AtomicU64,
    files_ingested: AtomicU64,
    files_missing: AtomicU64,
    parse_failures: AtomicU64,
    entities_written: AtomicU64,
    relationships_written: AtomicU64,
}

/// Records accumulated by one flow and not yet written.
#[derive(Default)]
struct FlowBuffer {
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
}

impl FlowBuffer {
    fn len(&self) -> usize {
        self.entities.len() + self.relationships.len()
    }
}

struct Flow {
    id: u64,
    buffer: Mutex<FlowBuffer>,
    remaining: AtomicUsize,
    service: IngestService,
}

impl Flow {
    /// Append `output`; hands back the whole buffer once it is due for a write.
    fn push(&self, output: ParseOutput) -> Option<FlowBuffer> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|p| p.into_inner());
        buffer.entities.extend(output.entities);
        buffer.relationships.extend(output.relationships);
        (buffer.len() >= self.service.writer.batch_size()).then(|| std::mem::take(&mut *buffer))
    }

    fn take(&self) -> FlowBuffer {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

/// Held by each task of a flow. The last one dropped schedules the final flush,
/// whether the task completed, failed or was cancelled.
struct FlowTicket {
    flow: Arc<Flow>,
}

impl Drop for FlowTicket {
    fn drop(&mut self) {
        if self.flow.remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let flow = self.flow.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.flow.service.finalizers.spawn_on(
                    async move {
                        let service = flow.service.clone();
                        service.flush(flow.id, flow.take()).await;
                        service.counters.flows_completed.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(flow = flow.id, "Flow completed");
                    },
                    &handle,
                );
            }
            Err(_) => {
                tracing::error!(
                    flow = self.flow.id,
                    "No runtime to flush flow buffer ({} records lost)",
                    self.flow.take().len()
                );
            }
        }
    }
}

/// Turns batches of keys into parsed, durably written graph records.
#[derive(Clone)]
pub struct IngestService {
    pool: Arc<WorkerPool>,
    source: Arc<dyn ContentSource>,
    parser: Arc<dyn Parser>,
    cache: Option<Arc<ParseCache>>,
    writer: Arc<BulkGraphWriter>,
    dead_letters: Arc<DeadLetterLog>,
    priority: Priority,
    finalizers: TaskTracker,
    next_flow: Arc<AtomicU64>,
    counters: Arc<Counters>,
}

impl IngestService {
    pub fn new(
        pool: Arc<WorkerPool>,
        source: Arc<dyn ContentSource>,
        writer: Arc<BulkGraphWriter>,
        dead_letters: Arc<DeadLetterLog>,
    ) -> Self {
        Self {
            pool,
            source,
            parser: Arc::new(DefinitionParser::new()),
            cache: None,
            writer,
            dead_letters,
            priority: Priority::Normal,
            finalizers: TaskTracker::new(),
            next_flow: Arc::new(AtomicU64::new(0)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ParseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parser = parser;
        self
    }

    /// Same service (shared flows, counters and finalizers) submitting at `priority`.
    pub fn at_priority(&self, priority: Priority) -> Self {
        Self {
            priority,
            ..self.clone()
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Process one key end to end, appending its records to `flow`.
    async fn process(&self, flow: &Flow, key: &str) -> anyhow::Result<()> {
        let Some(content) = self
            .source
            .load(key)
            .await
            .with_context(|| format!("Failed to read {}", key))?
        else {
            tracing::debug!("Skipping {} (no longer exists)", key);
            self.counters.files_missing.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        let cached = match &self.cache {
            Some(cache) => cache.get_json::<ParseOutput>(&content).await,
            None => None,
        };

        let (content, output) = match cached {
            Some(output) => {
                tracing::debug!("Parse cache hit for {}", key);
                (content, output)
            }
            None => {
                let parser = self.parser.clone();
                let path = key.to_string();
                let (content, parsed) = tokio::task::spawn_blocking(move || {
                    let parsed = parser.parse(&content, &path);
                    (content, parsed)
                })
                .await
                .context("Parser thread panicked")?;

                match parsed {
                    Ok(output) => {
                        if let Some(cache) = &self.cache {
                            if let Err(e) = cache.set_json(&content, &output, key).await {
                                tracing::warn!("Failed to cache parse result for {}: {}", key, e);
                            }
                        }
                        (content, output)
                    }
                    Err(e) => {
                        self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                        self.dead_letters
                            .record(DeadLetterRecord::new(
                                "parse",
                                &e,
                                serde_json::json!({ "key": key, "size_bytes": content.len() }),
                            ))
                            .await;
                        return Err(e.into());
                    }
                }
            }
        };

        let mut bound = bind_to_path(output, key);
        let file_id = format!("file:{}", key);
        if let Some(file) = bound.entities.iter_mut().find(|e| e.id == file_id) {
            file.properties.insert("path".into(), key.into());
            file.properties
                .insert("size_bytes".into(), content.len().into());
            file.properties.insert(
                "content_hash".into(),
                blake3::hash(&content).to_hex().to_string().into(),
            );
        }

        self.counters.files_ingested.fetch_add(1, Ordering::Relaxed);
        if let Some(due) = flow.push(bound) {
            // A taken buffer must not die with this task when its deadline fires.
            let service = self.clone();
            let flow_id = flow.id;
            self.finalizers
                .spawn(async move { service.flush(flow_id, due).await });
        }
        Ok(())
    }

    /// Write a taken buffer. Record-level failures are already dead-lettered by
    /// the writer; a zero-progress outcome is logged here.
    async fn flush(&self, flow_id: u64, buffer: FlowBuffer) {
        if buffer.len() == 0 {
            return;
        }
        tracing::debug!(
            flow = flow_id,
            "Flushing {} entities, {} relationships",
            buffer.entities.len(),
            buffer.relationships.len()
        );

        match self.writer.write_entities(&buffer.entities).await {
            Ok(n) => {
                self.counters
                    .entities_written
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => tracing::error!(flow = flow_id, "Entity flush failed: {}", e),
        }
        match self.writer.write_relationships(&buffer.relationships).await {
            Ok(n) => {
                self.counters
                    .relationships_written
                    .fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => tracing::error!(flow = flow_id, "Relationship flush failed: {}", e),
        }
    }

    /// Wait for every pending flow flush. Drain the pool first.
    pub async fn shutdown(&self) {
        self.finalizers.close();
        self.finalizers.wait().await;
        tracing::info!("Ingest service stopped");
    }

    pub fn stats(&self) -> ServiceStats {
        let c = &self.counters;
        ServiceStats {
            flows_started: c.flows_started.load(Ordering::Relaxed),
            flows_completed: c.flows_completed.load(Ordering::Relaxed),
            files_ingested: c.files_ingested.load(Ordering::Relaxed),
            files_missing: c.files_missing.load(Ordering::Relaxed),
            parse_failures: c.parse_failures.load(Ordering::Relaxed),
            entities_written: c.entities_written.load(Ordering::Relaxed),
            relationships_written: c.relationships_written.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl BatchHandler for IngestService {
    async fn handle_batch(&self, keys: Vec<String>) -> anyhow::Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let flow = Arc::new(Flow {
            id: self.next_flow.fetch_add(1, Ordering::Relaxed),
            buffer: Mutex::new(FlowBuffer::default()),
            remaining: AtomicUsize::new(keys.len()),
            service: self.clone(),
        });
        self.counters.flows_started.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            flow = flow.id,
            priority = %self.priority,
            "Ingesting batch of {} keys",
            keys.len()
        );

        let mut rejected = 0usize;
        let mut first_error = None;
        for key in keys {
            let ticket = FlowTicket { flow: flow.clone() };
            let service = self.clone();
            let task_key = key.clone();
            let task = async move {
                let ticket = ticket;
                service.process(&ticket.flow, &task_key).await
            };
            if let Err(e) = self.pool.submit(key, task, self.priority).await {
                rejected += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(anyhow::Error::new(e).context(format!(
                "{} keys of flow {} were not submitted",
                rejected, flow.id
            ))),
            None => Ok(()),
        }
    }
}
