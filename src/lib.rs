//! Concurrent ingestion pipeline: file-change events in, graph records out.
//!
//! Events are deduplicated and debounced by [`ingest::Batcher`], parsed in
//! parallel by [`ingest::WorkerPool`] tasks that consult [`cache::ParseCache`],
//! and written by [`ingest::BulkGraphWriter`] with retry, progressive batch
//! degradation and a dead-letter log.

pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod metrics_http;
pub mod models;
pub mod pipeline;
pub mod resource_limits;
pub mod storage;

pub use error::{IngestError, StoreError};
pub use pipeline::Pipeline;
