pub mod batcher;
pub mod dead_letter;
pub mod parser;
pub mod pool;
pub mod service;
pub mod source;
pub mod watcher;
pub mod writer;

pub use batcher::{BatchHandler, Batcher, BatcherStats};
pub use dead_letter::DeadLetterLog;
pub use parser::{DefinitionParser, Parser};
pub use pool::{PoolState, PoolStats, WorkerPool};
pub use service::{IngestService, ServiceStats};
pub use source::{ContentSource, FsSource};
pub use writer::{BulkGraphWriter, RetryPolicy};
