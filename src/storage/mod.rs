//! Graph store abstraction and the SQLite-backed implementation.

pub mod sqlite;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Entity, Relationship};

pub use sqlite::SqliteGraphStore;

/// Downstream graph backend. Both writes are idempotent merge-by-id upserts
/// of a whole sub-batch: either every record lands or the call fails.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_entities(&self, batch: &[Entity]) -> Result<(), StoreError>;

    async fn upsert_relationships(&self, batch: &[Relationship]) -> Result<(), StoreError>;

    /// Quick connectivity check.
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
