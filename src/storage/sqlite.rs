use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::GraphStore;
use crate::error::StoreError;
use crate::models::{Entity, Relationship};

pub type Result<T> = std::result::Result<T, StoreError>;

fn validate_entity(entity: &Entity) -> Result<()> {
    if entity.id.trim().is_empty() {
        return Err(StoreError::Malformed(format!(
            "entity with label {:?} has an empty id",
            entity.label
        )));
    }
    if entity.label.trim().is_empty() {
        return Err(StoreError::Malformed(format!(
            "entity {} has an empty label",
            entity.id
        )));
    }
    Ok(())
}

fn validate_relationship(rel: &Relationship) -> Result<()> {
    if rel.source.trim().is_empty() || rel.target.trim().is_empty() || rel.kind.trim().is_empty()
    {
        return Err(StoreError::Malformed(format!(
            "relationship {} is missing an endpoint or kind",
            rel.id()
        )));
    }
    Ok(())
}

/// Property graph persisted in a local SQLite file.
#[derive(Clone)]
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    /// Open (or create) the graph database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Permanent(e.to_string()))?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id          TEXT PRIMARY KEY,
                label       TEXT NOT NULL,
                properties  TEXT NOT NULL DEFAULT '{}',
                updated_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS edges (
                source      TEXT NOT NULL,
                kind        TEXT NOT NULL,
                target      TEXT NOT NULL,
                properties  TEXT NOT NULL DEFAULT '{}',
                updated_at  INTEGER NOT NULL,
                PRIMARY KEY (source, kind, target)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target)")
            .execute(&self.pool)
            .await?;

        tracing::info!("Graph store migrations completed");
        Ok(())
    }

    pub async fn count_entities(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn count_relationships(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edges")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query("SELECT id, label, properties FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            let properties: String = r.get("properties");
            Ok(Entity {
                id: r.get("id"),
                label: r.get("label"),
                properties: serde_json::from_str(&properties)
                    .map_err(|e| StoreError::Permanent(e.to_string()))?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn upsert_entities(&self, batch: &[Entity]) -> Result<()> {
        for entity in batch {
            validate_entity(entity)?;
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for entity in batch {
            let properties = serde_json::Value::Object(entity.properties.clone()).to_string();
            sqlx::query(
                r#"
                INSERT INTO nodes (id, label, properties, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    label = excluded.label,
                    properties = json_patch(nodes.properties, excluded.properties),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entity.id)
            .bind(&entity.label)
            .bind(properties)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_relationships(&self, batch: &[Relationship]) -> Result<()> {
        for rel in batch {
            validate_relationship(rel)?;
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for rel in batch {
            let properties = serde_json::Value::Object(rel.properties.clone()).to_string();
            sqlx::query(
                r#"
                INSERT INTO edges (source, kind, target, properties, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(source, kind, target) DO UPDATE SET
                    properties = json_patch(edges.properties, excluded.properties),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&rel.source)
            .bind(&rel.kind)
            .bind(&rel.target)
            .bind(properties)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_test_store() -> (SqliteGraphStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("graph.sqlite");
        let store = SqliteGraphStore::new(&db_path).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_store_creation() {
        let (store, _temp) = create_test_store().await;
        assert!(store.health_check().await.is_ok());
        assert_eq!(store.count_entities().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let (store, _temp) = create_test_store().await;
        let batch = vec![
            Entity::new("table:orders", "Table"),
            Entity::new("table:customers", "Table"),
        ];
        store.upsert_entities(&batch).await.unwrap();
        store.upsert_entities(&batch).await.unwrap();
        assert_eq!(store.count_entities().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_merges_properties() {
        let (store, _temp) = create_test_store().await;
        store
            .upsert_entities(&[Entity::new("f", "File").with_property("size", 10)])
            .await
            .unwrap();
        store
            .upsert_entities(&[Entity::new("f", "File").with_property("lines", 3)])
            .await
            .unwrap();

        let entity = store.get_entity("f").await.unwrap().unwrap();
        assert_eq!(entity.properties["size"], 10);
        assert_eq!(entity.properties["lines"], 3);
    }

    #[tokio::test]
    async fn test_malformed_entity_rejects_whole_batch() {
        let (store, _temp) = create_test_store().await;
        let batch = vec![Entity::new("ok", "Table"), Entity::new("", "Table")];

        let err = store.upsert_entities(&batch).await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
        assert!(!err.is_transient());
        assert_eq!(store.count_entities().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relationship_upsert() {
        let (store, _temp) = create_test_store().await;
        let rel = Relationship::new("file:a.sql", "DEFINES", "table:orders");
        store.upsert_relationships(&[rel.clone()]).await.unwrap();
        store.upsert_relationships(&[rel]).await.unwrap();
        assert_eq!(store.count_relationships().await.unwrap(), 1);

        let bad = Relationship::new("file:a.sql", "", "table:orders");
        assert!(store.upsert_relationships(&[bad]).await.is_err());
    }
}
