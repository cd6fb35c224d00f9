//! The `TaskStore` collaborator interface (spec §4.7, C9): durable task
//! records, persisted behind a pluggable key-value backend. The real
//! persistence backend is out of scope (spec §1); this module defines the
//! trait, a reference `sqlite-store` implementation grounded on the donor's
//! `resume_db` (schema, migration-on-open, serialized per-task
//! read-modify-write), and an in-memory test double.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::TaskRecord;

/// Durable per-task record storage (spec §4.7). Invariant: a single
/// serialized region wraps every read-modify-write of a given record —
/// implementations must provide this themselves (the trait only exposes
/// the four operations; `coordinator`/`execution` call `load` then `save`
/// under their own per-task critical section, mirroring spec §3's ownership
/// note that "every mutation goes through a single serialized critical
/// section keyed by taskId").
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, record: TaskRecord) -> anyhow::Result<()>;
    async fn load(&self, task_id: &str) -> anyhow::Result<Option<TaskRecord>>;
    async fn list(&self) -> anyhow::Result<Vec<TaskRecord>>;
    async fn remove(&self, task_id: &str) -> anyhow::Result<()>;
}

/// In-memory `TaskStore` used by coordinator/queue integration tests in
/// place of the out-of-scope real collaborator.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    records: Arc<Mutex<HashMap<String, TaskRecord>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, record: TaskRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .await
            .insert(record.task_id.clone(), record);
        Ok(())
    }

    async fn load(&self, task_id: &str) -> anyhow::Result<Option<TaskRecord>> {
        Ok(self.records.lock().await.get(task_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn remove(&self, task_id: &str) -> anyhow::Result<()> {
        self.records.lock().await.remove(task_id);
        Ok(())
    }
}

/// Reference `sqlite-store` implementation, directly adapted from the
/// donor's `resume_db::db::ResumeDb`: a single `jobs`-shaped table (here
/// `tasks`), migration-on-open, and the whole `TaskRecord` persisted as one
/// JSON BLOB column per row — the donor normalizes fields into columns
/// because it only ever stores one record shape; this engine stores several
/// source types behind one record, so JSON-per-row (with `task_id` and
/// `state` broken out as indexed columns for `list`/filtering) better
/// matches spec §4.7's "stable structured format (JSON in the source)"
/// requirement while staying forward-compatible (spec §9: unknown fields
/// ignored on read).
#[cfg(feature = "sqlite-store")]
pub mod sqlite_store {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::{Pool, Row, Sqlite};

    #[derive(Clone)]
    pub struct SqliteTaskStore {
        pool: Pool<Sqlite>,
    }

    impl SqliteTaskStore {
        pub async fn open(uri: &str) -> anyhow::Result<Self> {
            let pool = SqlitePoolOptions::new().max_connections(8).connect(uri).await?;
            let store = Self { pool };
            store.migrate().await?;
            Ok(store)
        }

        pub async fn open_in_memory() -> anyhow::Result<Self> {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await?;
            let store = Self { pool };
            store.migrate().await?;
            Ok(store)
        }

        async fn migrate(&self) -> anyhow::Result<()> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    task_id TEXT PRIMARY KEY,
                    state TEXT NOT NULL,
                    record_json TEXT NOT NULL
                );
                "#,
            )
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl TaskStore for SqliteTaskStore {
        async fn save(&self, record: TaskRecord) -> anyhow::Result<()> {
            let json = serde_json::to_string(&record)?;
            let state_label = serde_json::to_value(&record.state)?
                .as_str()
                .unwrap_or("QUEUED")
                .to_string();
            sqlx::query(
                r#"
                INSERT INTO tasks (task_id, state, record_json) VALUES (?1, ?2, ?3)
                ON CONFLICT(task_id) DO UPDATE SET state = excluded.state, record_json = excluded.record_json
                "#,
            )
            .bind(&record.task_id)
            .bind(state_label)
            .bind(json)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn load(&self, task_id: &str) -> anyhow::Result<Option<TaskRecord>> {
            let row = sqlx::query("SELECT record_json FROM tasks WHERE task_id = ?1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                None => Ok(None),
                Some(row) => {
                    let json: String = row.get("record_json");
                    Ok(Some(serde_json::from_str(&json)?))
                }
            }
        }

        async fn list(&self) -> anyhow::Result<Vec<TaskRecord>> {
            let rows = sqlx::query("SELECT record_json FROM tasks")
                .fetch_all(&self.pool)
                .await?;
            rows.into_iter()
                .map(|row| {
                    let json: String = row.get("record_json");
                    serde_json::from_str(&json).map_err(anyhow::Error::from)
                })
                .collect()
        }

        async fn remove(&self, task_id: &str) -> anyhow::Result<()> {
            sqlx::query("DELETE FROM tasks WHERE task_id = ?1")
                .bind(task_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::model::TaskState;

        #[tokio::test]
        async fn save_load_list_remove_roundtrip() {
            let store = SqliteTaskStore::open_in_memory().await.unwrap();
            let record = TaskRecord {
                task_id: "t1".into(),
                request_url: "https://example.com/f".into(),
                state: TaskState::Queued,
                ..Default::default()
            };
            store.save(record.clone()).await.unwrap();
            let loaded = store.load("t1").await.unwrap().unwrap();
            assert_eq!(loaded.task_id, "t1");
            assert_eq!(store.list().await.unwrap().len(), 1);
            store.remove("t1").await.unwrap();
            assert!(store.load("t1").await.unwrap().is_none());
        }

        #[tokio::test]
        async fn save_upserts_by_task_id() {
            let store = SqliteTaskStore::open_in_memory().await.unwrap();
            let mut record = TaskRecord {
                task_id: "t1".into(),
                state: TaskState::Queued,
                ..Default::default()
            };
            store.save(record.clone()).await.unwrap();
            record.state = TaskState::Completed;
            store.save(record).await.unwrap();
            assert_eq!(store.list().await.unwrap().len(), 1);
            let loaded = store.load("t1").await.unwrap().unwrap();
            assert_eq!(loaded.state, TaskState::Completed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskState;

    #[tokio::test]
    async fn in_memory_store_roundtrip() {
        let store = InMemoryTaskStore::new();
        let record = TaskRecord {
            task_id: "abc".into(),
            state: TaskState::Downloading,
            ..Default::default()
        };
        store.save(record.clone()).await.unwrap();
        let loaded = store.load("abc").await.unwrap().unwrap();
        assert_eq!(loaded.task_id, "abc");
        assert_eq!(store.list().await.unwrap().len(), 1);
        store.remove("abc").await.unwrap();
        assert!(store.load("abc").await.unwrap().is_none());
    }
}
