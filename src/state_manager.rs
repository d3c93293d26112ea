// src/state_manager.rs

use crate::models::{ChunkInfo, TransferJob};
use async_trait::async_trait;
use rusqlite::params;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where completed chunks are recorded so that a later run can skip them.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn load_completed_chunks(&self, job_id: Uuid) -> Result<Vec<ChunkInfo>, StateError>;

    /// Called once per newly completed chunk, as soon as it completes.
    async fn append_completed_chunk(&self, job_id: Uuid, chunk: &ChunkInfo) -> Result<(), StateError>;

    async fn list_temp_chunk_artifacts(&self, temp_dir: &Path) -> Result<BTreeSet<u32>, StateError> {
        Ok(crate::cache::list_temp_chunk_artifacts(temp_dir).await?)
    }
}

fn from_json<T: serde::de::DeserializeOwned>(data: &str) -> Result<T, rusqlite::Error> {
    serde_json::from_str(data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Manages the persistence of transfer jobs and their completed chunks in SQLite.
#[derive(Clone)]
pub struct StateManager {
    conn: Connection,
}

impl StateManager {
    /// Creates a new StateManager and connects to the database file.
    /// It will create the database and necessary tables if they don't exist.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    pub async fn in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS jobs (
                        id              TEXT PRIMARY KEY,
                        job_data        TEXT NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS completed_chunks (
                        job_id          TEXT NOT NULL,
                        chunk_index     INTEGER NOT NULL,
                        chunk_data      TEXT NOT NULL,
                        PRIMARY KEY (job_id, chunk_index)
                    );",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Saves (inserts or updates) a job.
    pub async fn save_job(&self, job: &TransferJob) -> Result<(), StateError> {
        let job_data = serde_json::to_string(job)?;
        let job_id = job.id.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO jobs (id, job_data) VALUES (?1, ?2)",
                    params![job_id, job_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load_job(&self, job_id: Uuid) -> Result<Option<TransferJob>, StateError> {
        let job_id = job_id.to_string();
        let job = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT job_data FROM jobs WHERE id = ?1")?;
                let mut rows = stmt.query(params![job_id])?;
                let job = match rows.next()? {
                    Some(row) => {
                        let data: String = row.get(0)?;
                        Some(from_json::<TransferJob>(&data)?)
                    }
                    None => None,
                };
                Ok(job)
            })
            .await?;
        Ok(job)
    }

    pub async fn load_all_jobs(&self) -> Result<Vec<TransferJob>, StateError> {
        let jobs = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT job_data FROM jobs")?;
                let jobs = stmt
                    .query_map([], |row| {
                        let job_data: String = row.get(0)?;
                        from_json::<TransferJob>(&job_data)
                    })?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(jobs)
            })
            .await?;
        Ok(jobs)
    }

    /// Deletes a job and every chunk recorded for it.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<(), StateError> {
        let job_id = job_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM completed_chunks WHERE job_id = ?1", params![job_id])?;
                tx.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for StateManager {
    async fn load_completed_chunks(&self, job_id: Uuid) -> Result<Vec<ChunkInfo>, StateError> {
        let job_id = job_id.to_string();
        let chunks = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT chunk_data FROM completed_chunks WHERE job_id = ?1 ORDER BY chunk_index",
                )?;
                let chunks = stmt
                    .query_map(params![job_id], |row| {
                        let data: String = row.get(0)?;
                        from_json::<ChunkInfo>(&data)
                    })?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(chunks)
            })
            .await?;
        Ok(chunks)
    }

    async fn append_completed_chunk(&self, job_id: Uuid, chunk: &ChunkInfo) -> Result<(), StateError> {
        let chunk_data = serde_json::to_string(chunk)?;
        let job_id = job_id.to_string();
        let index = chunk.index;

        // A completed chunk is immutable: the first record wins.
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO completed_chunks (job_id, chunk_index, chunk_data)
                     VALUES (?1, ?2, ?3)",
                    params![job_id, index, chunk_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, JobStatus};

    fn job() -> TransferJob {
        TransferJob::new(
            Direction::Upload,
            "a.bin".into(),
            100,
            40,
            "chat".into(),
            vec!["bot-a".into(), "bot-b".into()],
            1,
        )
    }

    fn chunk(index: u32, credential: &str) -> ChunkInfo {
        ChunkInfo {
            index,
            message_id: index as i64 + 10,
            remote_ref: format!("ref-{index}"),
            credential: credential.into(),
            hash: "0123456789abcdef".into(),
            size: 40,
        }
    }

    #[tokio::test]
    async fn job_roundtrip_and_status_update() {
        let state = StateManager::in_memory().await.unwrap();
        let mut job = job();
        state.save_job(&job).await.unwrap();

        job.status = JobStatus::Failed(Some("chunk 2: gave up".into()));
        state.save_job(&job).await.unwrap();

        let loaded = state.load_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, job.status);
        assert_eq!(loaded.total_chunks, 3);
        assert_eq!(loaded.rotation_offset, 1);
        assert_eq!(state.load_all_jobs().await.unwrap().len(), 1);
        assert!(state.load_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_completion_record_wins() {
        let state = StateManager::in_memory().await.unwrap();
        let job_id = Uuid::new_v4();

        state.append_completed_chunk(job_id, &chunk(2, "bot-a")).await.unwrap();
        state.append_completed_chunk(job_id, &chunk(0, "bot-b")).await.unwrap();
        state.append_completed_chunk(job_id, &chunk(2, "bot-b")).await.unwrap();

        let chunks = state.load_completed_chunks(job_id).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[1].credential.0, "bot-a");
    }

    #[tokio::test]
    async fn delete_job_removes_its_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = StateManager::new(&dir.path().join("state.db")).await.unwrap();
        let job = job();
        state.save_job(&job).await.unwrap();
        state.append_completed_chunk(job.id, &chunk(0, "bot-a")).await.unwrap();

        state.delete_job(job.id).await.unwrap();
        assert!(state.load_job(job.id).await.unwrap().is_none());
        assert!(state.load_completed_chunks(job.id).await.unwrap().is_empty());
    }
}
