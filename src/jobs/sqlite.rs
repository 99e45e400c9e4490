//! SQLite-backed job store

use super::{JobId, JobRecord, JobStore};
use crate::error::{FlowError, Result};
use crate::models::JobState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Job store persisted in a single SQLite table
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open (or create) the job database at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Configure SQLite for edge devices
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -2000;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 0;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;
        Ok(store)
    }

    /// Create in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                flow_name TEXT NOT NULL,
                state TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state_created ON jobs(state, created_at);
            ",
        )?;

        Ok(())
    }

    /// Re-queue jobs left running by a worker that stopped mid-job.
    ///
    /// Their payload is the last round checkpoint, so resuming it never
    /// repeats a completed round.
    pub fn recover_interrupted(&self) -> Result<Vec<JobId>> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM jobs WHERE state = ?1 ORDER BY created_at, rowid")?;
            let rows = stmt.query_map(params![JobState::Running.as_str()], |row| row.get(0))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        tx.execute(
            "UPDATE jobs SET state = ?1, updated_at = ?2 WHERE state = ?3",
            params![JobState::Pending.as_str(), Utc::now(), JobState::Running.as_str()],
        )?;
        tx.commit()?;

        if !ids.is_empty() {
            info!("Re-queued {} interrupted jobs", ids.len());
        }
        Ok(ids.into_iter().map(JobId).collect())
    }

    fn claim(&self, limit: usize) -> Result<Vec<JobId>> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs WHERE state = ?1 ORDER BY created_at, rowid LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![JobState::Pending.as_str(), limit as i64], |row| {
                row.get(0)
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let now = Utc::now();
        for id in &ids {
            tx.execute(
                "UPDATE jobs SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![JobState::Running.as_str(), now, id],
            )?;
        }
        tx.commit()?;

        if !ids.is_empty() {
            debug!("Claimed {} jobs", ids.len());
        }
        Ok(ids.into_iter().map(JobId).collect())
    }

    fn insert(&self, flow_name: &str, payload: &[u8]) -> Result<JobId> {
        let conn = self.conn.lock()?;
        let id = JobId::new();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO jobs (id, flow_name, state, payload, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id.as_str(), flow_name, JobState::Pending.as_str(), payload, now, now],
        )?;

        Ok(id)
    }

    fn set_state(&self, job_id: &JobId, state: JobState, payload: &[u8]) -> Result<()> {
        let conn = self.conn.lock()?;

        let changed = conn.execute(
            "UPDATE jobs SET state = ?1, payload = ?2, updated_at = ?3 WHERE id = ?4",
            params![state.as_str(), payload, Utc::now(), job_id.as_str()],
        )?;

        if changed == 0 {
            return Err(FlowError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    fn get(&self, job_id: &JobId) -> Result<JobRecord> {
        let conn = self.conn.lock()?;

        let row: Option<(String, String, Vec<u8>, DateTime<Utc>, DateTime<Utc>)> = conn
            .query_row(
                "SELECT flow_name, state, payload, created_at, updated_at FROM jobs WHERE id = ?1",
                params![job_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        let (flow_name, state, payload, created_at, updated_at) =
            row.ok_or_else(|| FlowError::JobNotFound(job_id.to_string()))?;

        Ok(JobRecord {
            id: job_id.clone(),
            flow_name,
            state: state.parse().map_err(FlowError::Validation)?,
            payload,
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn pop_jobs(&self, limit: usize) -> Result<Vec<JobId>> {
        self.claim(limit)
    }

    async fn enqueue(&self, flow_name: &str, payload: Vec<u8>) -> Result<JobId> {
        self.insert(flow_name, &payload)
    }

    async fn update(&self, job_id: &JobId, state: JobState, payload: Vec<u8>) -> Result<()> {
        self.set_state(job_id, state, &payload)
    }

    async fn load(&self, job_id: &JobId) -> Result<JobRecord> {
        self.get(job_id)
    }
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_job_lifecycle() {
        let store = SqliteJobStore::in_memory().unwrap();

        let id = store.enqueue("deploy", b"seeded".to_vec()).await.unwrap();
        let job = store.load(&id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.flow_name, "deploy");
        assert_eq!(job.payload, b"seeded");

        assert_eq!(store.pop_jobs(10).await.unwrap(), vec![id.clone()]);
        assert_eq!(store.load(&id).await.unwrap().state, JobState::Running);

        store
            .update(&id, JobState::Succeeded, b"done".to_vec())
            .await
            .unwrap();
        let job = store.load(&id).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.payload, b"done");
        assert!(job.updated_at >= job.created_at);
    }

    #[tokio::test]
    async fn test_pop_respects_limit_and_order() {
        let store = SqliteJobStore::in_memory().unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.enqueue("deploy", Vec::new()).await.unwrap());
        }

        assert_eq!(store.pop_jobs(2).await.unwrap(), ids[..2].to_vec());
        assert_eq!(store.pop_jobs(2).await.unwrap(), ids[2..].to_vec());
        assert!(store.pop_jobs(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let store = SqliteJobStore::in_memory().unwrap();
        let running = store.enqueue("deploy", Vec::new()).await.unwrap();
        store.pop_jobs(1).await.unwrap();
        let finished = store.enqueue("deploy", Vec::new()).await.unwrap();
        store
            .update(&finished, JobState::Stalled, Vec::new())
            .await
            .unwrap();

        let recovered = store.recover_interrupted().unwrap();
        assert_eq!(recovered, vec![running.clone()]);
        assert_eq!(store.load(&running).await.unwrap().state, JobState::Pending);
        assert_eq!(store.load(&finished).await.unwrap().state, JobState::Stalled);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let store = SqliteJobStore::in_memory().unwrap();
        let id = JobId::new();
        assert!(matches!(store.load(&id).await, Err(FlowError::JobNotFound(_))));
        assert!(matches!(
            store.update(&id, JobState::Failed, Vec::new()).await,
            Err(FlowError::JobNotFound(_))
        ));
    }
}
