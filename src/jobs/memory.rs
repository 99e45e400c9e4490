//! In-process job store

use super::{JobId, JobRecord, JobStore};
use crate::error::{FlowError, Result};
use crate::models::JobState;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

/// Job store kept in memory, for tests and one-shot runs.
///
/// Pending jobs are claimed in submission order.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    jobs: HashMap<JobId, JobRecord>,
    queue: VecDeque<JobId>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.lock()?.jobs.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn pop_jobs(&self, limit: usize) -> Result<Vec<JobId>> {
        let mut inner = self.inner.lock()?;
        let MemoryInner { jobs, queue } = &mut *inner;

        let mut claimed = Vec::new();
        while claimed.len() < limit {
            let Some(id) = queue.pop_front() else {
                break;
            };
            // Jobs updated out of pending after being queued are skipped
            if let Some(job) = jobs.get_mut(&id) {
                if job.state == JobState::Pending {
                    job.state = JobState::Running;
                    job.updated_at = Utc::now();
                    claimed.push(id);
                }
            }
        }

        if !claimed.is_empty() {
            debug!("Claimed {} jobs", claimed.len());
        }
        Ok(claimed)
    }

    async fn enqueue(&self, flow_name: &str, payload: Vec<u8>) -> Result<JobId> {
        let id = JobId::new();
        let now = Utc::now();
        let record = JobRecord {
            id: id.clone(),
            flow_name: flow_name.to_string(),
            state: JobState::Pending,
            payload,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.lock()?;
        inner.jobs.insert(id.clone(), record);
        inner.queue.push_back(id.clone());
        Ok(id)
    }

    async fn update(&self, job_id: &JobId, state: JobState, payload: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| FlowError::JobNotFound(job_id.to_string()))?;

        let requeue = state == JobState::Pending && job.state != JobState::Pending;
        job.state = state;
        job.payload = payload;
        job.updated_at = Utc::now();

        if requeue {
            inner.queue.push_back(job_id.clone());
        }
        Ok(())
    }

    async fn load(&self, job_id: &JobId) -> Result<JobRecord> {
        let inner = self.inner.lock()?;
        inner
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| FlowError::JobNotFound(job_id.to_string()))
    }
}
