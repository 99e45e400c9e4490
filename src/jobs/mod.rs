//! Persistent jobs: one stored flow payload per job
//!
//! A job is created by seeding a registered flow and storing its payload.
//! Workers claim pending jobs, restore the payload into a freshly built flow
//! and checkpoint it after every round.

pub mod memory;
pub mod runner;
pub mod sqlite;

pub use memory::MemoryJobStore;
pub use runner::JobRunner;
pub use sqlite::SqliteJobStore;

use crate::error::{FlowError, Result};
use crate::flow::Flow;
use crate::models::JobState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of a stored job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        let id = Uuid::parse_str(s)
            .map_err(|e| FlowError::Validation(format!("invalid job id '{}': {}", s, e)))?;
        Ok(Self(id.to_string()))
    }
}

/// A stored job as returned by [`JobStore::load`]
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub flow_name: String,
    pub state: JobState,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage backend for jobs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim up to `limit` pending jobs, moving them to running
    async fn pop_jobs(&self, limit: usize) -> Result<Vec<JobId>>;

    /// Store a new pending job
    async fn enqueue(&self, flow_name: &str, payload: Vec<u8>) -> Result<JobId>;

    async fn update(&self, job_id: &JobId, state: JobState, payload: Vec<u8>) -> Result<()>;

    async fn load(&self, job_id: &JobId) -> Result<JobRecord>;
}

/// Builds a fresh, unseeded flow
pub type FlowBuilder = Arc<dyn Fn() -> Result<Flow> + Send + Sync>;

/// Flow constructors by name.
///
/// A stored payload only carries state, so the worker rebuilds the flow
/// under the job's name before restoring it.
#[derive(Clone, Default)]
pub struct FlowRegistry {
    builders: HashMap<String, FlowBuilder>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor, replacing any previous one under `name`
    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn() -> Result<Flow> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Arc::new(builder));
    }

    pub fn build(&self, name: &str) -> Result<Flow> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| FlowError::FlowNotRegistered(name.to_string()))?;
        builder()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry")
            .field("flows", &self.names())
            .finish()
    }
}
