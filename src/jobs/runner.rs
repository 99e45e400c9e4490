//! Job loop: claims stored jobs and drives their flows round by round

use super::{FlowRegistry, JobId, JobStore};
use crate::error::Result;
use crate::flow::{Flow, SeedArgs};
use crate::models::{FlowStatus, JobState, RunnerConfig};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Executes stored jobs against a registry of flows
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    registry: Arc<FlowRegistry>,
    config: RunnerConfig,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, registry: FlowRegistry, config: RunnerConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Build the named flow, seed it and store it as a pending job.
    ///
    /// Root nodes run here, before the job is stored.
    pub async fn start_flow(&self, name: &str, args: SeedArgs) -> Result<JobId> {
        let mut flow = self.registry.build(name)?;
        flow.seed(args, &CancellationToken::new()).await?;

        let payload = flow.encode()?;
        let job_id = self.store.enqueue(name, payload).await?;
        info!("Started flow '{}' as job {}", name, job_id);
        Ok(job_id)
    }

    /// Restore a job and advance it until it is done.
    ///
    /// The payload is stored after every round. A job that cannot be restored
    /// is marked failed with its payload left as found. `shutdown` is only
    /// checked between rounds: a round in flight runs to completion and the
    /// job is then checkpointed back to pending.
    pub async fn execute_job(
        &self,
        job_id: &JobId,
        shutdown: &CancellationToken,
    ) -> Result<JobState> {
        let record = self.store.load(job_id).await?;

        let mut flow = match self.restore(&record.flow_name, &record.payload) {
            Ok(flow) => flow,
            Err(err) => {
                error!("Job {} could not be restored: {}", job_id, err);
                self.store
                    .update(job_id, JobState::Failed, record.payload)
                    .await?;
                return Err(err);
            }
        };

        // Rounds get their own token so shutdown never kills running nodes
        let round_cancel = CancellationToken::new();
        let mut checkpoint = record.payload;
        loop {
            if shutdown.is_cancelled() {
                info!("Job {} interrupted, returning it to the queue", job_id);
                self.store
                    .update(job_id, JobState::Pending, checkpoint)
                    .await?;
                return Ok(JobState::Pending);
            }

            let ran = match flow.advance(&round_cancel).await {
                Ok(ran) => ran,
                Err(err) => {
                    error!("Job {} aborted mid-round: {}", job_id, err);
                    self.store
                        .update(job_id, JobState::Failed, checkpoint)
                        .await?;
                    return Err(err);
                }
            };
            debug!("Job {} ran {:?}", job_id, ran);

            let status = flow.status()?;
            checkpoint = flow.encode()?;
            let state = JobState::from(status);
            self.store.update(job_id, state, checkpoint.clone()).await?;

            match status {
                FlowStatus::Running => continue,
                FlowStatus::Succeeded => info!("Job {} succeeded", job_id),
                FlowStatus::Stalled => warn!("Job {} stalled", job_id),
            }
            return Ok(state);
        }
    }

    /// Poll the store until `cancel` fires.
    ///
    /// At most `batch_size` jobs run at once. Jobs still running at shutdown
    /// finish their current round before this returns.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Job runner started (batch size: {}, poll interval: {:?})",
            self.config.batch_size,
            self.config.poll_interval()
        );

        let mut tasks: JoinSet<(JobId, Result<JobState>)> = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_job_result(joined);
            }

            if cancel.is_cancelled() {
                break;
            }

            let capacity = self.config.batch_size.max(1).saturating_sub(tasks.len());
            if capacity == 0 {
                tokio::select! {
                    Some(joined) = tasks.join_next() => log_job_result(joined),
                    _ = cancel.cancelled() => break,
                }
                continue;
            }

            let ids = match self.store.pop_jobs(capacity).await {
                Ok(ids) => ids,
                Err(err) => {
                    error!("Failed to claim jobs: {}", err);
                    Vec::new()
                }
            };

            if ids.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    _ = cancel.cancelled() => break,
                }
                continue;
            }

            for job_id in ids {
                let runner = self.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let result = runner.execute_job(&job_id, &cancel).await;
                    (job_id, result)
                });
            }
        }

        info!("Job runner stopping, waiting for {} jobs", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            log_job_result(joined);
        }
        Ok(())
    }

    fn restore(&self, flow_name: &str, payload: &[u8]) -> Result<Flow> {
        let mut flow = self.registry.build(flow_name)?;
        flow.decode(payload)?;
        Ok(flow)
    }
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn log_job_result(
    joined: std::result::Result<(JobId, Result<JobState>), tokio::task::JoinError>,
) {
    match joined {
        Ok((job_id, Ok(state))) => debug!("Job {} finished as {}", job_id, state),
        Ok((job_id, Err(err))) => error!("Job {} failed: {}", job_id, err),
        Err(err) => error!("Job task failed to join: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::jobs::{JobRecord, MemoryJobStore, MockJobStore};
    use chrono::Utc;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry(counter: Arc<AtomicUsize>) -> FlowRegistry {
        let mut registry = FlowRegistry::new();
        registry.register("chain", move || {
            let mut flow = Flow::new("chain");
            let c = counter.clone();
            flow.node("first", &[], move |ctx| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    ctx.output("first", &1)?;
                    Ok(())
                }
            })?;
            let c = counter.clone();
            flow.node("second", &["first"], move |ctx| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    let first: i64 = ctx.input("first")?;
                    ctx.output("second", &(first + 1))?;
                    Ok(())
                }
            })?;
            Ok(flow)
        });
        registry
    }

    fn runner_with(store: Arc<dyn JobStore>, counter: Arc<AtomicUsize>) -> JobRunner {
        JobRunner::new(store, registry(counter), RunnerConfig::default())
    }

    #[tokio::test]
    async fn test_start_and_execute() {
        let store = Arc::new(MemoryJobStore::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let runner = runner_with(store.clone(), counter.clone());

        let job_id = runner.start_flow("chain", SeedArgs::new()).await.unwrap();
        // Seeding runs the root node before the job is stored
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(store.load(&job_id).await.unwrap().state, JobState::Pending);

        let state = runner
            .execute_job(&job_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state, JobState::Succeeded);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let record = store.load(&job_id).await.unwrap();
        let mut flow = runner.registry().build("chain").unwrap();
        flow.decode(&record.payload).unwrap();
        assert_eq!(flow.read::<i64>("second").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_start_unknown_flow() {
        let runner = runner_with(Arc::new(MemoryJobStore::new()), Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            runner.start_flow("missing", SeedArgs::new()).await,
            Err(FlowError::FlowNotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_payload_marks_job_failed() {
        let store = Arc::new(MemoryJobStore::new());
        let runner = runner_with(store.clone(), Arc::new(AtomicUsize::new(0)));
        let job_id = store.enqueue("chain", b"garbage".to_vec()).await.unwrap();

        let result = runner.execute_job(&job_id, &CancellationToken::new()).await;
        assert!(matches!(result, Err(FlowError::CorruptedPayload(_))));

        let record = store.load(&job_id).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.payload, b"garbage");
    }

    #[tokio::test]
    async fn test_cancelled_job_returns_to_queue() {
        let store = Arc::new(MemoryJobStore::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let runner = runner_with(store.clone(), counter.clone());
        let job_id = runner.start_flow("chain", SeedArgs::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let state = runner.execute_job(&job_id, &cancel).await.unwrap();

        assert_eq!(state, JobState::Pending);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(store.pop_jobs(1).await.unwrap(), vec![job_id]);
    }

    #[tokio::test]
    async fn test_update_failure_is_reported() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seed_runner = runner_with(Arc::new(MemoryJobStore::new()), counter.clone());
        let mut flow = seed_runner.registry().build("chain").unwrap();
        flow.seed(SeedArgs::new(), &CancellationToken::new()).await.unwrap();
        let payload = flow.encode().unwrap();

        let job_id = JobId::new();
        let record = JobRecord {
            id: job_id.clone(),
            flow_name: "chain".to_string(),
            state: JobState::Running,
            payload,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let mut store = MockJobStore::new();
        store
            .expect_load()
            .with(eq(job_id.clone()))
            .times(1)
            .returning(move |_| Ok(record.clone()));
        store
            .expect_update()
            .times(1)
            .returning(|_, _, _| Err(FlowError::Other("disk full".to_string())));

        let runner = runner_with(Arc::new(store), counter);
        let result = runner.execute_job(&job_id, &CancellationToken::new()).await;
        assert!(matches!(result, Err(FlowError::Other(msg)) if msg == "disk full"));
    }

    #[tokio::test]
    async fn test_run_loop_drains_queue() {
        let store = Arc::new(MemoryJobStore::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let config = RunnerConfig {
            batch_size: 2,
            poll_interval_ms: 10,
        };
        let runner = JobRunner::new(store.clone(), registry(counter.clone()), config);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(runner.start_flow("chain", SeedArgs::new()).await.unwrap());
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let runner = runner.clone();
            let cancel = cancel.clone();
            async move { runner.run(cancel).await }
        });

        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        for id in ids {
            assert_eq!(store.load(&id).await.unwrap().state, JobState::Succeeded);
        }
    }
}
