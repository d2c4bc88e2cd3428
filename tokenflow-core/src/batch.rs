use crate::command::{JobHandler, JobOutcome, ProcessEngine};
use crate::error::{EngineError, Result};
use crate::events::RuntimeEvent;
use crate::job::{JobEntity, BATCH_EXECUTION_HANDLER, BATCH_MONITOR_HANDLER, BATCH_SEED_HANDLER};
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Largest permitted `invocations_per_batch_job`.
pub const MAX_CHUNK_SIZE: u32 = 500;

pub const CANCEL_INSTANCES_BATCH: &str = "cancel-instances";

pub fn validate_chunk_size(chunk_size: u32) -> Result<()> {
    if chunk_size < 1 || chunk_size > MAX_CHUNK_SIZE {
        return Err(EngineError::BadUserRequest(format!(
            "chunk size should be between 1 and {MAX_CHUNK_SIZE}, but was {chunk_size}"
        )));
    }
    Ok(())
}

/// The work list a batch decomposes, stored with the batch so seed runs can
/// resume from where the previous run stopped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfiguration {
    pub items: Vec<InstanceId>,
    pub reason: String,
}

/// A long-running bulk operation, decomposed into execution jobs by a seed
/// job and supervised by a monitor job until every execution job is gone.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchEntity {
    pub id: BatchId,
    pub revision: u32,
    pub batch_type: String,
    pub configuration: BatchConfiguration,
    /// How many execution jobs this batch needs in total.
    pub total_jobs: u32,
    /// How many execution jobs have been created so far.
    pub jobs_created: u32,
    pub batch_jobs_per_seed: u32,
    pub invocations_per_batch_job: u32,
    pub seed_job_id: Option<JobId>,
    pub monitor_job_id: Option<JobId>,
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
}

impl BatchEntity {
    pub fn new(
        batch_type: &str,
        configuration: BatchConfiguration,
        batch_jobs_per_seed: u32,
        invocations_per_batch_job: u32,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        validate_chunk_size(invocations_per_batch_job)?;
        if batch_jobs_per_seed == 0 {
            return Err(EngineError::BadUserRequest(
                "batch jobs per seed must be positive".into(),
            ));
        }
        let items = configuration.items.len() as u32;
        let total_jobs = items.div_ceil(invocations_per_batch_job);
        Ok(Self {
            id: Uuid::now_v7(),
            revision: 0,
            batch_type: batch_type.to_string(),
            configuration,
            total_jobs,
            jobs_created: 0,
            batch_jobs_per_seed,
            invocations_per_batch_job,
            seed_job_id: None,
            monitor_job_id: None,
            suspended: false,
            created_at,
        })
    }

    pub fn is_seed_done(&self) -> bool {
        self.jobs_created >= self.total_jobs
    }
}

/// Payload of seed and monitor jobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchJobConfig {
    pub batch_id: BatchId,
}

/// Payload of one execution job: the slice of work it owns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchExecutionConfig {
    pub batch_id: BatchId,
    pub items: Vec<InstanceId>,
    pub reason: String,
}

fn to_config_value<T: Serialize>(config: &T) -> Result<serde_json::Value> {
    serde_json::to_value(config)
        .map_err(|e| EngineError::ProcessEngine(format!("serialize batch job config: {e}")))
}

impl ProcessEngine {
    /// Creates a batch cancelling the given instances, plus its seed and
    /// monitor jobs. The work itself happens asynchronously through the job
    /// executor.
    pub async fn cancel_instances_batch(
        &self,
        instance_ids: Vec<InstanceId>,
        reason: &str,
    ) -> Result<BatchId> {
        if instance_ids.is_empty() {
            return Err(EngineError::BadUserRequest(
                "batch needs at least one instance".into(),
            ));
        }
        let now = self.clock().now();
        let configuration = BatchConfiguration {
            items: instance_ids,
            reason: reason.to_string(),
        };
        let mut batch = BatchEntity::new(
            CANCEL_INSTANCES_BATCH,
            configuration,
            self.config().batch_jobs_per_seed,
            self.config().invocations_per_batch_job,
            now,
        )?;

        let config_value = to_config_value(&BatchJobConfig { batch_id: batch.id })?;
        let mut seed = JobEntity::new(BATCH_SEED_HANDLER, config_value.clone(), now);
        seed.batch_id = Some(batch.id);
        let mut monitor = JobEntity::new(
            BATCH_MONITOR_HANDLER,
            config_value,
            now + self.monitor_poll_interval(),
        );
        monitor.batch_id = Some(batch.id);
        batch.seed_job_id = Some(seed.id);
        batch.monitor_job_id = Some(monitor.id);

        info!(batch = %batch.id, total_jobs = batch.total_jobs, "creating cancellation batch");
        self.store().insert_batch(&batch).await?;
        self.store().insert_job(&seed).await?;
        self.store().insert_job(&monitor).await?;
        self.store()
            .append_events(&[RuntimeEvent::BatchCreated {
                batch_id: batch.id,
                total_jobs: batch.total_jobs,
            }])
            .await?;
        self.job_notifier().notify_waiters();
        Ok(batch.id)
    }
}

// ─── Handlers ─────────────────────────────────────────────────

/// Creates up to `batch_jobs_per_seed` execution jobs per run and
/// reschedules itself until the whole work list is decomposed.
pub struct BatchSeedJobHandler;

#[async_trait]
impl JobHandler for BatchSeedJobHandler {
    fn handler_type(&self) -> &'static str {
        BATCH_SEED_HANDLER
    }

    async fn execute(&self, engine: &ProcessEngine, job: &JobEntity) -> Result<JobOutcome> {
        let config: BatchJobConfig = job.parse_configuration()?;
        let Some(mut batch) = engine.store().load_batch(config.batch_id).await? else {
            debug!(batch = %config.batch_id, "batch gone, dropping seed job");
            return Ok(JobOutcome::Completed);
        };
        if batch.suspended {
            return Err(EngineError::SuspendedEntity {
                entity: "batch",
                id: batch.id.to_string(),
            });
        }
        let loaded_revision = batch.revision;
        let now = engine.clock().now();

        let consumed =
            ((batch.jobs_created * batch.invocations_per_batch_job) as usize)
                .min(batch.configuration.items.len());
        let chunks: Vec<Vec<InstanceId>> = batch.configuration.items[consumed..]
            .chunks(batch.invocations_per_batch_job as usize)
            .take(batch.batch_jobs_per_seed as usize)
            .map(<[InstanceId]>::to_vec)
            .collect();
        let created = chunks.len() as u32;

        // Claim the range before creating any execution job: two nodes
        // running the same seed (lock expired, job reclaimed) would otherwise
        // both insert this chunk, and only then lose the revision check.
        batch.jobs_created += created;
        batch.revision += 1;
        engine.store().update_batch(&batch, loaded_revision).await?;

        for items in chunks {
            let exec_config = to_config_value(&BatchExecutionConfig {
                batch_id: batch.id,
                items,
                reason: batch.configuration.reason.clone(),
            })?;
            let mut exec_job = JobEntity::new(BATCH_EXECUTION_HANDLER, exec_config, now);
            exec_job.batch_id = Some(batch.id);
            engine.store().insert_job(&exec_job).await?;
        }
        engine.job_notifier().notify_waiters();
        debug!(batch = %batch.id, created, total = batch.total_jobs, "seed run");

        if batch.is_seed_done() {
            Ok(JobOutcome::Completed)
        } else {
            Ok(JobOutcome::Reschedule { due: now })
        }
    }
}

/// Polls until the seed is done and every execution job is gone, then
/// completes the batch and cascades the delete.
pub struct BatchMonitorJobHandler;

#[async_trait]
impl JobHandler for BatchMonitorJobHandler {
    fn handler_type(&self) -> &'static str {
        BATCH_MONITOR_HANDLER
    }

    async fn execute(&self, engine: &ProcessEngine, job: &JobEntity) -> Result<JobOutcome> {
        let config: BatchJobConfig = job.parse_configuration()?;
        let Some(batch) = engine.store().load_batch(config.batch_id).await? else {
            debug!(batch = %config.batch_id, "batch gone, dropping monitor job");
            return Ok(JobOutcome::Completed);
        };
        let pending = engine
            .store()
            .jobs_for_batch(batch.id)
            .await?
            .iter()
            .filter(|j| j.handler_type == BATCH_EXECUTION_HANDLER)
            .count();
        if batch.is_seed_done() && pending == 0 {
            info!(batch = %batch.id, "batch completed");
            engine.store().delete_jobs_for_batch(batch.id).await?;
            engine.store().delete_batch(batch.id).await?;
            engine
                .store()
                .append_events(&[RuntimeEvent::BatchCompleted { batch_id: batch.id }])
                .await?;
            Ok(JobOutcome::Completed)
        } else {
            Ok(JobOutcome::Reschedule {
                due: engine.clock().now() + engine.monitor_poll_interval(),
            })
        }
    }
}

/// Cancels its slice of instances. Instances that are gone or already ended
/// are skipped, so a retried execution job never trips over its own earlier
/// progress.
pub struct BatchExecutionJobHandler;

#[async_trait]
impl JobHandler for BatchExecutionJobHandler {
    fn handler_type(&self) -> &'static str {
        BATCH_EXECUTION_HANDLER
    }

    async fn execute(&self, engine: &ProcessEngine, job: &JobEntity) -> Result<JobOutcome> {
        let config: BatchExecutionConfig = job.parse_configuration()?;
        for instance_id in &config.items {
            let cancelled = engine
                .cancel_instance_if_exists(*instance_id, &config.reason)
                .await?;
            if !cancelled {
                debug!(instance = %instance_id, "batch target already gone");
            }
        }
        Ok(JobOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::VariableConditionEvaluator;
    use crate::clock::FixedClock;
    use crate::command::EngineConfig;
    use crate::execution::ExecutionTree;
    use crate::incident::Incident;
    use crate::model::ProcessDefinition;
    use crate::store::EngineStore;
    use crate::store_memory::MemoryStore;
    use crate::test_support::{drain_due_jobs, test_engine, test_engine_with_config};
    use chrono::Duration;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn chunk_size_bounds() {
        assert!(validate_chunk_size(1).is_ok());
        assert!(validate_chunk_size(MAX_CHUNK_SIZE).is_ok());
        let err = validate_chunk_size(0).unwrap_err();
        assert!(err.to_string().contains("chunk size should be between 1 and"));
        let err = validate_chunk_size(MAX_CHUNK_SIZE + 1).unwrap_err();
        assert!(err.to_string().contains("chunk size should be between 1 and"));
    }

    #[test]
    fn total_jobs_rounds_up() {
        let config = BatchConfiguration {
            items: (0..7).map(|_| Uuid::now_v7()).collect(),
            reason: "test".into(),
        };
        let batch = BatchEntity::new("t", config, 2, 3, Utc::now()).unwrap();
        assert_eq!(batch.total_jobs, 3);
        assert!(!batch.is_seed_done());
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let (engine, _clock) = test_engine();
        let err = engine
            .cancel_instances_batch(Vec::new(), "cleanup")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BadUserRequest(_)));
    }

    #[tokio::test]
    async fn seed_fans_out_in_bounded_runs() {
        let config = EngineConfig {
            batch_jobs_per_seed: 2,
            invocations_per_batch_job: 3,
            ..EngineConfig::default()
        };
        let (engine, _clock) = test_engine_with_config(config);
        // Unknown instance ids: cancellation skips them, the arithmetic is
        // what this test is about.
        let items: Vec<InstanceId> = (0..7).map(|_| Uuid::now_v7()).collect();
        let batch_id = engine.cancel_instances_batch(items, "cleanup").await.unwrap();

        let batch = engine.store().load_batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.total_jobs, 3);
        let seed_id = batch.seed_job_id.unwrap();

        // First run creates batch_jobs_per_seed execution jobs and stays.
        engine.execute_job(seed_id).await.unwrap();
        let batch = engine.store().load_batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.jobs_created, 2);
        assert!(engine.store().load_job(seed_id).await.unwrap().is_some());

        // Second run creates the remainder and completes.
        engine.execute_job(seed_id).await.unwrap();
        let batch = engine.store().load_batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.jobs_created, 3);
        assert!(batch.is_seed_done());
        assert!(engine.store().load_job(seed_id).await.unwrap().is_none());

        let execution_jobs: Vec<JobEntity> = engine
            .store()
            .jobs_for_batch(batch_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.handler_type == BATCH_EXECUTION_HANDLER)
            .collect();
        assert_eq!(execution_jobs.len(), 3);
        // 3 + 3 + 1 items across the three jobs.
        let mut sizes: Vec<usize> = execution_jobs
            .iter()
            .map(|j| {
                j.parse_configuration::<BatchExecutionConfig>()
                    .unwrap()
                    .items
                    .len()
            })
            .collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 3, 3]);
    }

    #[tokio::test]
    async fn batch_cancels_instances_and_completes() {
        let (engine, clock) = test_engine();
        let def = ProcessDefinition::builder("waits")
            .start_event("start")
            .receive_task("wait")
            .end_event("end")
            .flow("start", "wait")
            .flow("wait", "end")
            .build()
            .unwrap();
        engine.deploy(def);

        let mut instances = Vec::new();
        for _ in 0..3 {
            instances.push(engine.start_instance("waits", BTreeMap::new()).await.unwrap());
        }
        let batch_id = engine
            .cancel_instances_batch(instances.clone(), "bulk cleanup")
            .await
            .unwrap();

        // Seed and execution jobs run now; the monitor is due later.
        drain_due_jobs(&engine).await;
        for instance_id in &instances {
            let tree = engine.instance(*instance_id).await.unwrap().unwrap();
            assert!(matches!(tree.state, ProcessState::Cancelled { .. }));
        }
        assert!(engine.store().load_batch(batch_id).await.unwrap().is_some());

        // Monitor observes the drained batch and completes it.
        clock.advance(Duration::milliseconds(
            engine.config().monitor_poll_interval_ms as i64,
        ));
        drain_due_jobs(&engine).await;
        assert!(engine.store().load_batch(batch_id).await.unwrap().is_none());
        assert!(engine.store().jobs_for_batch(batch_id).await.unwrap().is_empty());
        let events = engine.store().events().await.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, RuntimeEvent::BatchCompleted { batch_id: b } if *b == batch_id)));
    }

    /// Store that rejects the next batch update with a revision conflict,
    /// standing in for a second node that flushed the same seed run first.
    struct ContendedStore {
        inner: MemoryStore,
        fail_next_batch_update: AtomicBool,
    }

    #[async_trait]
    impl EngineStore for ContendedStore {
        async fn insert_instance(&self, tree: &ExecutionTree) -> Result<()> {
            self.inner.insert_instance(tree).await
        }
        async fn load_instance(&self, id: InstanceId) -> Result<Option<ExecutionTree>> {
            self.inner.load_instance(id).await
        }
        async fn update_instance(
            &self,
            tree: &ExecutionTree,
            expected_revision: u32,
        ) -> Result<()> {
            self.inner.update_instance(tree, expected_revision).await
        }
        async fn instance_ids(&self) -> Result<Vec<InstanceId>> {
            self.inner.instance_ids().await
        }
        async fn insert_job(&self, job: &JobEntity) -> Result<()> {
            self.inner.insert_job(job).await
        }
        async fn load_job(&self, id: JobId) -> Result<Option<JobEntity>> {
            self.inner.load_job(id).await
        }
        async fn update_job(&self, job: &JobEntity, expected_revision: u32) -> Result<()> {
            self.inner.update_job(job, expected_revision).await
        }
        async fn delete_job(&self, id: JobId) -> Result<()> {
            self.inner.delete_job(id).await
        }
        async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobEntity>> {
            self.inner.due_jobs(now, limit).await
        }
        async fn try_lock_job(
            &self,
            id: JobId,
            owner: &str,
            now: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> Result<Option<JobEntity>> {
            self.inner.try_lock_job(id, owner, now, until).await
        }
        async fn jobs_for_instance(&self, instance_id: InstanceId) -> Result<Vec<JobEntity>> {
            self.inner.jobs_for_instance(instance_id).await
        }
        async fn delete_jobs_for_instance(&self, instance_id: InstanceId) -> Result<u32> {
            self.inner.delete_jobs_for_instance(instance_id).await
        }
        async fn jobs_for_batch(&self, batch_id: BatchId) -> Result<Vec<JobEntity>> {
            self.inner.jobs_for_batch(batch_id).await
        }
        async fn delete_jobs_for_batch(&self, batch_id: BatchId) -> Result<u32> {
            self.inner.delete_jobs_for_batch(batch_id).await
        }
        async fn insert_incident(&self, incident: &Incident) -> Result<()> {
            self.inner.insert_incident(incident).await
        }
        async fn incidents(&self) -> Result<Vec<Incident>> {
            self.inner.incidents().await
        }
        async fn resolve_incidents_for_job(
            &self,
            job_id: JobId,
            at: DateTime<Utc>,
            resolution: &str,
        ) -> Result<u32> {
            self.inner.resolve_incidents_for_job(job_id, at, resolution).await
        }
        async fn insert_batch(&self, batch: &BatchEntity) -> Result<()> {
            self.inner.insert_batch(batch).await
        }
        async fn load_batch(&self, id: BatchId) -> Result<Option<BatchEntity>> {
            self.inner.load_batch(id).await
        }
        async fn update_batch(&self, batch: &BatchEntity, expected_revision: u32) -> Result<()> {
            if self.fail_next_batch_update.swap(false, Ordering::SeqCst) {
                return Err(EngineError::OptimisticLocking {
                    entity: "batch",
                    id: batch.id.to_string(),
                });
            }
            self.inner.update_batch(batch, expected_revision).await
        }
        async fn delete_batch(&self, id: BatchId) -> Result<()> {
            self.inner.delete_batch(id).await
        }
        async fn append_events(&self, events: &[RuntimeEvent]) -> Result<()> {
            self.inner.append_events(events).await
        }
        async fn events(&self) -> Result<Vec<RuntimeEvent>> {
            self.inner.events().await
        }
    }

    #[tokio::test]
    async fn seed_losing_revision_race_creates_no_duplicate_jobs() {
        let store = Arc::new(ContendedStore {
            inner: MemoryStore::new(),
            fail_next_batch_update: AtomicBool::new(false),
        });
        let engine = ProcessEngine::with_parts(
            store.clone(),
            EngineConfig {
                batch_jobs_per_seed: 2,
                invocations_per_batch_job: 1,
                ..EngineConfig::default()
            },
            Arc::new(FixedClock::default()),
            Arc::new(VariableConditionEvaluator),
        );
        let items: Vec<InstanceId> = (0..3).map(|_| Uuid::now_v7()).collect();
        let batch_id = engine.cancel_instances_batch(items, "cleanup").await.unwrap();
        let seed_id = engine
            .store()
            .load_batch(batch_id)
            .await
            .unwrap()
            .unwrap()
            .seed_job_id
            .unwrap();

        // First attempt loses the revision race; the command retry must pick
        // up from the claimed range, not re-insert the chunk.
        store.fail_next_batch_update.store(true, Ordering::SeqCst);
        engine.execute_job(seed_id).await.unwrap();

        let batch = engine.store().load_batch(batch_id).await.unwrap().unwrap();
        assert_eq!(batch.jobs_created, 2);
        let execution_jobs = engine
            .store()
            .jobs_for_batch(batch_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.handler_type == BATCH_EXECUTION_HANDLER)
            .count();
        assert_eq!(execution_jobs, batch.jobs_created as usize);
    }

    #[tokio::test]
    async fn rerun_of_execution_job_skips_done_work() {
        let (engine, _clock) = test_engine();
        let def = ProcessDefinition::builder("waits")
            .start_event("start")
            .receive_task("wait")
            .end_event("end")
            .flow("start", "wait")
            .flow("wait", "end")
            .build()
            .unwrap();
        engine.deploy(def);
        let instance_id = engine.start_instance("waits", BTreeMap::new()).await.unwrap();

        let exec_config = to_config_value(&BatchExecutionConfig {
            batch_id: Uuid::now_v7(),
            items: vec![instance_id, Uuid::now_v7()],
            reason: "cleanup".into(),
        })
        .unwrap();
        let job = JobEntity::new(BATCH_EXECUTION_HANDLER, exec_config, engine.clock().now());
        engine.store().insert_job(&job).await.unwrap();

        engine.execute_job(job.id).await.unwrap();
        // Running the same payload again must not fail on the now-ended
        // instance.
        engine.store().insert_job(&job).await.unwrap();
        engine.execute_job(job.id).await.unwrap();
    }
}
