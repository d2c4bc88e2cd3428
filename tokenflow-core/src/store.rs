use crate::batch::BatchEntity;
use crate::error::Result;
use crate::events::RuntimeEvent;
use crate::execution::ExecutionTree;
use crate::incident::Incident;
use crate::job::JobEntity;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Persistence seam for the engine. Updates carry the revision the caller
/// loaded; a store must reject the write when the persisted revision moved,
/// so two nodes mutating the same entity cannot both win.
///
/// Absent entities are `Ok(None)` from loads, never errors: a job executed
/// concurrently elsewhere is an expected outcome, not a fault.
#[async_trait]
pub trait EngineStore: Send + Sync {
    // ── Process instances ──

    async fn insert_instance(&self, tree: &ExecutionTree) -> Result<()>;

    async fn load_instance(&self, id: InstanceId) -> Result<Option<ExecutionTree>>;

    /// Persists `tree` if the stored revision still equals
    /// `expected_revision`. The caller has already bumped `tree.revision`.
    async fn update_instance(&self, tree: &ExecutionTree, expected_revision: u32) -> Result<()>;

    async fn instance_ids(&self) -> Result<Vec<InstanceId>>;

    // ── Jobs ──

    async fn insert_job(&self, job: &JobEntity) -> Result<()>;

    async fn load_job(&self, id: JobId) -> Result<Option<JobEntity>>;

    async fn update_job(&self, job: &JobEntity, expected_revision: u32) -> Result<()>;

    async fn delete_job(&self, id: JobId) -> Result<()>;

    /// Acquirable jobs ordered by priority (highest first), then due date
    /// (oldest first), capped at `limit`.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobEntity>>;

    /// Atomically locks one job for `owner` until `until`. Returns the
    /// locked job, or `None` when it is gone or no longer acquirable at
    /// `now`.
    async fn try_lock_job(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<JobEntity>>;

    async fn jobs_for_instance(&self, instance_id: InstanceId) -> Result<Vec<JobEntity>>;

    async fn delete_jobs_for_instance(&self, instance_id: InstanceId) -> Result<u32>;

    async fn jobs_for_batch(&self, batch_id: BatchId) -> Result<Vec<JobEntity>>;

    async fn delete_jobs_for_batch(&self, batch_id: BatchId) -> Result<u32>;

    // ── Incidents ──

    async fn insert_incident(&self, incident: &Incident) -> Result<()>;

    async fn incidents(&self) -> Result<Vec<Incident>>;

    /// Marks open incidents of this job resolved. Returns how many changed.
    async fn resolve_incidents_for_job(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        resolution: &str,
    ) -> Result<u32>;

    // ── Batches ──

    async fn insert_batch(&self, batch: &BatchEntity) -> Result<()>;

    async fn load_batch(&self, id: BatchId) -> Result<Option<BatchEntity>>;

    async fn update_batch(&self, batch: &BatchEntity, expected_revision: u32) -> Result<()>;

    async fn delete_batch(&self, id: BatchId) -> Result<()>;

    // ── Audit log ──

    async fn append_events(&self, events: &[RuntimeEvent]) -> Result<()>;

    async fn events(&self) -> Result<Vec<RuntimeEvent>>;
}
