use crate::batch::BatchEntity;
use crate::error::{EngineError, Result};
use crate::events::RuntimeEvent;
use crate::execution::ExecutionTree;
use crate::incident::Incident;
use crate::job::JobEntity;
use crate::store::EngineStore;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// In-memory store. One coarse lock over all tables: revision checks and
/// job locking observe a consistent snapshot, which is exactly what a
/// transactional backend would give.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<InstanceId, ExecutionTree>,
    jobs: BTreeMap<JobId, JobEntity>,
    incidents: Vec<Incident>,
    batches: BTreeMap<BatchId, BatchEntity>,
    events: Vec<RuntimeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn insert_instance(&self, tree: &ExecutionTree) -> Result<()> {
        self.inner
            .lock()
            .await
            .instances
            .insert(tree.instance_id, tree.clone());
        Ok(())
    }

    async fn load_instance(&self, id: InstanceId) -> Result<Option<ExecutionTree>> {
        Ok(self.inner.lock().await.instances.get(&id).cloned())
    }

    async fn update_instance(&self, tree: &ExecutionTree, expected_revision: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .instances
            .get(&tree.instance_id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "process instance",
                id: tree.instance_id.to_string(),
            })?;
        if stored.revision != expected_revision {
            return Err(EngineError::OptimisticLocking {
                entity: "process instance",
                id: tree.instance_id.to_string(),
            });
        }
        inner.instances.insert(tree.instance_id, tree.clone());
        Ok(())
    }

    async fn instance_ids(&self) -> Result<Vec<InstanceId>> {
        Ok(self.inner.lock().await.instances.keys().copied().collect())
    }

    async fn insert_job(&self, job: &JobEntity) -> Result<()> {
        self.inner.lock().await.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> Result<Option<JobEntity>> {
        Ok(self.inner.lock().await.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: &JobEntity, expected_revision: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner.jobs.get(&job.id).ok_or_else(|| EngineError::NotFound {
            entity: "job",
            id: job.id.to_string(),
        })?;
        if stored.revision != expected_revision {
            return Err(EngineError::OptimisticLocking {
                entity: "job",
                id: job.id.to_string(),
            });
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        self.inner.lock().await.jobs.remove(&id);
        Ok(())
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobEntity>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<JobEntity> = inner
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .cloned()
            .collect();
        due.sort_by_key(|j| (Reverse(j.priority), j.due));
        due.truncate(limit);
        Ok(due)
    }

    async fn try_lock_job(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<JobEntity>> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !job.is_acquirable(now) {
            return Ok(None);
        }
        job.lock_owner = Some(owner.to_string());
        job.lock_expiration = Some(until);
        job.revision += 1;
        Ok(Some(job.clone()))
    }

    async fn jobs_for_instance(&self, instance_id: InstanceId) -> Result<Vec<JobEntity>> {
        Ok(self
            .inner
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.instance_id == Some(instance_id))
            .cloned()
            .collect())
    }

    async fn delete_jobs_for_instance(&self, instance_id: InstanceId) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| j.instance_id != Some(instance_id));
        Ok((before - inner.jobs.len()) as u32)
    }

    async fn jobs_for_batch(&self, batch_id: BatchId) -> Result<Vec<JobEntity>> {
        Ok(self
            .inner
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.batch_id == Some(batch_id))
            .cloned()
            .collect())
    }

    async fn delete_jobs_for_batch(&self, batch_id: BatchId) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| j.batch_id != Some(batch_id));
        Ok((before - inner.jobs.len()) as u32)
    }

    async fn insert_incident(&self, incident: &Incident) -> Result<()> {
        self.inner.lock().await.incidents.push(incident.clone());
        Ok(())
    }

    async fn incidents(&self) -> Result<Vec<Incident>> {
        Ok(self.inner.lock().await.incidents.clone())
    }

    async fn resolve_incidents_for_job(
        &self,
        job_id: JobId,
        at: DateTime<Utc>,
        resolution: &str,
    ) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        let mut resolved = 0;
        for incident in inner
            .incidents
            .iter_mut()
            .filter(|i| i.job_id == Some(job_id) && i.resolved_at.is_none())
        {
            incident.resolved_at = Some(at);
            incident.resolution = Some(resolution.to_string());
            resolved += 1;
        }
        Ok(resolved)
    }

    async fn insert_batch(&self, batch: &BatchEntity) -> Result<()> {
        self.inner.lock().await.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn load_batch(&self, id: BatchId) -> Result<Option<BatchEntity>> {
        Ok(self.inner.lock().await.batches.get(&id).cloned())
    }

    async fn update_batch(&self, batch: &BatchEntity, expected_revision: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .batches
            .get(&batch.id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "batch",
                id: batch.id.to_string(),
            })?;
        if stored.revision != expected_revision {
            return Err(EngineError::OptimisticLocking {
                entity: "batch",
                id: batch.id.to_string(),
            });
        }
        inner.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn delete_batch(&self, id: BatchId) -> Result<()> {
        self.inner.lock().await.batches.remove(&id);
        Ok(())
    }

    async fn append_events(&self, events: &[RuntimeEvent]) -> Result<()> {
        self.inner.lock().await.events.extend_from_slice(events);
        Ok(())
    }

    async fn events(&self) -> Result<Vec<RuntimeEvent>> {
        Ok(self.inner.lock().await.events.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn job_due(priority: i64, due: DateTime<Utc>) -> JobEntity {
        let mut job = JobEntity::new("timer", serde_json::json!({}), due);
        job.priority = priority;
        job
    }

    #[tokio::test]
    async fn due_jobs_ordered_by_priority_then_due() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let low_old = job_due(0, now - Duration::seconds(60));
        let low_new = job_due(0, now - Duration::seconds(10));
        let high = job_due(10, now - Duration::seconds(1));
        let future = job_due(100, now + Duration::seconds(60));
        for job in [&low_old, &low_new, &high, &future] {
            store.insert_job(job).await.unwrap();
        }
        let due = store.due_jobs(now, 10).await.unwrap();
        let ids: Vec<JobId> = due.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high.id, low_old.id, low_new.id]);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job = job_due(0, now - Duration::seconds(1));
        store.insert_job(&job).await.unwrap();

        let locked = store
            .try_lock_job(job.id, "node-1", now, now + Duration::minutes(5))
            .await
            .unwrap();
        assert!(locked.is_some());
        assert!(store
            .try_lock_job(job.id, "node-2", now, now + Duration::minutes(5))
            .await
            .unwrap()
            .is_none());

        // Simulate an expired lock; another node may take over.
        let mut stale = locked.unwrap();
        stale.lock_expiration = Some(now - Duration::seconds(1));
        store.update_job(&stale, stale.revision).await.unwrap();
        assert!(store
            .try_lock_job(job.id, "node-2", now, now + Duration::minutes(5))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn stale_revision_update_is_rejected() {
        let store = MemoryStore::new();
        let job = job_due(0, Utc::now());
        store.insert_job(&job).await.unwrap();

        let mut fresh = job.clone();
        fresh.revision += 1;
        store.update_job(&fresh, job.revision).await.unwrap();

        let mut stale = job.clone();
        stale.retries = 0;
        let err = store.update_job(&stale, job.revision).await.unwrap_err();
        assert!(err.is_optimistic_locking());
    }

    #[tokio::test]
    async fn instance_scoped_job_cleanup() {
        let store = MemoryStore::new();
        let instance = Uuid::now_v7();
        let mut a = job_due(0, Utc::now());
        a.instance_id = Some(instance);
        let mut b = job_due(0, Utc::now());
        b.instance_id = Some(Uuid::now_v7());
        store.insert_job(&a).await.unwrap();
        store.insert_job(&b).await.unwrap();
        assert_eq!(store.delete_jobs_for_instance(instance).await.unwrap(), 1);
        assert!(store.load_job(a.id).await.unwrap().is_none());
        assert!(store.load_job(b.id).await.unwrap().is_some());
    }
}
