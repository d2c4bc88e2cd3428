use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted record of a terminally failed job. Incidents are never thrown
/// back at a caller; they sit in the store until someone resets the job's
/// retries or cancels the surrounding work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub instance_id: Option<InstanceId>,
    pub execution_id: Option<ExecutionId>,
    pub job_id: Option<JobId>,
    pub activity_id: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

impl Incident {
    pub fn for_job(
        job_id: JobId,
        instance_id: Option<InstanceId>,
        execution_id: Option<ExecutionId>,
        message: String,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            execution_id,
            job_id: Some(job_id),
            activity_id: None,
            message,
            created_at: at,
            resolved_at: None,
            resolution: None,
        }
    }
}
