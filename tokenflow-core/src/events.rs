use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Runtime events, the durable audit trail for every process instance and
/// batch. Appended through the command session so the log commits with the
/// state change it describes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance_id: InstanceId,
        definition_key: String,
    },
    ExecutionSpawned {
        execution_id: ExecutionId,
        parent: Option<ExecutionId>,
        activity_id: Option<String>,
    },
    TransitionTaken {
        execution_id: ExecutionId,
        transition_id: String,
        from: String,
        to: String,
    },
    SignalDelivered {
        execution_id: ExecutionId,
        signal_name: String,
    },
    MessageCorrelated {
        execution_id: ExecutionId,
        message_name: String,
    },
    JoinArrived {
        execution_id: ExecutionId,
        activity_id: String,
        transition_id: String,
    },
    JoinReleased {
        execution_id: ExecutionId,
        activity_id: String,
    },
    ExecutionEnded {
        execution_id: ExecutionId,
    },
    InstanceEnded {
        at: DateTime<Utc>,
    },
    InstanceCancelled {
        reason: String,
    },
    InstanceTerminated {
        at: DateTime<Utc>,
    },
    JobCreated {
        job_id: JobId,
        handler_type: String,
        due: DateTime<Utc>,
    },
    JobCompleted {
        job_id: JobId,
    },
    JobFailed {
        job_id: JobId,
        message: String,
        retries_remaining: u32,
    },
    IncidentCreated {
        incident_id: IncidentId,
        job_id: Option<JobId>,
    },
    BatchCreated {
        batch_id: BatchId,
        total_jobs: u32,
    },
    BatchCompleted {
        batch_id: BatchId,
    },
}
