use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Process instance identifier (the root execution's instance).
pub type InstanceId = Uuid;

/// Execution token identifier.
pub type ExecutionId = Uuid;

/// Persisted job identifier.
pub type JobId = Uuid;

/// Batch identifier.
pub type BatchId = Uuid;

/// Incident identifier.
pub type IncidentId = Uuid;

// ─── Variables ────────────────────────────────────────────────

/// A typed variable value held in an execution scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Json(serde_json::Value),
}

impl VariableValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            VariableValue::Null => false,
            VariableValue::Bool(b) => *b,
            VariableValue::Int(n) => *n != 0,
            VariableValue::Str(s) => !s.is_empty(),
            VariableValue::Json(v) => !v.is_null(),
        }
    }
}

// ─── Event subscriptions ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Message,
    Signal,
}

/// A parked execution's interest in an external event, keyed by type and name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub event_type: EventType,
    pub event_name: String,
    pub activity_id: String,
    pub created_at: DateTime<Utc>,
}

// ─── Wait states ──────────────────────────────────────────────

/// What a parked execution is blocked on. An execution with `waiting: None`
/// owns the control flow; a waiting execution only moves again through the
/// matching resume path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WaitState {
    /// Waiting for an external signal with this name (receive tasks use the
    /// activity id as the signal name).
    Signal { name: String },
    /// Waiting for a correlated message.
    Message { name: String },
    /// Waiting for a timer job to fire.
    Timer { due: DateTime<Utc> },
    /// Parked at a join until the remaining incoming transitions arrive.
    Join { activity_id: String },
    /// Parked before an async activity until the continuation job runs.
    AsyncContinuation { job_id: JobId },
}

// ─── Process state ────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProcessState {
    Running,
    Suspended,
    Completed { at: DateTime<Utc> },
    Cancelled { reason: String, at: DateTime<Utc> },
    Terminated { at: DateTime<Utc> },
}

impl ProcessState {
    /// True if no further progress is possible for this instance.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed { .. }
                | ProcessState::Cancelled { .. }
                | ProcessState::Terminated { .. }
        )
    }
}
