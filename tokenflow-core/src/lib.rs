//! Process virtual machine and job scheduler.
//!
//! The engine executes token-based process models: an [`ExecutionTree`] of
//! execution tokens advances through a compiled [`ProcessDefinition`] one
//! command at a time, parking on wait states and resuming through signals,
//! message correlation, timers, and async-continuation jobs. Deferred work
//! is persisted as [`JobEntity`] records that a polling [`JobExecutor`]
//! acquires, locks, and runs; bulk operations decompose into jobs through
//! batches. All state goes through the [`EngineStore`] seam with optimistic
//! revision checks.

pub mod batch;
pub mod behavior;
pub mod clock;
pub mod command;
pub mod error;
pub mod events;
pub mod execution;
pub mod executor;
pub mod incident;
pub mod job;
pub mod model;
pub mod runtime;
pub mod store;
pub mod store_memory;
pub mod types;

pub use batch::{BatchConfiguration, BatchEntity, MAX_CHUNK_SIZE};
pub use behavior::{ActivityBehavior, ConditionEvaluator, Outcome, VariableConditionEvaluator};
pub use clock::{Clock, FixedClock, SystemClock};
pub use command::{
    CancelProcessInstance, Command, CorrelateMessage, EngineConfig, ExecuteJob, FailJob,
    JobHandler, JobOutcome, ProcessEngine, SetJobRetries, SetSuspensionState, SignalExecution,
    StartProcessInstance,
};
pub use error::{EngineError, Result};
pub use events::RuntimeEvent;
pub use execution::{Execution, ExecutionTree};
pub use executor::{ExecutorState, JobExecutor, JobExecutorConfig};
pub use incident::Incident;
pub use job::{BackoffPolicy, JobEntity};
pub use model::{ActivityKind, ProcessDefinition, ProcessDefinitionBuilder};
pub use runtime::{PvmRuntime, RuntimeEffects};
pub use store::EngineStore;
pub use store_memory::MemoryStore;
pub use types::{
    BatchId, EventSubscription, EventType, ExecutionId, IncidentId, InstanceId, JobId,
    ProcessState, VariableValue, WaitState,
};

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;

    pub fn test_engine() -> (Arc<ProcessEngine>, Arc<FixedClock>) {
        test_engine_with_config(EngineConfig::default())
    }

    pub fn test_engine_with_config(
        config: EngineConfig,
    ) -> (Arc<ProcessEngine>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::default());
        let engine = ProcessEngine::with_parts(
            Arc::new(MemoryStore::new()),
            config,
            clock.clone(),
            Arc::new(VariableConditionEvaluator),
        );
        (engine, clock)
    }

    /// Runs jobs synchronously until nothing is due at the current clock
    /// reading, failure bookkeeping included. Keeps job tests deterministic
    /// without a background executor.
    pub async fn drain_due_jobs(engine: &ProcessEngine) {
        loop {
            let due = engine
                .store()
                .due_jobs(engine.clock().now(), usize::MAX)
                .await
                .unwrap();
            if due.is_empty() {
                break;
            }
            for job in due {
                if let Err(e) = engine.execute_job(job.id).await {
                    engine.fail_job(job.id, &e.to_string()).await.unwrap();
                }
            }
        }
    }
}
