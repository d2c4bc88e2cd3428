use crate::behavior::{ConditionEvaluator, VariableConditionEvaluator};
use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, Result};
use crate::events::RuntimeEvent;
use crate::execution::ExecutionTree;
use crate::incident::Incident;
use crate::job::{
    AsyncContinuationConfig, BackoffPolicy, JobEntity, TimerConfig, ASYNC_CONTINUATION_HANDLER,
    TIMER_HANDLER,
};
use crate::model::ProcessDefinition;
use crate::runtime::{PvmRuntime, RuntimeEffects};
use crate::store::EngineStore;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Engine-wide tunables.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How often a command is retried after an optimistic lock conflict
    /// before the error surfaces to the caller.
    pub optimistic_lock_retries: u32,
    /// Reschedule policy for failed jobs that still have retries.
    pub backoff: BackoffPolicy,
    /// Maximum execution jobs created per seed job run.
    pub batch_jobs_per_seed: u32,
    /// Work items folded into one batch execution job.
    pub invocations_per_batch_job: u32,
    /// Monitor job poll interval while a batch is in flight.
    pub monitor_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            optimistic_lock_retries: 3,
            backoff: BackoffPolicy::default(),
            batch_jobs_per_seed: 100,
            invocations_per_batch_job: 1,
            monitor_poll_interval_ms: 30_000,
        }
    }
}

// ─── Commands ─────────────────────────────────────────────────

/// One externally triggered unit of work. A command loads fresh state,
/// mutates it through the virtual machine, and flushes with revision
/// checks; nothing is persisted when it errors. The engine reference is
/// the explicit context, passed by parameter instead of ambient state.
#[async_trait]
pub trait Command: Send + Sync {
    type Output: Send;

    async fn execute(&self, engine: &ProcessEngine) -> Result<Self::Output>;
}

pub struct StartProcessInstance {
    pub definition_key: String,
    pub variables: BTreeMap<String, VariableValue>,
}

#[async_trait]
impl Command for StartProcessInstance {
    type Output = InstanceId;

    async fn execute(&self, engine: &ProcessEngine) -> Result<InstanceId> {
        let runtime = engine.runtime(&self.definition_key)?;
        let (tree, effects) = runtime.start_instance(self.variables.clone())?;
        let instance_id = tree.instance_id;
        info!(instance = %instance_id, definition = %self.definition_key, "starting instance");
        engine.store.insert_instance(&tree).await?;
        engine.flush_jobs_and_events(&effects).await?;
        Ok(instance_id)
    }
}

pub struct SignalExecution {
    pub instance_id: InstanceId,
    pub execution_id: ExecutionId,
    pub signal_name: String,
    pub payload: BTreeMap<String, VariableValue>,
}

#[async_trait]
impl Command for SignalExecution {
    type Output = ();

    async fn execute(&self, engine: &ProcessEngine) -> Result<()> {
        let mut tree = engine.load_instance_required(self.instance_id).await?;
        let loaded_revision = tree.revision;
        let runtime = engine.runtime(&tree.definition_key)?;
        let effects = runtime.signal(
            &mut tree,
            self.execution_id,
            &self.signal_name,
            &self.payload,
        )?;
        engine
            .apply_instance_effects(tree, loaded_revision, effects)
            .await
    }
}

pub struct CorrelateMessage {
    pub message_name: String,
    pub payload: BTreeMap<String, VariableValue>,
}

#[async_trait]
impl Command for CorrelateMessage {
    type Output = Option<(InstanceId, ExecutionId)>;

    async fn execute(&self, engine: &ProcessEngine) -> Result<Self::Output> {
        for instance_id in engine.store.instance_ids().await? {
            let Some(mut tree) = engine.store.load_instance(instance_id).await? else {
                continue;
            };
            let loaded_revision = tree.revision;
            let runtime = engine.runtime(&tree.definition_key)?;
            if let Some((execution_id, effects)) =
                runtime.correlate_message(&mut tree, &self.message_name, &self.payload)?
            {
                engine
                    .apply_instance_effects(tree, loaded_revision, effects)
                    .await?;
                return Ok(Some((instance_id, execution_id)));
            }
        }
        Ok(None)
    }
}

pub struct CancelProcessInstance {
    pub instance_id: InstanceId,
    pub reason: String,
}

#[async_trait]
impl Command for CancelProcessInstance {
    type Output = ();

    async fn execute(&self, engine: &ProcessEngine) -> Result<()> {
        engine
            .cancel(self.instance_id, &self.reason, true)
            .await
            .map(|_| ())
    }
}

/// Cancellation that treats a missing or already-ended instance as a
/// no-op; batch jobs must stay re-runnable. Output is whether an instance
/// was actually cancelled.
pub(crate) struct CancelProcessInstanceIfExists {
    pub instance_id: InstanceId,
    pub reason: String,
}

#[async_trait]
impl Command for CancelProcessInstanceIfExists {
    type Output = bool;

    async fn execute(&self, engine: &ProcessEngine) -> Result<bool> {
        engine.cancel(self.instance_id, &self.reason, false).await
    }
}

pub struct SetSuspensionState {
    pub instance_id: InstanceId,
    pub suspended: bool,
}

#[async_trait]
impl Command for SetSuspensionState {
    type Output = ();

    async fn execute(&self, engine: &ProcessEngine) -> Result<()> {
        engine.set_suspended(self.instance_id, self.suspended).await
    }
}

pub struct ExecuteJob {
    pub job_id: JobId,
}

#[async_trait]
impl Command for ExecuteJob {
    type Output = ();

    async fn execute(&self, engine: &ProcessEngine) -> Result<()> {
        engine.run_job(self.job_id).await
    }
}

pub struct FailJob {
    pub job_id: JobId,
    pub message: String,
}

#[async_trait]
impl Command for FailJob {
    type Output = ();

    async fn execute(&self, engine: &ProcessEngine) -> Result<()> {
        engine.record_job_failure(self.job_id, &self.message).await
    }
}

pub struct SetJobRetries {
    pub job_id: JobId,
    pub retries: u32,
}

#[async_trait]
impl Command for SetJobRetries {
    type Output = ();

    async fn execute(&self, engine: &ProcessEngine) -> Result<()> {
        engine.reset_job_retries(self.job_id, self.retries).await
    }
}

// ─── Job handlers ─────────────────────────────────────────────

/// What a handler decided about its job.
#[derive(Debug)]
pub enum JobOutcome {
    /// The job is done and will be deleted.
    Completed,
    /// The job stays, unlocked, due again at the given time.
    Reschedule { due: DateTime<Utc> },
}

/// Strategy executed when a job of the matching type runs. Handlers are
/// registered by type string; an unknown type is a configuration fault
/// surfaced when the job executes, not at creation time.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &'static str;

    async fn execute(&self, engine: &ProcessEngine, job: &JobEntity) -> Result<JobOutcome>;
}

/// Fires the timer wait state of the referenced execution. The instance
/// having ended in the meantime is a benign no-op.
pub struct TimerJobHandler;

#[async_trait]
impl JobHandler for TimerJobHandler {
    fn handler_type(&self) -> &'static str {
        TIMER_HANDLER
    }

    async fn execute(&self, engine: &ProcessEngine, job: &JobEntity) -> Result<JobOutcome> {
        let config: TimerConfig = job.parse_configuration()?;
        let instance_id = job.instance_id.ok_or_else(|| {
            EngineError::ProcessEngine(format!("timer job {} has no instance", job.id))
        })?;
        engine
            .resume_execution(instance_id, config.execution_id, Resume::Timer)
            .await?;
        Ok(JobOutcome::Completed)
    }
}

/// Re-enters the activity an execution was parked at by an async boundary.
pub struct AsyncContinuationJobHandler;

#[async_trait]
impl JobHandler for AsyncContinuationJobHandler {
    fn handler_type(&self) -> &'static str {
        ASYNC_CONTINUATION_HANDLER
    }

    async fn execute(&self, engine: &ProcessEngine, job: &JobEntity) -> Result<JobOutcome> {
        let config: AsyncContinuationConfig = job.parse_configuration()?;
        let instance_id = job.instance_id.ok_or_else(|| {
            EngineError::ProcessEngine(format!("continuation job {} has no instance", job.id))
        })?;
        engine
            .resume_execution(instance_id, config.execution_id, Resume::AsyncContinuation)
            .await?;
        Ok(JobOutcome::Completed)
    }
}

enum Resume {
    Timer,
    AsyncContinuation,
}

// ─── Engine ───────────────────────────────────────────────────

/// The process engine. Commands are the only write path; each one loads
/// state, runs the virtual machine, flushes with a revision check, and is
/// retried whole when a concurrent writer got there first.
pub struct ProcessEngine {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
    evaluator: Arc<dyn ConditionEvaluator>,
    config: EngineConfig,
    definitions: RwLock<BTreeMap<String, Arc<ProcessDefinition>>>,
    handlers: RwLock<BTreeMap<String, Arc<dyn JobHandler>>>,
    /// Poked when a command inserts jobs, so an idle executor polls at once
    /// instead of sleeping out its backoff.
    job_hint: Notify,
}

impl ProcessEngine {
    pub fn new(store: Arc<dyn EngineStore>) -> Arc<Self> {
        Self::with_parts(
            store,
            EngineConfig::default(),
            Arc::new(SystemClock),
            Arc::new(VariableConditionEvaluator),
        )
    }

    pub fn with_parts(
        store: Arc<dyn EngineStore>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            store,
            clock,
            evaluator,
            config,
            definitions: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(BTreeMap::new()),
            job_hint: Notify::new(),
        });
        engine.register_handler(Arc::new(TimerJobHandler));
        engine.register_handler(Arc::new(AsyncContinuationJobHandler));
        engine.register_handler(Arc::new(crate::batch::BatchSeedJobHandler));
        engine.register_handler(Arc::new(crate::batch::BatchMonitorJobHandler));
        engine.register_handler(Arc::new(crate::batch::BatchExecutionJobHandler));
        engine
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Wait handle the job executor parks on between polls.
    pub fn job_notifier(&self) -> &Notify {
        &self.job_hint
    }

    pub(crate) fn notify_jobs_added(&self) {
        self.job_hint.notify_waiters();
    }

    pub fn register_handler(&self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .expect("handler registry poisoned")
            .insert(handler.handler_type().to_string(), handler);
    }

    pub fn deploy(&self, definition: Arc<ProcessDefinition>) {
        info!(key = %definition.key, "deploying process definition");
        self.definitions
            .write()
            .expect("definition registry poisoned")
            .insert(definition.key.clone(), definition);
    }

    fn definition(&self, key: &str) -> Result<Arc<ProcessDefinition>> {
        self.definitions
            .read()
            .expect("definition registry poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::NotFound {
                entity: "process definition",
                id: key.to_string(),
            })
    }

    fn handler(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .expect("handler registry poisoned")
            .get(handler_type)
            .cloned()
    }

    fn runtime(&self, key: &str) -> Result<PvmRuntime> {
        Ok(PvmRuntime::new(
            self.definition(key)?,
            self.clock.clone(),
            self.evaluator.clone(),
        ))
    }

    /// Runs a command, retrying it whole on optimistic lock conflicts;
    /// every retry re-executes against fresh state. Other errors surface
    /// immediately.
    pub async fn execute_command<C: Command>(&self, command: &C) -> Result<C::Output> {
        let mut attempts = 0u32;
        loop {
            match command.execute(self).await {
                Err(e)
                    if e.is_optimistic_locking()
                        && attempts < self.config.optimistic_lock_retries =>
                {
                    attempts += 1;
                    debug!(attempts, "optimistic lock conflict, retrying command");
                }
                other => break other,
            }
        }
    }

    // ── Convenience wrappers ──

    pub async fn start_instance(
        &self,
        definition_key: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<InstanceId> {
        self.execute_command(&StartProcessInstance {
            definition_key: definition_key.to_string(),
            variables,
        })
        .await
    }

    pub async fn signal(
        &self,
        instance_id: InstanceId,
        execution_id: ExecutionId,
        signal_name: &str,
        payload: BTreeMap<String, VariableValue>,
    ) -> Result<()> {
        self.execute_command(&SignalExecution {
            instance_id,
            execution_id,
            signal_name: signal_name.to_string(),
            payload,
        })
        .await
    }

    /// Delivers a message to the first instance with a matching
    /// subscription. Returns the target, or `None` if nothing was listening.
    pub async fn correlate_message(
        &self,
        message_name: &str,
        payload: BTreeMap<String, VariableValue>,
    ) -> Result<Option<(InstanceId, ExecutionId)>> {
        self.execute_command(&CorrelateMessage {
            message_name: message_name.to_string(),
            payload,
        })
        .await
    }

    pub async fn cancel_instance(&self, instance_id: InstanceId, reason: &str) -> Result<()> {
        self.execute_command(&CancelProcessInstance {
            instance_id,
            reason: reason.to_string(),
        })
        .await
    }

    pub(crate) async fn cancel_instance_if_exists(
        &self,
        instance_id: InstanceId,
        reason: &str,
    ) -> Result<bool> {
        self.execute_command(&CancelProcessInstanceIfExists {
            instance_id,
            reason: reason.to_string(),
        })
        .await
    }

    pub async fn suspend_instance(&self, instance_id: InstanceId) -> Result<()> {
        self.execute_command(&SetSuspensionState {
            instance_id,
            suspended: true,
        })
        .await
    }

    pub async fn resume_instance(&self, instance_id: InstanceId) -> Result<()> {
        self.execute_command(&SetSuspensionState {
            instance_id,
            suspended: false,
        })
        .await
    }

    /// Runs one job through its handler. A job deleted by a concurrent
    /// executor is a benign no-op.
    pub async fn execute_job(&self, job_id: JobId) -> Result<()> {
        self.execute_command(&ExecuteJob { job_id }).await
    }

    /// Failure bookkeeping, run as its own command so it survives whatever
    /// the handler broke: decrement retries, back off the due date, raise
    /// an incident when the budget is exhausted.
    pub async fn fail_job(&self, job_id: JobId, message: &str) -> Result<()> {
        self.execute_command(&FailJob {
            job_id,
            message: message.to_string(),
        })
        .await
    }

    /// Resets the retry budget. A positive value revives a stalled job and
    /// resolves its open incidents.
    pub async fn set_job_retries(&self, job_id: JobId, retries: u32) -> Result<()> {
        self.execute_command(&SetJobRetries { job_id, retries }).await
    }

    pub async fn instance(&self, instance_id: InstanceId) -> Result<Option<ExecutionTree>> {
        self.store.load_instance(instance_id).await
    }

    // ── Command bodies ──

    async fn cancel(&self, instance_id: InstanceId, reason: &str, strict: bool) -> Result<bool> {
        let tree = self.store.load_instance(instance_id).await?;
        let mut tree = match tree {
            Some(tree) => tree,
            None if strict => {
                return Err(EngineError::NotFound {
                    entity: "process instance",
                    id: instance_id.to_string(),
                })
            }
            None => {
                debug!(instance = %instance_id, "cancellation target gone, skipping");
                return Ok(false);
            }
        };
        if tree.state.is_terminal() && !strict {
            debug!(instance = %instance_id, "cancellation target already ended, skipping");
            return Ok(false);
        }
        let loaded_revision = tree.revision;
        let runtime = self.runtime(&tree.definition_key)?;
        let effects = runtime.cancel_instance(&mut tree, reason)?;
        self.apply_instance_effects(tree, loaded_revision, effects)
            .await?;
        Ok(true)
    }

    /// Suspension freezes the instance and its jobs together, so nothing
    /// moves it while suspended, not even a due timer.
    async fn set_suspended(&self, instance_id: InstanceId, suspended: bool) -> Result<()> {
        let mut tree = self.load_instance_required(instance_id).await?;
        match (&tree.state, suspended) {
            (ProcessState::Running, true) => tree.state = ProcessState::Suspended,
            (ProcessState::Suspended, false) => tree.state = ProcessState::Running,
            (state, _) => {
                return Err(EngineError::BadUserRequest(format!(
                    "cannot change suspension of instance {instance_id} in state {state:?}"
                )))
            }
        }
        let loaded_revision = tree.revision;
        tree.revision = loaded_revision + 1;
        self.store.update_instance(&tree, loaded_revision).await?;
        for job in self.store.jobs_for_instance(instance_id).await? {
            let mut updated = job.clone();
            updated.suspended = suspended;
            updated.revision += 1;
            self.store.update_job(&updated, job.revision).await?;
        }
        if !suspended {
            self.notify_jobs_added();
        }
        Ok(())
    }

    async fn run_job(&self, job_id: JobId) -> Result<()> {
        let Some(job) = self.store.load_job(job_id).await? else {
            debug!(job = %job_id, "job gone before execution, skipping");
            return Ok(());
        };
        if job.suspended {
            return Err(EngineError::SuspendedEntity {
                entity: "job",
                id: job_id.to_string(),
            });
        }
        let handler = self.handler(&job.handler_type).ok_or_else(|| {
            EngineError::ProcessEngine(format!(
                "no job handler registered for type '{}'",
                job.handler_type
            ))
        })?;
        debug!(job = %job_id, handler = %job.handler_type, "executing job");
        match handler.execute(self, &job).await? {
            JobOutcome::Completed => {
                self.store.delete_job(job.id).await?;
                self.store
                    .append_events(&[RuntimeEvent::JobCompleted { job_id: job.id }])
                    .await?;
            }
            JobOutcome::Reschedule { due } => {
                let mut updated = job.clone();
                updated.due = due;
                updated.clear_lock();
                updated.revision += 1;
                self.store.update_job(&updated, job.revision).await?;
            }
        }
        Ok(())
    }

    async fn record_job_failure(&self, job_id: JobId, message: &str) -> Result<()> {
        let Some(job) = self.store.load_job(job_id).await? else {
            debug!(job = %job_id, "failed job gone, skipping");
            return Ok(());
        };
        let now = self.clock.now();
        let mut updated = job.clone();
        updated.failure_count += 1;
        updated.retries = updated.retries.saturating_sub(1);
        updated.failure_message = Some(message.to_string());
        updated.clear_lock();
        if updated.retries == 0 {
            if !updated.skip_incident {
                let incident = Incident::for_job(
                    job.id,
                    job.instance_id,
                    job.execution_id,
                    message.to_string(),
                    now,
                );
                self.store.insert_incident(&incident).await?;
                self.store
                    .append_events(&[RuntimeEvent::IncidentCreated {
                        incident_id: incident.id,
                        job_id: Some(job.id),
                    }])
                    .await?;
            }
        } else {
            updated.due = now + self.config.backoff.delay(updated.failure_count);
        }
        updated.revision += 1;
        self.store.update_job(&updated, job.revision).await?;
        self.store
            .append_events(&[RuntimeEvent::JobFailed {
                job_id: job.id,
                message: message.to_string(),
                retries_remaining: updated.retries,
            }])
            .await?;
        Ok(())
    }

    async fn reset_job_retries(&self, job_id: JobId, retries: u32) -> Result<()> {
        let job = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })?;
        let mut updated = job.clone();
        updated.retries = retries;
        updated.revision += 1;
        self.store.update_job(&updated, job.revision).await?;
        if retries > 0 {
            self.store
                .resolve_incidents_for_job(job_id, self.clock.now(), "retries reset")
                .await?;
            self.notify_jobs_added();
        }
        Ok(())
    }

    // ── Resume paths used by the built-in handlers ──

    async fn resume_execution(
        &self,
        instance_id: InstanceId,
        execution_id: ExecutionId,
        resume: Resume,
    ) -> Result<()> {
        let Some(mut tree) = self.store.load_instance(instance_id).await? else {
            debug!(instance = %instance_id, "resume target gone, skipping");
            return Ok(());
        };
        if !tree.contains(execution_id) {
            debug!(execution = %execution_id, "resume execution gone, skipping");
            return Ok(());
        }
        let loaded_revision = tree.revision;
        let runtime = self.runtime(&tree.definition_key)?;
        let effects = match resume {
            Resume::Timer => runtime.fire_timer(&mut tree, execution_id)?,
            Resume::AsyncContinuation => runtime.continue_async(&mut tree, execution_id)?,
        };
        self.apply_instance_effects(tree, loaded_revision, effects)
            .await
    }

    // ── Flush ──

    async fn load_instance_required(&self, instance_id: InstanceId) -> Result<ExecutionTree> {
        self.store
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "process instance",
                id: instance_id.to_string(),
            })
    }

    /// Commits one command's worth of state: the revision-checked tree
    /// update first, then dependent job and event writes.
    async fn apply_instance_effects(
        &self,
        mut tree: ExecutionTree,
        loaded_revision: u32,
        effects: RuntimeEffects,
    ) -> Result<()> {
        tree.revision = loaded_revision + 1;
        self.store.update_instance(&tree, loaded_revision).await?;

        if effects.instance_ended {
            self.store.delete_jobs_for_instance(tree.instance_id).await?;
        } else if !effects.removed_executions.is_empty() {
            // Jobs owned by removed executions die with them.
            let removed: HashSet<ExecutionId> =
                effects.removed_executions.iter().copied().collect();
            for job in self.store.jobs_for_instance(tree.instance_id).await? {
                if job.execution_id.map(|e| removed.contains(&e)).unwrap_or(false) {
                    self.store.delete_job(job.id).await?;
                }
            }
        }
        self.flush_jobs_and_events(&effects).await
    }

    async fn flush_jobs_and_events(&self, effects: &RuntimeEffects) -> Result<()> {
        for job in &effects.jobs {
            self.store.insert_job(job).await?;
        }
        self.store.append_events(&effects.events).await?;
        if !effects.jobs.is_empty() {
            self.notify_jobs_added();
        }
        Ok(())
    }

    pub(crate) fn monitor_poll_interval(&self) -> Duration {
        Duration::milliseconds(self.config.monitor_poll_interval_ms as i64)
    }
}
