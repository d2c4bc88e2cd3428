use crate::behavior::{BehaviorContext, ConditionEvaluator, Outcome, TIMER_SIGNAL};
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::events::RuntimeEvent;
use crate::execution::ExecutionTree;
use crate::job::JobEntity;
use crate::model::{Activity, ProcessDefinition};
use crate::types::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Upper bound on interpreter steps per command; a model that loops without
/// a wait state is a modeling error, not a reason to spin forever.
const MAX_OPERATIONS: usize = 10_000;

/// Interpreter operations. The explicit stack replaces any ambient
/// "current operation" state: it is owned by the running command and
/// processed depth-first.
#[derive(Debug)]
enum Operation {
    Execute(ExecutionId),
    Take {
        execution: ExecutionId,
        transition: String,
    },
    Leave(ExecutionId),
    End(ExecutionId),
}

/// Side effects of one runtime invocation, applied by the enclosing command
/// in the same transaction as the tree mutation.
#[derive(Debug, Default)]
pub struct RuntimeEffects {
    pub events: Vec<RuntimeEvent>,
    pub jobs: Vec<JobEntity>,
    /// Executions removed during this invocation; jobs referencing them
    /// must be deleted by the command.
    pub removed_executions: Vec<ExecutionId>,
    pub instance_ended: bool,
}

/// The process virtual machine. Stateless over `Arc` collaborators; all
/// instance state lives in the `ExecutionTree` passed into each operation.
/// Single-threaded per command: concurrency in the tree means multiple
/// logical tokens, never multiple OS threads.
pub struct PvmRuntime {
    definition: Arc<ProcessDefinition>,
    clock: Arc<dyn Clock>,
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl PvmRuntime {
    pub fn new(
        definition: Arc<ProcessDefinition>,
        clock: Arc<dyn Clock>,
        evaluator: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        Self {
            definition,
            clock,
            evaluator,
        }
    }

    // ── Entry points ──

    /// Creates the root execution at the initial activity and drives the
    /// instance until every token is parked or the instance ends.
    pub fn start_instance(
        &self,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<(ExecutionTree, RuntimeEffects)> {
        let mut tree = ExecutionTree::new(
            &self.definition.key,
            self.definition.initial_activity_id(),
            self.clock.now(),
        );
        let root = tree.root_id();
        tree.get_mut(root)?.variables = variables;

        let mut effects = RuntimeEffects::default();
        effects.events.push(RuntimeEvent::InstanceStarted {
            instance_id: tree.instance_id,
            definition_key: self.definition.key.clone(),
        });
        effects.events.push(RuntimeEvent::ExecutionSpawned {
            execution_id: root,
            parent: None,
            activity_id: Some(self.definition.initial_activity_id().to_string()),
        });
        self.run(&mut tree, &mut effects, vec![Operation::Execute(root)])?;
        Ok((tree, effects))
    }

    /// Delivers a signal to a waiting execution. Fails if the execution is
    /// not parked on a matching wait state.
    pub fn signal(
        &self,
        tree: &mut ExecutionTree,
        execution_id: ExecutionId,
        signal_name: &str,
        payload: &BTreeMap<String, VariableValue>,
    ) -> Result<RuntimeEffects> {
        self.ensure_instance_active(tree)?;
        let exec = tree.get(execution_id)?;
        let matches = match &exec.waiting {
            Some(WaitState::Signal { name }) | Some(WaitState::Message { name }) => {
                name == signal_name
            }
            Some(WaitState::Timer { .. }) => signal_name == TIMER_SIGNAL,
            _ => false,
        };
        if !matches {
            return Err(EngineError::ProcessEngine(format!(
                "execution {execution_id} is not in a state expecting signal '{signal_name}'"
            )));
        }
        let activity_id = exec.activity.clone().ok_or_else(|| {
            EngineError::ProcessEngine(format!("execution {execution_id} has no current activity"))
        })?;
        let activity = self.definition.activity(&activity_id)?;

        {
            let exec = tree.get_mut(execution_id)?;
            exec.waiting = None;
            exec.subscriptions.retain(|s| s.event_name != signal_name);
        }
        for (name, value) in payload {
            tree.set_variable(execution_id, name, value.clone())?;
        }

        let mut effects = RuntimeEffects::default();
        effects.events.push(RuntimeEvent::SignalDelivered {
            execution_id,
            signal_name: signal_name.to_string(),
        });
        let outcome = {
            let mut ctx = self.context(tree, execution_id);
            activity.behavior().signal(&mut ctx, signal_name, payload)?
        };
        let mut stack = Vec::new();
        self.apply_outcome(tree, &mut effects, &mut stack, execution_id, outcome)?;
        self.run(tree, &mut effects, stack)?;
        Ok(effects)
    }

    /// Resume path for timer jobs.
    pub fn fire_timer(
        &self,
        tree: &mut ExecutionTree,
        execution_id: ExecutionId,
    ) -> Result<RuntimeEffects> {
        self.signal(tree, execution_id, TIMER_SIGNAL, &BTreeMap::new())
    }

    /// Resume path for async-continuation jobs: re-enters the activity the
    /// execution was parked at, skipping the async boundary.
    pub fn continue_async(
        &self,
        tree: &mut ExecutionTree,
        execution_id: ExecutionId,
    ) -> Result<RuntimeEffects> {
        self.ensure_instance_active(tree)?;
        {
            let exec = tree.get_mut(execution_id)?;
            match exec.waiting {
                Some(WaitState::AsyncContinuation { .. }) => exec.waiting = None,
                _ => {
                    return Err(EngineError::ProcessEngine(format!(
                        "execution {execution_id} is not parked for an async continuation"
                    )))
                }
            }
        }
        let mut effects = RuntimeEffects::default();
        self.run(tree, &mut effects, vec![Operation::Execute(execution_id)])?;
        Ok(effects)
    }

    /// Finds the first execution subscribed to this message and delivers it.
    /// `None` when nothing in this instance is listening.
    pub fn correlate_message(
        &self,
        tree: &mut ExecutionTree,
        message_name: &str,
        payload: &BTreeMap<String, VariableValue>,
    ) -> Result<Option<(ExecutionId, RuntimeEffects)>> {
        if tree.state != ProcessState::Running {
            return Ok(None);
        }
        let target = tree.executions().find(|e| {
            e.subscriptions
                .iter()
                .any(|s| s.event_type == EventType::Message && s.event_name == message_name)
        });
        let Some(execution_id) = target.map(|e| e.id) else {
            return Ok(None);
        };
        let mut effects = self.signal(tree, execution_id, message_name, payload)?;
        effects.events.insert(
            0,
            RuntimeEvent::MessageCorrelated {
                execution_id,
                message_name: message_name.to_string(),
            },
        );
        Ok(Some((execution_id, effects)))
    }

    /// Ancestor-initiated cancellation: ends every execution bottom-up in a
    /// single invocation so partial cancellation is never observable.
    pub fn cancel_instance(
        &self,
        tree: &mut ExecutionTree,
        reason: &str,
    ) -> Result<RuntimeEffects> {
        if tree.state.is_terminal() {
            return Err(EngineError::ProcessEngine(format!(
                "process instance {} already ended",
                tree.instance_id
            )));
        }
        let mut effects = RuntimeEffects::default();
        for id in tree.collect_subtree(tree.root_id()) {
            effects
                .events
                .push(RuntimeEvent::ExecutionEnded { execution_id: id });
            effects.removed_executions.push(id);
            tree.remove(id);
        }
        tree.state = ProcessState::Cancelled {
            reason: reason.to_string(),
            at: self.clock.now(),
        };
        effects.events.push(RuntimeEvent::InstanceCancelled {
            reason: reason.to_string(),
        });
        effects.instance_ended = true;
        Ok(effects)
    }

    // ── Interpreter ──

    fn context<'a>(
        &'a self,
        tree: &'a mut ExecutionTree,
        execution_id: ExecutionId,
    ) -> BehaviorContext<'a> {
        BehaviorContext {
            definition: self.definition.as_ref(),
            tree,
            execution_id,
            evaluator: self.evaluator.as_ref(),
            clock: self.clock.as_ref(),
        }
    }

    fn ensure_instance_active(&self, tree: &ExecutionTree) -> Result<()> {
        match &tree.state {
            ProcessState::Running => Ok(()),
            ProcessState::Suspended => Err(EngineError::SuspendedEntity {
                entity: "process instance",
                id: tree.instance_id.to_string(),
            }),
            _ => Err(EngineError::ProcessEngine(format!(
                "process instance {} already ended",
                tree.instance_id
            ))),
        }
    }

    fn run(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
        initial: Vec<Operation>,
    ) -> Result<()> {
        let mut stack = initial;
        let mut steps = 0usize;
        while let Some(op) = stack.pop() {
            steps += 1;
            if steps > MAX_OPERATIONS {
                return Err(EngineError::ProcessEngine(format!(
                    "instance {} exceeded {MAX_OPERATIONS} interpreter operations",
                    tree.instance_id
                )));
            }
            match op {
                Operation::Execute(id) => self.execute_activity(tree, effects, &mut stack, id)?,
                Operation::Take {
                    execution,
                    transition,
                } => self.take_transition(tree, effects, &mut stack, execution, &transition)?,
                Operation::Leave(id) => self.leave_activity(tree, effects, &mut stack, id)?,
                Operation::End(id) => self.end_execution(tree, effects, &mut stack, id)?,
            }
        }
        Ok(())
    }

    fn execute_activity(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
        stack: &mut Vec<Operation>,
        id: ExecutionId,
    ) -> Result<()> {
        let exec = tree.get(id)?;
        let activity_id = exec.activity.clone().ok_or_else(|| {
            EngineError::ProcessEngine(format!("execution {id} has no current activity"))
        })?;
        let activity = self.definition.activity(&activity_id)?;
        debug!(execution = %id, activity = %activity_id, "execute");
        let outcome = {
            let mut ctx = self.context(tree, id);
            activity.behavior().execute(&mut ctx)?
        };
        self.apply_outcome(tree, effects, stack, id, outcome)
    }

    fn apply_outcome(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
        stack: &mut Vec<Operation>,
        id: ExecutionId,
        outcome: Outcome,
    ) -> Result<()> {
        match outcome {
            Outcome::Take(transitions) => match transitions.len() {
                0 => stack.push(Operation::End(id)),
                1 => stack.push(Operation::Take {
                    execution: id,
                    transition: transitions.into_iter().next().unwrap(),
                }),
                _ => self.create_concurrent_executions(tree, effects, stack, id, transitions)?,
            },
            Outcome::Wait(wait) => self.park(tree, effects, id, wait)?,
            Outcome::EnterScope { start_activity } => {
                tree.get_mut(id)?.active = false;
                let child = tree.create_child(id, false, true)?;
                tree.get_mut(child)?.activity = Some(start_activity.clone());
                effects.events.push(RuntimeEvent::ExecutionSpawned {
                    execution_id: child,
                    parent: Some(id),
                    activity_id: Some(start_activity),
                });
                stack.push(Operation::Execute(child));
            }
            Outcome::Completed => stack.push(Operation::End(id)),
            Outcome::Terminate => {
                self.terminate_instance(tree, effects)?;
                stack.clear();
            }
        }
        Ok(())
    }

    /// Forks `parent` into one concurrent child per transition. The parent
    /// stays alive holding the children; children are executed in creation
    /// order.
    fn create_concurrent_executions(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
        stack: &mut Vec<Operation>,
        parent: ExecutionId,
        transitions: Vec<String>,
    ) -> Result<()> {
        tree.get_mut(parent)?.active = false;
        let mut spawned = Vec::with_capacity(transitions.len());
        for transition in transitions {
            let child = tree.create_child(parent, true, false)?;
            effects.events.push(RuntimeEvent::ExecutionSpawned {
                execution_id: child,
                parent: Some(parent),
                activity_id: None,
            });
            spawned.push((child, transition));
        }
        // Depth-first stack: push in reverse so the first child runs first.
        for (child, transition) in spawned.into_iter().rev() {
            stack.push(Operation::Take {
                execution: child,
                transition,
            });
        }
        Ok(())
    }

    fn park(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
        id: ExecutionId,
        wait: WaitState,
    ) -> Result<()> {
        let activity_id = tree
            .get(id)?
            .activity
            .clone()
            .unwrap_or_default();
        match &wait {
            WaitState::Timer { due } => {
                let job = JobEntity::timer(tree.instance_id, id, *due)?;
                effects.events.push(RuntimeEvent::JobCreated {
                    job_id: job.id,
                    handler_type: job.handler_type.clone(),
                    due: job.due,
                });
                effects.jobs.push(job);
            }
            WaitState::Message { name } => {
                tree.get_mut(id)?.subscriptions.push(EventSubscription {
                    event_type: EventType::Message,
                    event_name: name.clone(),
                    activity_id: activity_id.clone(),
                    created_at: self.clock.now(),
                });
            }
            WaitState::Signal { name } => {
                tree.get_mut(id)?.subscriptions.push(EventSubscription {
                    event_type: EventType::Signal,
                    event_name: name.clone(),
                    activity_id: activity_id.clone(),
                    created_at: self.clock.now(),
                });
            }
            _ => {}
        }
        tree.get_mut(id)?.waiting = Some(wait);
        Ok(())
    }

    fn take_transition(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
        stack: &mut Vec<Operation>,
        execution: ExecutionId,
        transition_id: &str,
    ) -> Result<()> {
        let transition = self.definition.transition(transition_id)?;
        effects.events.push(RuntimeEvent::TransitionTaken {
            execution_id: execution,
            transition_id: transition_id.to_string(),
            from: transition.source.clone(),
            to: transition.target.clone(),
        });
        let target = self.definition.activity(&transition.target)?;
        if target.kind.is_joining() && target.incoming.len() > 1 {
            self.join_arrive(tree, effects, stack, execution, target, transition_id)
        } else {
            self.enter_activity(tree, effects, stack, execution, target)
        }
    }

    /// Moves the cursor onto `activity` and either executes it or parks the
    /// token behind an async-continuation job.
    fn enter_activity(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
        stack: &mut Vec<Operation>,
        execution: ExecutionId,
        activity: &Activity,
    ) -> Result<()> {
        {
            let exec = tree.get_mut(execution)?;
            exec.activity = Some(activity.id.clone());
            exec.active = true;
            exec.waiting = None;
        }
        if activity.async_before {
            let job = JobEntity::async_continuation(
                tree.instance_id,
                execution,
                &activity.id,
                self.clock.now(),
            )?;
            tree.get_mut(execution)?.waiting = Some(WaitState::AsyncContinuation { job_id: job.id });
            effects.events.push(RuntimeEvent::JobCreated {
                job_id: job.id,
                handler_type: job.handler_type.clone(),
                due: job.due,
            });
            effects.jobs.push(job);
        } else {
            stack.push(Operation::Execute(execution));
        }
        Ok(())
    }

    fn leave_activity(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
        stack: &mut Vec<Operation>,
        id: ExecutionId,
    ) -> Result<()> {
        let activity_id = tree
            .get(id)?
            .activity
            .clone()
            .ok_or_else(|| {
                EngineError::ProcessEngine(format!("execution {id} has no current activity"))
            })?;
        let activity = self.definition.activity(&activity_id)?;
        if activity.outgoing.is_empty() {
            stack.push(Operation::End(id));
            return Ok(());
        }
        let outgoing = activity.outgoing.clone();
        self.apply_outcome(tree, effects, stack, id, Outcome::Take(outgoing))
    }

    /// Join bookkeeping on the scope parent. Only the last arriving token
    /// proceeds; earlier arrivals are pruned without side effects.
    fn join_arrive(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
        stack: &mut Vec<Operation>,
        execution: ExecutionId,
        target: &Activity,
        transition_id: &str,
    ) -> Result<()> {
        let arriving = tree.get(execution)?;
        let arriving_concurrent = arriving.concurrent;
        let scope_id = match (arriving_concurrent, arriving.parent) {
            (true, Some(parent)) => parent,
            _ => tree.scope_ancestor(execution)?,
        };

        tree.get_mut(scope_id)?
            .joins
            .entry(target.id.clone())
            .or_default()
            .push(transition_id.to_string());
        effects.events.push(RuntimeEvent::JoinArrived {
            execution_id: execution,
            activity_id: target.id.clone(),
            transition_id: transition_id.to_string(),
        });

        let arrived: HashSet<String> = tree
            .get(scope_id)?
            .joins
            .get(&target.id)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default();
        let all_arrived = target.incoming.iter().all(|t| arrived.contains(t));

        let complete = if all_arrived {
            true
        } else if matches!(target.kind, crate::model::ActivityKind::InclusiveGateway) {
            // Best-effort: wait only while some other active token could
            // still reach this join through the static graph.
            !tree.executions().any(|e| {
                e.id != execution
                    && e.active
                    && !matches!(&e.waiting, Some(WaitState::Join { activity_id }) if activity_id == &target.id)
                    && e.activity
                        .as_deref()
                        .map(|a| a != target.id && self.definition.can_reach(a, &target.id))
                        .unwrap_or(false)
            })
        } else {
            false
        };

        if !complete {
            if arriving_concurrent {
                effects.removed_executions.push(execution);
                tree.remove(execution);
            } else {
                let exec = tree.get_mut(execution)?;
                exec.activity = Some(target.id.clone());
                exec.active = false;
                exec.waiting = Some(WaitState::Join {
                    activity_id: target.id.clone(),
                });
            }
            return Ok(());
        }

        // Release: consume one arrival per incoming transition; inclusive
        // joins completing early drain the whole record.
        {
            let scope = tree.get_mut(scope_id)?;
            if let Some(record) = scope.joins.get_mut(&target.id) {
                if all_arrived {
                    for t in &target.incoming {
                        if let Some(pos) = record.iter().position(|x| x == t) {
                            record.remove(pos);
                        }
                    }
                } else {
                    record.clear();
                }
                if record.is_empty() {
                    scope.joins.remove(&target.id);
                }
            }
        }

        // Consume tokens parked at this join.
        let parked: Vec<ExecutionId> = tree
            .executions()
            .filter(|e| {
                e.id != execution
                    && matches!(&e.waiting, Some(WaitState::Join { activity_id }) if activity_id == &target.id)
            })
            .map(|e| e.id)
            .collect();
        for id in parked {
            effects.removed_executions.push(id);
            tree.remove(id);
        }

        // Merge: if the arriving token is the scope's only remaining child,
        // collapse it onto the scope execution.
        let surviving = if arriving_concurrent {
            let siblings = tree.children_of(scope_id);
            if siblings.len() == 1 && siblings[0] == execution {
                effects.removed_executions.push(execution);
                tree.remove(execution);
                tree.get_mut(scope_id)?.active = true;
                scope_id
            } else {
                execution
            }
        } else {
            execution
        };
        effects.events.push(RuntimeEvent::JoinReleased {
            execution_id: surviving,
            activity_id: target.id.clone(),
        });
        self.enter_activity(tree, effects, stack, surviving, target)
    }

    fn end_execution(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
        stack: &mut Vec<Operation>,
        id: ExecutionId,
    ) -> Result<()> {
        let exec = tree.get(id)?;
        let parent = exec.parent;
        let was_concurrent = exec.concurrent;
        debug!(execution = %id, "end");
        effects
            .events
            .push(RuntimeEvent::ExecutionEnded { execution_id: id });
        effects.removed_executions.push(id);
        tree.remove(id);

        match parent {
            None => {
                let at = self.clock.now();
                tree.state = ProcessState::Completed { at };
                effects.events.push(RuntimeEvent::InstanceEnded { at });
                effects.instance_ended = true;
            }
            Some(parent_id) => {
                if was_concurrent {
                    if tree.children_of(parent_id).is_empty() {
                        // Last concurrent child ended; completion propagates
                        // to the scope holding the fork.
                        tree.get_mut(parent_id)?.active = true;
                        stack.push(Operation::End(parent_id));
                    }
                } else {
                    // A scope body ended; its host leaves the composite
                    // activity it was paused at.
                    let host_composite = tree
                        .get(parent_id)?
                        .activity
                        .as_deref()
                        .map(|a| {
                            self.definition
                                .activity(a)
                                .map(|a| a.kind.is_composite())
                                .unwrap_or(false)
                        })
                        .unwrap_or(false);
                    tree.get_mut(parent_id)?.active = true;
                    if host_composite {
                        stack.push(Operation::Leave(parent_id));
                    } else {
                        stack.push(Operation::End(parent_id));
                    }
                }
            }
        }
        Ok(())
    }

    fn terminate_instance(
        &self,
        tree: &mut ExecutionTree,
        effects: &mut RuntimeEffects,
    ) -> Result<()> {
        for id in tree.collect_subtree(tree.root_id()) {
            effects.removed_executions.push(id);
            tree.remove(id);
        }
        let at = self.clock.now();
        tree.state = ProcessState::Terminated { at };
        effects
            .events
            .push(RuntimeEvent::InstanceTerminated { at });
        effects.instance_ended = true;
        Ok(())
    }
}
