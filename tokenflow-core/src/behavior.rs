use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::execution::ExecutionTree;
use crate::model::{Activity, ActivityKind, EventDefinition, ProcessDefinition};
use crate::types::*;
use chrono::Duration;
use std::collections::BTreeMap;

/// What a behavior decided for one step. Expected alternatives are values;
/// errors are reserved for genuine faults.
#[derive(Debug)]
pub enum Outcome {
    /// Leave the activity over these transitions. More than one id forks the
    /// execution into concurrent children.
    Take(Vec<String>),
    /// Park the execution until the matching resume path fires.
    Wait(WaitState),
    /// Enter a composite scope at its inner start activity.
    EnterScope { start_activity: String },
    /// This path of execution is done.
    Completed,
    /// Kill the whole instance.
    Terminate,
}

/// Everything a behavior may touch while executing one step.
pub struct BehaviorContext<'a> {
    pub definition: &'a ProcessDefinition,
    pub tree: &'a mut ExecutionTree,
    pub execution_id: ExecutionId,
    pub evaluator: &'a dyn ConditionEvaluator,
    pub clock: &'a dyn Clock,
}

impl<'a> BehaviorContext<'a> {
    pub fn activity(&self) -> Result<&'a Activity> {
        let exec = self.tree.get(self.execution_id)?;
        let id = exec.activity.as_deref().ok_or_else(|| {
            EngineError::ProcessEngine(format!(
                "execution {} has no current activity",
                self.execution_id
            ))
        })?;
        self.definition.activity(id)
    }

    fn evaluate_condition(&self, expression: &str) -> Result<bool> {
        let variables = self.tree.resolved_variables(self.execution_id)?;
        self.evaluator.evaluate(expression, &variables)
    }

    /// Transitions out of a gateway whose condition matches, default flow
    /// excluded. `None` conditions always match.
    fn matching_outgoing(&self, activity: &Activity) -> Result<Vec<String>> {
        let mut taken = Vec::new();
        for tid in &activity.outgoing {
            if activity.default_flow.as_deref() == Some(tid.as_str()) {
                continue;
            }
            let transition = self.definition.transition(tid)?;
            let matches = match &transition.condition {
                None => true,
                Some(expr) => self.evaluate_condition(expr)?,
            };
            if matches {
                taken.push(tid.clone());
            }
        }
        Ok(taken)
    }
}

/// Strategy invoked when an execution arrives at an activity. One
/// implementation per `ActivityKind`, resolved once at model build time.
pub trait ActivityBehavior: Send + Sync {
    fn execute(&self, ctx: &mut BehaviorContext<'_>) -> Result<Outcome>;

    /// Resumes a waiting execution. The runtime has already checked that the
    /// execution is parked on a matching wait state.
    fn signal(
        &self,
        ctx: &mut BehaviorContext<'_>,
        signal_name: &str,
        _payload: &BTreeMap<String, VariableValue>,
    ) -> Result<Outcome> {
        let activity = ctx.activity()?;
        Err(EngineError::ProcessEngine(format!(
            "activity '{}' does not accept signal '{signal_name}'",
            activity.id
        )))
    }
}

// ─── Implementations ──────────────────────────────────────────

pub struct StartEventBehavior;

impl ActivityBehavior for StartEventBehavior {
    fn execute(&self, ctx: &mut BehaviorContext<'_>) -> Result<Outcome> {
        let activity = ctx.activity()?;
        if activity.outgoing.is_empty() {
            return Ok(Outcome::Completed);
        }
        Ok(Outcome::Take(activity.outgoing.clone()))
    }
}

pub struct EndEventBehavior;

impl ActivityBehavior for EndEventBehavior {
    fn execute(&self, ctx: &mut BehaviorContext<'_>) -> Result<Outcome> {
        match &ctx.activity()?.kind {
            ActivityKind::EndEvent { terminate: true } => Ok(Outcome::Terminate),
            _ => Ok(Outcome::Completed),
        }
    }
}

/// Service tasks delegate their actual work to external collaborators; the
/// engine only routes the token (and honors `async_before` on entry).
pub struct ServiceTaskBehavior;

impl ActivityBehavior for ServiceTaskBehavior {
    fn execute(&self, ctx: &mut BehaviorContext<'_>) -> Result<Outcome> {
        let activity = ctx.activity()?;
        if activity.outgoing.is_empty() {
            return Ok(Outcome::Completed);
        }
        Ok(Outcome::Take(activity.outgoing.clone()))
    }
}

/// Waits for an external signal named after the activity.
pub struct ReceiveTaskBehavior;

impl ActivityBehavior for ReceiveTaskBehavior {
    fn execute(&self, ctx: &mut BehaviorContext<'_>) -> Result<Outcome> {
        let activity = ctx.activity()?;
        Ok(Outcome::Wait(WaitState::Signal {
            name: activity.id.clone(),
        }))
    }

    fn signal(
        &self,
        ctx: &mut BehaviorContext<'_>,
        signal_name: &str,
        _payload: &BTreeMap<String, VariableValue>,
    ) -> Result<Outcome> {
        let activity = ctx.activity()?;
        if signal_name != activity.id {
            return Err(EngineError::ProcessEngine(format!(
                "receive task '{}' cannot handle signal '{signal_name}'",
                activity.id
            )));
        }
        Ok(Outcome::Take(activity.outgoing.clone()))
    }
}

pub struct ExclusiveGatewayBehavior;

impl ActivityBehavior for ExclusiveGatewayBehavior {
    fn execute(&self, ctx: &mut BehaviorContext<'_>) -> Result<Outcome> {
        let activity = ctx.activity()?;
        let matching = ctx.matching_outgoing(activity)?;
        if let Some(first) = matching.into_iter().next() {
            return Ok(Outcome::Take(vec![first]));
        }
        if let Some(default) = &activity.default_flow {
            return Ok(Outcome::Take(vec![default.clone()]));
        }
        Err(EngineError::ProcessEngine(format!(
            "no outgoing transition of gateway '{}' evaluated to true and no default flow is set",
            activity.id
        )))
    }
}

/// Fork side of the parallel gateway; the join side is handled by the
/// runtime before the gateway executes.
pub struct ParallelGatewayBehavior;

impl ActivityBehavior for ParallelGatewayBehavior {
    fn execute(&self, ctx: &mut BehaviorContext<'_>) -> Result<Outcome> {
        let activity = ctx.activity()?;
        if activity.outgoing.is_empty() {
            return Ok(Outcome::Completed);
        }
        Ok(Outcome::Take(activity.outgoing.clone()))
    }
}

pub struct InclusiveGatewayBehavior;

impl ActivityBehavior for InclusiveGatewayBehavior {
    fn execute(&self, ctx: &mut BehaviorContext<'_>) -> Result<Outcome> {
        let activity = ctx.activity()?;
        if activity.outgoing.is_empty() {
            return Ok(Outcome::Completed);
        }
        let taken = ctx.matching_outgoing(activity)?;
        if !taken.is_empty() {
            return Ok(Outcome::Take(taken));
        }
        if let Some(default) = &activity.default_flow {
            return Ok(Outcome::Take(vec![default.clone()]));
        }
        Err(EngineError::ProcessEngine(format!(
            "inclusive gateway '{}': no condition matched and no default flow is set",
            activity.id
        )))
    }
}

pub struct SubProcessBehavior;

impl ActivityBehavior for SubProcessBehavior {
    fn execute(&self, ctx: &mut BehaviorContext<'_>) -> Result<Outcome> {
        let activity = ctx.activity()?;
        let start = activity
            .children
            .iter()
            .find(|c| {
                ctx.definition
                    .activity(c)
                    .map(|a| matches!(a.kind, ActivityKind::StartEvent))
                    .unwrap_or(false)
            })
            .cloned()
            .ok_or_else(|| {
                EngineError::ProcessEngine(format!(
                    "sub-process '{}' has no inner start event",
                    activity.id
                ))
            })?;
        Ok(Outcome::EnterScope {
            start_activity: start,
        })
    }
}

/// Signal name delivered when a timer job fires.
pub const TIMER_SIGNAL: &str = "timer";

pub struct IntermediateCatchEventBehavior;

impl ActivityBehavior for IntermediateCatchEventBehavior {
    fn execute(&self, ctx: &mut BehaviorContext<'_>) -> Result<Outcome> {
        let activity = ctx.activity()?;
        let ActivityKind::IntermediateCatchEvent { event } = &activity.kind else {
            return Err(EngineError::ProcessEngine(format!(
                "activity '{}' is not a catch event",
                activity.id
            )));
        };
        let wait = match event {
            EventDefinition::Timer { duration_ms } => WaitState::Timer {
                due: ctx.clock.now() + Duration::milliseconds(*duration_ms as i64),
            },
            EventDefinition::Message { name } => WaitState::Message { name: name.clone() },
            EventDefinition::Signal { name } => WaitState::Signal { name: name.clone() },
        };
        Ok(Outcome::Wait(wait))
    }

    fn signal(
        &self,
        ctx: &mut BehaviorContext<'_>,
        signal_name: &str,
        _payload: &BTreeMap<String, VariableValue>,
    ) -> Result<Outcome> {
        let activity = ctx.activity()?;
        let ActivityKind::IntermediateCatchEvent { event } = &activity.kind else {
            return Err(EngineError::ProcessEngine(format!(
                "activity '{}' is not a catch event",
                activity.id
            )));
        };
        let expected = match event {
            EventDefinition::Timer { .. } => TIMER_SIGNAL,
            EventDefinition::Message { name } | EventDefinition::Signal { name } => name.as_str(),
        };
        if signal_name != expected {
            return Err(EngineError::ProcessEngine(format!(
                "catch event '{}' expects '{expected}', got '{signal_name}'",
                activity.id
            )));
        }
        Ok(Outcome::Take(activity.outgoing.clone()))
    }
}

/// Behavior lookup, resolved once when the definition is built.
pub fn behavior_for(kind: &ActivityKind) -> &'static dyn ActivityBehavior {
    match kind {
        ActivityKind::StartEvent => &StartEventBehavior,
        ActivityKind::EndEvent { .. } => &EndEventBehavior,
        ActivityKind::ServiceTask => &ServiceTaskBehavior,
        ActivityKind::ReceiveTask => &ReceiveTaskBehavior,
        ActivityKind::ExclusiveGateway => &ExclusiveGatewayBehavior,
        ActivityKind::ParallelGateway => &ParallelGatewayBehavior,
        ActivityKind::InclusiveGateway => &InclusiveGatewayBehavior,
        ActivityKind::SubProcess => &SubProcessBehavior,
        ActivityKind::IntermediateCatchEvent { .. } => &IntermediateCatchEventBehavior,
    }
}

// ─── Condition seam ───────────────────────────────────────────

/// Narrow seam to the external expression evaluator. The built-in
/// implementation understands variable names and their negation, which is
/// enough for routing decisions driven by process variables.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        expression: &str,
        variables: &BTreeMap<String, VariableValue>,
    ) -> Result<bool>;
}

pub struct VariableConditionEvaluator;

impl ConditionEvaluator for VariableConditionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        variables: &BTreeMap<String, VariableValue>,
    ) -> Result<bool> {
        let expr = expression.trim();
        if expr.is_empty() {
            return Err(EngineError::ProcessEngine(
                "empty condition expression".into(),
            ));
        }
        let (negated, name) = match expr.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, expr),
        };
        let value = variables.get(name).map(|v| v.is_truthy()).unwrap_or(false);
        Ok(value != negated)
    }
}
