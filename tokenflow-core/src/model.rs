use crate::behavior::{behavior_for, ActivityBehavior};
use crate::error::{EngineError, Result};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ─── Element kinds ────────────────────────────────────────────

/// Event payload of an intermediate catch event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventDefinition {
    Timer { duration_ms: u64 },
    Message { name: String },
    Signal { name: String },
}

/// Closed set of supported element kinds. Behavior dispatch is resolved once
/// at build time from this tag; runtime code never inspects concrete types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActivityKind {
    StartEvent,
    EndEvent { terminate: bool },
    ServiceTask,
    ReceiveTask,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    SubProcess,
    IntermediateCatchEvent { event: EventDefinition },
}

impl ActivityKind {
    /// Composite elements own nested activities and a child scope execution.
    pub fn is_composite(&self) -> bool {
        matches!(self, ActivityKind::SubProcess)
    }

    /// Event sources park the execution on a subscription or timer.
    pub fn is_event_source(&self) -> bool {
        matches!(
            self,
            ActivityKind::ReceiveTask | ActivityKind::IntermediateCatchEvent { .. }
        )
    }

    /// Gateways with more than one incoming transition merge tokens.
    pub fn is_joining(&self) -> bool {
        matches!(
            self,
            ActivityKind::ParallelGateway | ActivityKind::InclusiveGateway
        )
    }
}

// ─── Graph nodes ──────────────────────────────────────────────

/// An immutable model-time node. Shared read-only between all instances of
/// the definition; executions reference activities by id and never mutate
/// them.
pub struct Activity {
    pub id: String,
    pub kind: ActivityKind,
    pub incoming: Vec<String>,
    pub outgoing: Vec<String>,
    /// Taken by gateways when no condition matches.
    pub default_flow: Option<String>,
    /// Crossing into this activity parks the token and creates an
    /// async-continuation job instead of executing inline.
    pub async_before: bool,
    /// Containing composite activity, if nested.
    pub parent_scope: Option<String>,
    /// Nested activity ids for composite elements.
    pub children: Vec<String>,
    behavior: &'static dyn ActivityBehavior,
}

impl Activity {
    pub fn behavior(&self) -> &'static dyn ActivityBehavior {
        self.behavior
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("incoming", &self.incoming)
            .field("outgoing", &self.outgoing)
            .field("default_flow", &self.default_flow)
            .field("async_before", &self.async_before)
            .field("parent_scope", &self.parent_scope)
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Transition {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Expression evaluated by the condition seam; `None` always matches.
    pub condition: Option<String>,
}

// ─── Definition ───────────────────────────────────────────────

/// A compiled process definition: the control-flow graph plus a petgraph
/// index answering static reachability queries (used by the inclusive join).
#[derive(Debug)]
pub struct ProcessDefinition {
    pub key: String,
    activities: BTreeMap<String, Activity>,
    transitions: BTreeMap<String, Transition>,
    initial: String,
    graph: DiGraph<String, ()>,
    node_index: BTreeMap<String, NodeIndex>,
}

impl ProcessDefinition {
    pub fn builder(key: impl Into<String>) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::new(key)
    }

    pub fn initial_activity_id(&self) -> &str {
        &self.initial
    }

    pub fn activity(&self, id: &str) -> Result<&Activity> {
        self.activities.get(id).ok_or_else(|| EngineError::NotFound {
            entity: "activity",
            id: id.to_string(),
        })
    }

    pub fn transition(&self, id: &str) -> Result<&Transition> {
        self.transitions.get(id).ok_or_else(|| EngineError::NotFound {
            entity: "transition",
            id: id.to_string(),
        })
    }

    pub fn activities(&self) -> impl Iterator<Item = &Activity> {
        self.activities.values()
    }

    /// Static reachability: can a token currently at `from` ever arrive at
    /// `to` by following transitions.
    pub fn can_reach(&self, from: &str, to: &str) -> bool {
        match (self.node_index.get(from), self.node_index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }
}

// ─── Builder ──────────────────────────────────────────────────

struct ActivitySpec {
    id: String,
    kind: ActivityKind,
    async_before: bool,
    parent_scope: Option<String>,
}

struct TransitionSpec {
    id: String,
    source: String,
    target: String,
    condition: Option<String>,
    default_flow: bool,
}

/// Builds and validates a `ProcessDefinition`. Validation errors are
/// `BadUserRequest`: they reject the model before any instance exists.
pub struct ProcessDefinitionBuilder {
    key: String,
    activities: Vec<ActivitySpec>,
    transitions: Vec<TransitionSpec>,
    scope_stack: Vec<String>,
}

impl ProcessDefinitionBuilder {
    fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            activities: Vec::new(),
            transitions: Vec::new(),
            scope_stack: Vec::new(),
        }
    }

    fn add(mut self, id: &str, kind: ActivityKind, async_before: bool) -> Self {
        self.activities.push(ActivitySpec {
            id: id.to_string(),
            kind,
            async_before,
            parent_scope: self.scope_stack.last().cloned(),
        });
        self
    }

    pub fn start_event(self, id: &str) -> Self {
        self.add(id, ActivityKind::StartEvent, false)
    }

    pub fn end_event(self, id: &str) -> Self {
        self.add(id, ActivityKind::EndEvent { terminate: false }, false)
    }

    pub fn terminate_end_event(self, id: &str) -> Self {
        self.add(id, ActivityKind::EndEvent { terminate: true }, false)
    }

    pub fn service_task(self, id: &str) -> Self {
        self.add(id, ActivityKind::ServiceTask, false)
    }

    /// Service task with an async continuation before it.
    pub fn service_task_async(self, id: &str) -> Self {
        self.add(id, ActivityKind::ServiceTask, true)
    }

    pub fn receive_task(self, id: &str) -> Self {
        self.add(id, ActivityKind::ReceiveTask, false)
    }

    pub fn exclusive_gateway(self, id: &str) -> Self {
        self.add(id, ActivityKind::ExclusiveGateway, false)
    }

    pub fn parallel_gateway(self, id: &str) -> Self {
        self.add(id, ActivityKind::ParallelGateway, false)
    }

    pub fn inclusive_gateway(self, id: &str) -> Self {
        self.add(id, ActivityKind::InclusiveGateway, false)
    }

    pub fn timer_catch_event(self, id: &str, duration_ms: u64) -> Self {
        self.add(
            id,
            ActivityKind::IntermediateCatchEvent {
                event: EventDefinition::Timer { duration_ms },
            },
            false,
        )
    }

    pub fn message_catch_event(self, id: &str, message: &str) -> Self {
        self.add(
            id,
            ActivityKind::IntermediateCatchEvent {
                event: EventDefinition::Message {
                    name: message.to_string(),
                },
            },
            false,
        )
    }

    pub fn signal_catch_event(self, id: &str, signal: &str) -> Self {
        self.add(
            id,
            ActivityKind::IntermediateCatchEvent {
                event: EventDefinition::Signal {
                    name: signal.to_string(),
                },
            },
            false,
        )
    }

    /// Opens a sub-process scope; activities added until `end_sub_process`
    /// are nested inside it.
    pub fn sub_process(mut self, id: &str) -> Self {
        self = self.add(id, ActivityKind::SubProcess, false);
        self.scope_stack.push(id.to_string());
        self
    }

    pub fn end_sub_process(mut self) -> Self {
        self.scope_stack.pop();
        self
    }

    pub fn flow(self, source: &str, target: &str) -> Self {
        self.flow_spec(source, target, None, false)
    }

    pub fn conditional_flow(self, source: &str, target: &str, condition: &str) -> Self {
        self.flow_spec(source, target, Some(condition.to_string()), false)
    }

    pub fn default_flow(self, source: &str, target: &str) -> Self {
        self.flow_spec(source, target, None, true)
    }

    fn flow_spec(
        mut self,
        source: &str,
        target: &str,
        condition: Option<String>,
        default_flow: bool,
    ) -> Self {
        self.transitions.push(TransitionSpec {
            id: format!("{source}->{target}"),
            source: source.to_string(),
            target: target.to_string(),
            condition,
            default_flow,
        });
        self
    }

    pub fn build(self) -> Result<Arc<ProcessDefinition>> {
        let mut activities: BTreeMap<String, Activity> = BTreeMap::new();
        for spec in &self.activities {
            if activities.contains_key(&spec.id) {
                return Err(EngineError::BadUserRequest(format!(
                    "duplicate activity id '{}'",
                    spec.id
                )));
            }
            activities.insert(
                spec.id.clone(),
                Activity {
                    id: spec.id.clone(),
                    kind: spec.kind.clone(),
                    incoming: Vec::new(),
                    outgoing: Vec::new(),
                    default_flow: None,
                    async_before: spec.async_before,
                    parent_scope: spec.parent_scope.clone(),
                    children: Vec::new(),
                    behavior: behavior_for(&spec.kind),
                },
            );
        }

        let mut transitions: BTreeMap<String, Transition> = BTreeMap::new();
        for spec in &self.transitions {
            for endpoint in [&spec.source, &spec.target] {
                if !activities.contains_key(endpoint) {
                    return Err(EngineError::BadUserRequest(format!(
                        "transition {} references unknown activity '{endpoint}'",
                        spec.id
                    )));
                }
            }
            if transitions.contains_key(&spec.id) {
                return Err(EngineError::BadUserRequest(format!(
                    "duplicate transition '{}'",
                    spec.id
                )));
            }
            transitions.insert(
                spec.id.clone(),
                Transition {
                    id: spec.id.clone(),
                    source: spec.source.clone(),
                    target: spec.target.clone(),
                    condition: spec.condition.clone(),
                },
            );
        }

        // Wire incoming/outgoing in declaration order so traversal is
        // deterministic.
        for spec in &self.transitions {
            activities
                .get_mut(&spec.source)
                .unwrap()
                .outgoing
                .push(spec.id.clone());
            activities
                .get_mut(&spec.target)
                .unwrap()
                .incoming
                .push(spec.id.clone());
            if spec.default_flow {
                let source = activities.get_mut(&spec.source).unwrap();
                if source.default_flow.is_some() {
                    return Err(EngineError::BadUserRequest(format!(
                        "activity '{}' has more than one default flow",
                        spec.source
                    )));
                }
                source.default_flow = Some(spec.id.clone());
            }
        }

        // Nesting index for composite activities.
        let nested: Vec<(String, String)> = activities
            .values()
            .filter_map(|a| a.parent_scope.clone().map(|p| (p, a.id.clone())))
            .collect();
        for (parent, child) in nested {
            let scope = activities
                .get_mut(&parent)
                .ok_or_else(|| EngineError::BadUserRequest(format!(
                    "unknown parent scope '{parent}'"
                )))?;
            if !scope.kind.is_composite() {
                return Err(EngineError::BadUserRequest(format!(
                    "activity '{parent}' cannot contain nested activities"
                )));
            }
            scope.children.push(child);
        }

        // Exactly one root-level start event; each sub-process needs its own.
        let initial = {
            let mut roots = activities.values().filter(|a| {
                matches!(a.kind, ActivityKind::StartEvent) && a.parent_scope.is_none()
            });
            let first = roots.next().ok_or_else(|| {
                EngineError::BadUserRequest("definition has no start event".into())
            })?;
            if roots.next().is_some() {
                return Err(EngineError::BadUserRequest(
                    "definition has more than one root start event".into(),
                ));
            }
            first.id.clone()
        };
        for scope in activities.values().filter(|a| a.kind.is_composite()) {
            let starts = scope
                .children
                .iter()
                .filter(|c| matches!(activities[c.as_str()].kind, ActivityKind::StartEvent))
                .count();
            if starts != 1 {
                return Err(EngineError::BadUserRequest(format!(
                    "sub-process '{}' must contain exactly one start event",
                    scope.id
                )));
            }
        }

        // Reachability index.
        let mut graph: DiGraph<String, ()> = DiGraph::new();
        let mut node_index = BTreeMap::new();
        for id in activities.keys() {
            node_index.insert(id.clone(), graph.add_node(id.clone()));
        }
        for t in transitions.values() {
            graph.add_edge(node_index[&t.source], node_index[&t.target], ());
        }

        Ok(Arc::new(ProcessDefinition {
            key: self.key,
            activities,
            transitions,
            initial,
            graph,
            node_index,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_definition_builds() {
        let def = ProcessDefinition::builder("order")
            .start_event("start")
            .service_task("work")
            .end_event("end")
            .flow("start", "work")
            .flow("work", "end")
            .build()
            .unwrap();
        assert_eq!(def.initial_activity_id(), "start");
        assert_eq!(def.activity("work").unwrap().outgoing, vec!["work->end"]);
        assert!(def.can_reach("start", "end"));
        assert!(!def.can_reach("end", "start"));
    }

    #[test]
    fn rejects_duplicate_activity() {
        let err = ProcessDefinition::builder("p")
            .start_event("a")
            .service_task("a")
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::BadUserRequest(_)));
    }

    #[test]
    fn rejects_dangling_transition() {
        let err = ProcessDefinition::builder("p")
            .start_event("start")
            .flow("start", "missing")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown activity"));
    }

    #[test]
    fn rejects_missing_start_event() {
        let err = ProcessDefinition::builder("p")
            .service_task("t")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no start event"));
    }

    #[test]
    fn sub_process_nesting() {
        let def = ProcessDefinition::builder("p")
            .start_event("start")
            .sub_process("sub")
            .start_event("inner_start")
            .service_task("inner_task")
            .end_event("inner_end")
            .end_sub_process()
            .end_event("end")
            .flow("start", "sub")
            .flow("inner_start", "inner_task")
            .flow("inner_task", "inner_end")
            .flow("sub", "end")
            .build()
            .unwrap();
        let sub = def.activity("sub").unwrap();
        assert!(sub.kind.is_composite());
        assert_eq!(sub.children.len(), 3);
        assert_eq!(
            def.activity("inner_task").unwrap().parent_scope.as_deref(),
            Some("sub")
        );
    }
}
