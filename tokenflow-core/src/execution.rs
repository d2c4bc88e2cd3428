use crate::error::{EngineError, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One concurrent path of execution within a process instance.
///
/// Executions live in the arena of their `ExecutionTree`; the parent link is
/// an id, children are derived from the tree's index. No back-pointers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub parent: Option<ExecutionId>,
    /// Cursor position in the model graph. `None` only for freshly forked
    /// children that have not taken their first transition yet.
    pub activity: Option<String>,
    /// One of several sibling tokens under a common scope parent.
    pub concurrent: bool,
    /// Owns the lifecycle of variables declared within it.
    pub scope: bool,
    pub active: bool,
    pub waiting: Option<WaitState>,
    pub variables: BTreeMap<String, VariableValue>,
    pub subscriptions: Vec<EventSubscription>,
    /// Join bookkeeping, kept on scope executions: join activity id to the
    /// incoming transition ids that have arrived so far.
    pub joins: BTreeMap<String, Vec<String>>,
}

impl Execution {
    fn new(id: ExecutionId, parent: Option<ExecutionId>) -> Self {
        Self {
            id,
            parent,
            activity: None,
            concurrent: false,
            scope: false,
            active: true,
            waiting: None,
            variables: BTreeMap::new(),
            subscriptions: Vec::new(),
            joins: BTreeMap::new(),
        }
    }
}

/// The arena of executions for one process instance, persisted and
/// optimistically locked as a unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionTree {
    pub instance_id: InstanceId,
    pub definition_key: String,
    pub revision: u32,
    pub state: ProcessState,
    pub created_at: DateTime<Utc>,
    root: ExecutionId,
    executions: BTreeMap<ExecutionId, Execution>,
    children: BTreeMap<ExecutionId, Vec<ExecutionId>>,
}

impl ExecutionTree {
    /// Creates the tree with its root execution positioned at `initial`.
    pub fn new(definition_key: &str, initial: &str, created_at: DateTime<Utc>) -> Self {
        let instance_id = Uuid::now_v7();
        let root_id = Uuid::now_v7();
        let mut root = Execution::new(root_id, None);
        root.scope = true;
        root.activity = Some(initial.to_string());
        let mut executions = BTreeMap::new();
        executions.insert(root_id, root);
        Self {
            instance_id,
            definition_key: definition_key.to_string(),
            revision: 0,
            state: ProcessState::Running,
            created_at,
            root: root_id,
            executions,
            children: BTreeMap::new(),
        }
    }

    pub fn root_id(&self) -> ExecutionId {
        self.root
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    pub fn get(&self, id: ExecutionId) -> Result<&Execution> {
        self.executions.get(&id).ok_or_else(|| EngineError::NotFound {
            entity: "execution",
            id: id.to_string(),
        })
    }

    pub fn get_mut(&mut self, id: ExecutionId) -> Result<&mut Execution> {
        self.executions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound {
                entity: "execution",
                id: id.to_string(),
            })
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    /// Child ids in creation order.
    pub fn children_of(&self, id: ExecutionId) -> &[ExecutionId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn create_child(
        &mut self,
        parent: ExecutionId,
        concurrent: bool,
        scope: bool,
    ) -> Result<ExecutionId> {
        if !self.executions.contains_key(&parent) {
            return Err(EngineError::NotFound {
                entity: "execution",
                id: parent.to_string(),
            });
        }
        let id = Uuid::now_v7();
        let mut child = Execution::new(id, Some(parent));
        child.concurrent = concurrent;
        child.scope = scope;
        self.executions.insert(id, child);
        self.children.entry(parent).or_default().push(id);
        Ok(id)
    }

    /// Removes a single execution. The caller is responsible for its
    /// subtree; event subscriptions die with the record.
    pub fn remove(&mut self, id: ExecutionId) {
        if let Some(exec) = self.executions.remove(&id) {
            if let Some(parent) = exec.parent {
                if let Some(siblings) = self.children.get_mut(&parent) {
                    siblings.retain(|c| *c != id);
                    if siblings.is_empty() {
                        self.children.remove(&parent);
                    }
                }
            }
            self.children.remove(&id);
        }
    }

    /// All executions below and including `id`, deepest first, so callers
    /// can end bottom-up.
    pub fn collect_subtree(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut ordered = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            ordered.push(current);
            stack.extend(self.children_of(current).iter().copied());
        }
        ordered.reverse();
        ordered
    }

    /// Nearest ancestor (or self) that is a scope execution.
    pub fn scope_ancestor(&self, id: ExecutionId) -> Result<ExecutionId> {
        let mut current = self.get(id)?;
        loop {
            if current.scope {
                return Ok(current.id);
            }
            match current.parent {
                Some(parent) => current = self.get(parent)?,
                None => return Ok(current.id),
            }
        }
    }

    // ── Variables ──

    /// Reads a variable, walking ancestor scopes; own entries shadow
    /// ancestors.
    pub fn get_variable(&self, id: ExecutionId, name: &str) -> Result<Option<&VariableValue>> {
        let mut current = self.get(id)?;
        loop {
            if let Some(value) = current.variables.get(name) {
                return Ok(Some(value));
            }
            match current.parent {
                Some(parent) => current = self.get(parent)?,
                None => return Ok(None),
            }
        }
    }

    /// Writes a variable into the nearest ancestor scope that already holds
    /// it, falling back to the root scope.
    pub fn set_variable(
        &mut self,
        id: ExecutionId,
        name: &str,
        value: VariableValue,
    ) -> Result<()> {
        let mut target = self.root;
        let mut current = self.get(id)?;
        loop {
            if current.variables.contains_key(name) {
                target = current.id;
                break;
            }
            match current.parent {
                Some(parent) => current = self.get(parent)?,
                None => break,
            }
        }
        self.get_mut(target)?
            .variables
            .insert(name.to_string(), value);
        Ok(())
    }

    /// Writes a variable into this execution's own scope.
    pub fn set_variable_local(
        &mut self,
        id: ExecutionId,
        name: &str,
        value: VariableValue,
    ) -> Result<()> {
        self.get_mut(id)?.variables.insert(name.to_string(), value);
        Ok(())
    }

    /// Fully resolved view of the variables visible to an execution.
    pub fn resolved_variables(&self, id: ExecutionId) -> Result<BTreeMap<String, VariableValue>> {
        let mut chain = Vec::new();
        let mut current = self.get(id)?;
        loop {
            chain.push(current);
            match current.parent {
                Some(parent) => current = self.get(parent)?,
                None => break,
            }
        }
        let mut resolved = BTreeMap::new();
        for exec in chain.into_iter().rev() {
            for (k, v) in &exec.variables {
                resolved.insert(k.clone(), v.clone());
            }
        }
        Ok(resolved)
    }
}
