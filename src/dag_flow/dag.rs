//! Tasks and layered DAGs
//!
//! A [`Dag`] is a partition of tasks into ordered layers such that every
//! task's dependencies live in strictly earlier layers. It is immutable
//! input to the executor except for [`Dag::splice`], which only appends.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::core::errors::{ControlError, Result};
use crate::security::PermissionLevel;

pub type TaskId = String;

/// What a task runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// A named action resolved through the action registry
    Action {
        action: String,
        #[serde(default)]
        inputs: Value,
    },
    /// A capability-backed call, subject to permission checks
    Capability {
        capability_id: String,
        #[serde(default)]
        args: Value,
    },
}

impl TaskKind {
    /// Name used to resolve the runnable
    pub fn target(&self) -> &str {
        match self {
            Self::Action { action, .. } => action,
            Self::Capability { capability_id, .. } => capability_id,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Self::Action { inputs, .. } => inputs,
            Self::Capability { args, .. } => args,
        }
    }
}

/// A unit of work scheduled in a DAG layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    pub kind: TaskKind,
    /// Only consulted when deciding whether an escalation is plausible
    #[serde(default)]
    pub permission_level: PermissionLevel,
    /// Pre-computed confidence from the suggester; `None` runs unconditionally
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Raise a decision gate before running this task
    #[serde(default)]
    pub risky: bool,
    #[serde(default)]
    pub description: String,
}

impl Task {
    /// Create an action task with no dependencies
    pub fn action(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            kind: TaskKind::Action {
                action: action.into(),
                inputs: Value::Object(serde_json::Map::new()),
            },
            permission_level: PermissionLevel::default(),
            confidence: None,
            risky: false,
            description: String::new(),
        }
    }

    /// Create a capability task with no dependencies
    pub fn capability(id: impl Into<String>, capability_id: impl Into<String>) -> Self {
        Self {
            kind: TaskKind::Capability {
                capability_id: capability_id.into(),
                args: Value::Object(serde_json::Map::new()),
            },
            ..Self::action(id, "")
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_inputs(mut self, payload: Value) -> Self {
        match &mut self.kind {
            TaskKind::Action { inputs, .. } => *inputs = payload,
            TaskKind::Capability { args, .. } => *args = payload,
        }
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_permission(mut self, level: PermissionLevel) -> Self {
        self.permission_level = level;
        self
    }

    pub fn risky(mut self) -> Self {
        self.risky = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// On-disk DAG definition; either flat tasks or explicit layers
#[derive(Debug, Deserialize)]
struct DagDefinition {
    name: String,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    layers: Vec<Vec<Task>>,
}

/// Tasks partitioned into dependency-ordered layers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub name: String,
    layers: Vec<Vec<Task>>,
}

impl Dag {
    /// Validates an explicit layering
    pub fn from_layers(name: impl Into<String>, layers: Vec<Vec<Task>>) -> Result<Self> {
        let mut seen: HashMap<&str, usize> = HashMap::new();

        for (idx, layer) in layers.iter().enumerate() {
            if layer.is_empty() {
                return Err(ControlError::InvalidDag(format!("Layer {} is empty", idx)));
            }
            for task in layer {
                if seen.insert(task.id.as_str(), idx).is_some() {
                    return Err(ControlError::InvalidDag(format!(
                        "Duplicate task id '{}'",
                        task.id
                    )));
                }
            }
        }

        for (idx, layer) in layers.iter().enumerate() {
            for task in layer {
                validate_confidence(task)?;
                for dep in &task.depends_on {
                    match seen.get(dep.as_str()) {
                        Some(dep_layer) if *dep_layer < idx => {}
                        Some(dep_layer) => {
                            return Err(ControlError::InvalidDag(format!(
                                "Task '{}' in layer {} depends on '{}' in layer {}",
                                task.id, idx, dep, dep_layer
                            )))
                        }
                        None => {
                            return Err(ControlError::InvalidDag(format!(
                                "Dependency '{}' for task '{}' not found",
                                dep, task.id
                            )))
                        }
                    }
                }
            }
        }

        Ok(Self {
            name: name.into(),
            layers,
        })
    }

    /// Computes the layering of a flat task list. Each task lands one layer
    /// after its deepest dependency; input order is kept within a layer.
    pub fn from_tasks(name: impl Into<String>, tasks: Vec<Task>) -> Result<Self> {
        let assignments = assign_layers(&tasks, &HashMap::new(), 0)?;
        let depth = assignments.iter().copied().max().map_or(0, |d| d + 1);

        let mut layers: Vec<Vec<Task>> = vec![Vec::new(); depth];
        for (task, layer) in tasks.into_iter().zip(assignments) {
            layers[layer].push(task);
        }

        Self::from_layers(name, layers)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let definition: DagDefinition = serde_yaml::from_str(yaml)?;
        match (definition.tasks.is_empty(), definition.layers.is_empty()) {
            (false, true) => Self::from_tasks(definition.name, definition.tasks),
            (true, false) => Self::from_layers(definition.name, definition.layers),
            (true, true) => Err(ControlError::InvalidDag(format!(
                "DAG '{}' contains no tasks",
                definition.name
            ))),
            (false, false) => Err(ControlError::InvalidDag(
                "Specify either 'tasks' or 'layers', not both".into(),
            )),
        }
    }

    pub fn load_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, index: usize) -> Option<&[Task]> {
        self.layers.get(index).map(Vec::as_slice)
    }

    pub fn layers(&self) -> &[Vec<Task>] {
        &self.layers
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.layers.iter().flatten()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks().find(|t| t.id == id)
    }

    pub fn layer_of(&self, id: &str) -> Option<usize> {
        self.layers
            .iter()
            .position(|layer| layer.iter().any(|t| t.id == id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.layer_of(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Inserts new tasks after `after_layer`. Each task goes to the earliest
    /// layer past `after_layer` that follows all its dependencies, appending
    /// layers as needed. Existing tasks never move. All-or-nothing.
    pub fn splice(&mut self, tasks: Vec<Task>, after_layer: usize) -> Result<Vec<TaskId>> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let existing: HashMap<String, usize> = self
            .layers
            .iter()
            .enumerate()
            .flat_map(|(idx, layer)| layer.iter().map(move |t| (t.id.clone(), idx)))
            .collect();

        for task in &tasks {
            if existing.contains_key(&task.id) {
                return Err(ControlError::InvalidDag(format!(
                    "Replanned task '{}' already exists",
                    task.id
                )));
            }
            validate_confidence(task)?;
        }

        let assignments = assign_layers(&tasks, &existing, after_layer + 1)?;

        let mut layers = self.layers.clone();
        let mut added = Vec::with_capacity(tasks.len());
        for (task, layer) in tasks.into_iter().zip(assignments) {
            while layers.len() <= layer {
                layers.push(Vec::new());
            }
            added.push(task.id.clone());
            layers[layer].push(task);
        }

        // Layers between the current one and the new tasks may be empty when
        // the DAG was already exhausted; drop them so indices stay dense.
        layers.retain(|layer| !layer.is_empty());

        let spliced = Self::from_layers(self.name.clone(), layers)?;
        self.layers = spliced.layers;
        Ok(added)
    }
}

fn validate_confidence(task: &Task) -> Result<()> {
    match task.confidence {
        Some(c) if !(0.0..=1.0).contains(&c) || c.is_nan() => Err(ControlError::InvalidDag(
            format!("Task '{}' has confidence {} outside [0, 1]", task.id, c),
        )),
        _ => Ok(()),
    }
}

/// Layer index for each task in `tasks`. Dependencies may point at other
/// entries of `tasks` or at `fixed` tasks whose layer is already known.
/// No task is placed before `min_layer`.
fn assign_layers(
    tasks: &[Task],
    fixed: &HashMap<String, usize>,
    min_layer: usize,
) -> Result<Vec<usize>> {
    let mut graph = DiGraph::<usize, ()>::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

    for (pos, task) in tasks.iter().enumerate() {
        if indices.insert(task.id.as_str(), graph.add_node(pos)).is_some() {
            return Err(ControlError::InvalidDag(format!(
                "Duplicate task id '{}'",
                task.id
            )));
        }
    }

    for task in tasks {
        let target = indices[task.id.as_str()];
        let mut unique = HashSet::new();
        for dep in &task.depends_on {
            if !unique.insert(dep.as_str()) {
                continue;
            }
            if let Some(source) = indices.get(dep.as_str()) {
                graph.add_edge(*source, target, ());
            } else if !fixed.contains_key(dep) {
                return Err(ControlError::InvalidDag(format!(
                    "Dependency '{}' for task '{}' not found",
                    dep, task.id
                )));
            }
        }
    }

    if is_cyclic_directed(&graph) {
        return Err(ControlError::InvalidDag(
            "The graph is not a DAG as it contains cycles".into(),
        ));
    }
    let order = toposort(&graph, None)
        .map_err(|_| ControlError::InvalidDag("The graph contains cycles".into()))?;

    let mut layer_of = vec![min_layer; tasks.len()];
    for node in order {
        let pos = graph[node];
        let task = &tasks[pos];
        let mut layer = min_layer;
        for dep in &task.depends_on {
            let dep_layer = match indices.get(dep.as_str()) {
                Some(idx) => layer_of[graph[*idx]],
                None => fixed[dep],
            };
            layer = layer.max(dep_layer + 1);
        }
        layer_of[pos] = layer;
    }

    Ok(layer_of)
}
