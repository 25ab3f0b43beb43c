//! C2 — compile a [`WorkflowDefinition`] into a validated, acyclic
//! [`ExecutionGraph`] with precomputed parallel groups.
//!
//! Grounded on the teacher's `durableengine/graph.rs` (a `petgraph::DiGraph`
//! built from task entries), generalized from that crate's single-chain
//! `then`-transition model to genuine multi-dependency DAGs with implicit
//! dependency discovery and level-based parallel grouping.

use petgraph::graph::{DiGraph, NodeIndex};
use snafu::prelude::*;
use std::collections::HashMap;

use crate::template;
use crate::workflow::WorkflowDefinition;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("duplicate task id '{id}'"))]
    DuplicateTaskId { id: String },

    #[snafu(display("task '{from}' depends on unknown task '{to}'"))]
    UnknownDependency { from: String, to: String },

    #[snafu(display("circular dependency: {}", cycle.join(" -> ")))]
    CircularDependency { cycle: Vec<String> },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Explains why an edge exists in the graph, for diagnostics.
#[derive(Debug, Clone)]
pub enum DependencySource {
    Explicit,
    ImplicitTemplate { field: String },
}

#[derive(Debug, Clone)]
pub struct DependencyDiagnostic {
    pub from: String,
    pub to: String,
    pub source: DependencySource,
}

#[derive(Debug, Default, Clone)]
pub struct GraphBuildDiagnostics {
    pub dependencies: Vec<DependencyDiagnostic>,
}

#[derive(Debug)]
pub struct ExecutionGraph {
    pub(crate) graph: DiGraph<String, ()>,
    pub(crate) nodes: HashMap<String, NodeIndex>,
    pub parallel_groups: Vec<Vec<String>>,
    pub levels: HashMap<String, usize>,
}

impl ExecutionGraph {
    #[must_use]
    pub fn task_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    #[must_use]
    pub fn dependencies_of(&self, task_id: &str) -> Vec<String> {
        let Some(&idx) = self.nodes.get(task_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect()
    }

    #[must_use]
    pub fn dependents_of(&self, task_id: &str) -> Vec<String> {
        let Some(&idx) = self.nodes.get(task_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
            .filter_map(|n| self.graph.node_weight(n).cloned())
            .collect()
    }

    #[must_use]
    pub fn roots(&self) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|id| self.dependencies_of(id).is_empty())
            .cloned()
            .collect()
    }
}

/// Build and validate the execution graph for a workflow definition.
///
/// # Errors
/// Returns [`Error::DuplicateTaskId`], [`Error::UnknownDependency`], or
/// [`Error::CircularDependency`] per spec.md §4.2.
pub fn build_graph(workflow: &WorkflowDefinition) -> Result<(ExecutionGraph, GraphBuildDiagnostics)> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for task in &workflow.tasks {
        if nodes.contains_key(&task.id) {
            return Err(Error::DuplicateTaskId {
                id: task.id.clone(),
            });
        }
        let idx = graph.add_node(task.id.clone());
        nodes.insert(task.id.clone(), idx);
    }

    let mut diagnostics = GraphBuildDiagnostics::default();

    for task in &workflow.tasks {
        let src = *nodes.get(&task.id).expect("just inserted");

        for dep in &task.depends_on {
            let Some(&dst) = nodes.get(dep) else {
                return Err(Error::UnknownDependency {
                    from: task.id.clone(),
                    to: dep.clone(),
                });
            };
            graph.add_edge(dst, src, ());
            diagnostics.dependencies.push(DependencyDiagnostic {
                from: task.id.clone(),
                to: dep.clone(),
                source: DependencySource::Explicit,
            });
        }

        for (field, tmpl) in &task.input {
            for dep_id in template::extract_task_refs(tmpl) {
                add_implicit_edge(&mut graph, &mut diagnostics, &nodes, &task.id, &dep_id, field)?;
            }
        }
        if let Some(cond) = &task.condition {
            for dep_id in template::extract_task_refs(cond) {
                add_implicit_edge(&mut graph, &mut diagnostics, &nodes, &task.id, &dep_id, "condition")?;
            }
        }
        if let Some(switch) = &task.switch {
            for dep_id in template::extract_task_refs(&switch.value) {
                add_implicit_edge(&mut graph, &mut diagnostics, &nodes, &task.id, &dep_id, "switch.value")?;
            }
        }
        if let Some(cache) = &task.cache {
            if let Some(key) = &cache.key {
                for dep_id in template::extract_task_refs(key) {
                    add_implicit_edge(&mut graph, &mut diagnostics, &nodes, &task.id, &dep_id, "cache.key")?;
                }
            }
        }
        if let Some(fe) = &task.for_each {
            for dep_id in template::extract_task_refs(&fe.items) {
                add_implicit_edge(&mut graph, &mut diagnostics, &nodes, &task.id, &dep_id, "forEach.items")?;
            }
        }
    }

    detect_cycle(&graph, &nodes)?;

    let levels = compute_levels(&graph, &nodes);
    let parallel_groups = group_by_level(&levels);

    Ok((
        ExecutionGraph {
            graph,
            nodes,
            parallel_groups,
            levels,
        },
        diagnostics,
    ))
}

fn add_implicit_edge(
    graph: &mut DiGraph<String, ()>,
    diagnostics: &mut GraphBuildDiagnostics,
    nodes: &HashMap<String, NodeIndex>,
    from: &str,
    to: &str,
    field: &str,
) -> Result<()> {
    let Some(&dst_of_to) = nodes.get(to) else {
        return Err(Error::UnknownDependency {
            from: from.to_string(),
            to: to.to_string(),
        });
    };
    let src = *nodes.get(from).expect("task node exists");
    if !graph.contains_edge(dst_of_to, src) {
        graph.add_edge(dst_of_to, src, ());
        diagnostics.dependencies.push(DependencyDiagnostic {
            from: from.to_string(),
            to: to.to_string(),
            source: DependencySource::ImplicitTemplate {
                field: field.to_string(),
            },
        });
    }
    Ok(())
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Mark {
    InStack,
    Done,
}

/// Depth-first traversal with a recursion stack, reporting the cycle path
/// in traversal order on first revisit — spec.md §4.2 step 4.
fn detect_cycle(graph: &DiGraph<String, ()>, nodes: &HashMap<String, NodeIndex>) -> Result<()> {
    let mut marks: HashMap<NodeIndex, Mark> = HashMap::new();
    let mut stack_path: Vec<NodeIndex> = Vec::new();

    let mut sorted_starts: Vec<&NodeIndex> = nodes.values().collect();
    sorted_starts.sort_by_key(|idx| graph.node_weight(**idx).cloned().unwrap_or_default());

    for &start in sorted_starts {
        if !marks.contains_key(&start) {
            visit(graph, start, &mut marks, &mut stack_path)?;
        }
    }
    Ok(())
}

fn visit(
    graph: &DiGraph<String, ()>,
    node: NodeIndex,
    marks: &mut HashMap<NodeIndex, Mark>,
    stack_path: &mut Vec<NodeIndex>,
) -> Result<()> {
    marks.insert(node, Mark::InStack);
    stack_path.push(node);

    let mut successors: Vec<NodeIndex> = graph.neighbors_directed(node, petgraph::Direction::Outgoing).collect();
    successors.sort_by_key(|idx| graph.node_weight(*idx).cloned().unwrap_or_default());

    for succ in successors {
        match marks.get(&succ) {
            Some(Mark::Done) => continue,
            Some(Mark::InStack) => {
                let start = stack_path.iter().position(|n| *n == succ).unwrap_or(0);
                let mut cycle: Vec<String> = stack_path
                    .get(start..)
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|n| graph.node_weight(*n).cloned())
                    .collect();
                if let Some(name) = graph.node_weight(succ) {
                    cycle.push(name.clone());
                }
                return Err(Error::CircularDependency { cycle });
            }
            None => visit(graph, succ, marks, stack_path)?,
        }
    }

    stack_path.pop();
    marks.insert(node, Mark::Done);
    Ok(())
}

/// `level(root) = 0`, `level(v) = 1 + max(level(u))` over `u ∈ deps(v)` —
/// spec.md §4.2 step 5. The graph is already known acyclic at this point.
fn compute_levels(graph: &DiGraph<String, ()>, nodes: &HashMap<String, NodeIndex>) -> HashMap<String, usize> {
    let topo = petgraph::algo::toposort(graph, None).expect("acyclic graph");

    let mut levels: HashMap<NodeIndex, usize> = HashMap::new();
    for idx in &topo {
        let level = graph
            .neighbors_directed(*idx, petgraph::Direction::Incoming)
            .map(|dep| levels.get(&dep).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        levels.insert(*idx, level);
    }

    nodes
        .iter()
        .map(|(id, idx)| (id.clone(), levels.get(idx).copied().unwrap_or(0)))
        .collect()
}

/// Partition task ids by level; each group executes after the previous
/// group's dependencies are satisfied, in lexicographic order within the
/// group for determinism.
fn group_by_level(levels: &HashMap<String, usize>) -> Vec<Vec<String>> {
    let max_level = levels.values().copied().max().unwrap_or(0);
    let mut groups: Vec<Vec<String>> = vec![Vec::new(); max_level + 1];
    for (id, level) in levels {
        if let Some(group) = groups.get_mut(*level) {
            group.push(id.clone());
        }
    }
    for group in &mut groups {
        group.sort();
    }
    groups
}
