//! Dependency graph checks for decompositions and scheduled tasks.

use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::domain::errors::{RuntimeError, RuntimeResult};
use crate::domain::models::goal::Decomposition;
use crate::domain::models::task::Task;

/// Cycle detection and ordering over task dependency graphs.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver;

// Standalone DFS helper (no self needed)
fn detect_cycle_util(
    node: Uuid,
    graph: &HashMap<Uuid, Vec<Uuid>>,
    visited: &mut HashSet<Uuid>,
    rec_stack: &mut HashSet<Uuid>,
    path: &mut Vec<Uuid>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(&node) {
        for &neighbor in neighbors {
            if !visited.contains(&neighbor) {
                if detect_cycle_util(neighbor, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(&neighbor) {
                if let Some(cycle_start) = path.iter().position(|&id| id == neighbor) {
                    path.drain(0..cycle_start);
                    return true;
                }
            }
        }
    }

    rec_stack.remove(&node);
    path.pop();
    false
}

fn find_cycle(graph: &HashMap<Uuid, Vec<Uuid>>) -> Option<Vec<Uuid>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for node in graph.keys() {
        if !visited.contains(node)
            && detect_cycle_util(*node, graph, &mut visited, &mut rec_stack, &mut path)
        {
            return Some(path);
        }
    }
    None
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Reject a decomposition whose dependency map references unknown
    /// tasks or forms a cycle.
    pub fn validate_decomposition(&self, decomposition: &Decomposition) -> RuntimeResult<()> {
        let known: HashSet<Uuid> = decomposition.tasks.iter().map(|t| t.id).collect();

        let mut graph: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for descriptor in &decomposition.tasks {
            graph.entry(descriptor.id).or_default();
        }
        for (task_id, deps) in &decomposition.dependencies {
            if !known.contains(task_id) {
                return Err(RuntimeError::ValidationFailed(format!(
                    "Dependency map references unknown task {task_id}"
                )));
            }
            for dep in deps {
                if !known.contains(dep) {
                    return Err(RuntimeError::ValidationFailed(format!(
                        "Task {task_id} depends on unknown task {dep}"
                    )));
                }
                if dep == task_id {
                    return Err(RuntimeError::DependencyCycle(*task_id));
                }
                graph.entry(*task_id).or_default().push(*dep);
            }
        }

        if let Some(cycle) = find_cycle(&graph) {
            return Err(RuntimeError::DependencyCycle(
                cycle.first().copied().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    /// Detect a cycle among scheduled tasks; returns the cycle path.
    pub fn detect_cycle(&self, tasks: &[Task]) -> Option<Vec<Uuid>> {
        let mut graph: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for task in tasks {
            graph
                .entry(task.id)
                .or_default()
                .extend(task.depends_on.iter().copied());
        }
        find_cycle(&graph)
    }

    /// Topological order, dependencies before dependents (Kahn).
    pub fn topological_sort(&self, tasks: &[Task]) -> RuntimeResult<Vec<Uuid>> {
        if let Some(cycle) = self.detect_cycle(tasks) {
            return Err(RuntimeError::DependencyCycle(
                cycle.first().copied().unwrap_or_default(),
            ));
        }

        let mut in_degree: HashMap<Uuid, usize> = HashMap::new();
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

        for task in tasks {
            in_degree.entry(task.id).or_insert(0);
            for &dep in &task.depends_on {
                dependents.entry(dep).or_default().push(task.id);
                *in_degree.entry(task.id).or_insert(0) += 1;
            }
        }

        let mut queue: Vec<Uuid> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut sorted = Vec::with_capacity(tasks.len());

        while let Some(node) = queue.pop() {
            sorted.push(node);
            if let Some(next) = dependents.get(&node) {
                for &dependent in next {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push(dependent);
                        }
                    }
                }
            }
        }

        if sorted.len() != in_degree.len() {
            return Err(RuntimeError::Internal(
                "Topological sort did not cover the graph".to_string(),
            ));
        }
        Ok(sorted)
    }
}
