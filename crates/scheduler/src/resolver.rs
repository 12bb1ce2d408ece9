//! Dependency resolution over the pending queue.
//!
//! Eligibility is recomputed every dispatch tick. Cycle detection is a DFS
//! with a recursion stack over the queued tasks' dependency edges; since
//! dependency lists never change after submission, it only reruns when new
//! tasks have entered the queue.

use std::collections::{HashMap, HashSet};

use crate::queue::PriorityQueue;
use crate::task::{TaskId, TaskStatus};

/// Where a queued task stands with respect to its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyState {
    /// Every dependency has completed.
    Ready,
    /// At least one dependency is still pending or running.
    Waiting,
    /// A dependency id names no known task.
    Missing(TaskId),
    /// A dependency ended in `Failed` or `Cancelled`.
    Failed {
        dependency: TaskId,
        status: TaskStatus,
    },
}

/// Classify a task's dependencies given a status lookup over all known tasks.
pub fn dependency_state<F>(dependencies: &[TaskId], status_of: F) -> DependencyState
where
    F: Fn(&TaskId) -> Option<TaskStatus>,
{
    let mut waiting = false;
    let mut missing = None;
    for dep in dependencies {
        match status_of(dep) {
            None => {
                missing.get_or_insert_with(|| dep.clone());
            }
            Some(status @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
                return DependencyState::Failed {
                    dependency: dep.clone(),
                    status,
                };
            }
            Some(TaskStatus::Completed) => {}
            Some(TaskStatus::Pending | TaskStatus::Running) => waiting = true,
        }
    }
    if let Some(dep) = missing {
        DependencyState::Missing(dep)
    } else if waiting {
        DependencyState::Waiting
    } else {
        DependencyState::Ready
    }
}

/// Queued tasks whose every dependency is completed and none is running,
/// in dispatch order.
pub fn eligible_tasks(
    queue: &PriorityQueue,
    completed: &HashSet<TaskId>,
    running: &HashSet<TaskId>,
) -> Vec<TaskId> {
    queue
        .iter()
        .filter(|entry| {
            entry
                .dependencies
                .iter()
                .all(|dep| completed.contains(dep) && !running.contains(dep))
        })
        .map(|entry| entry.id.clone())
        .collect()
}

/// Memoizing cycle detector.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    checked_generation: Option<u64>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cycles among the queued tasks, each reported as the path that closes
    /// it (`[a, b, a]`). Returns nothing if the queue has not gained tasks
    /// since the previous call.
    pub fn detect_cycles(&mut self, queue: &PriorityQueue) -> Vec<Vec<TaskId>> {
        if self.checked_generation == Some(queue.generation()) {
            return Vec::new();
        }
        self.checked_generation = Some(queue.generation());
        find_cycles(queue)
    }
}

/// DFS over dependency edges between queued tasks.
pub fn find_cycles(queue: &PriorityQueue) -> Vec<Vec<TaskId>> {
    let edges: HashMap<&TaskId, &[TaskId]> = queue
        .iter()
        .map(|entry| (&entry.id, entry.dependencies.as_slice()))
        .collect();

    let mut visited: HashSet<&TaskId> = HashSet::new();
    let mut on_stack: HashSet<&TaskId> = HashSet::new();
    let mut path: Vec<&TaskId> = Vec::new();
    let mut cycles = Vec::new();

    for entry in queue.iter() {
        if !visited.contains(&entry.id) {
            visit(
                &entry.id,
                &edges,
                &mut visited,
                &mut on_stack,
                &mut path,
                &mut cycles,
            );
        }
    }
    cycles
}

fn visit<'a>(
    node: &'a TaskId,
    edges: &HashMap<&'a TaskId, &'a [TaskId]>,
    visited: &mut HashSet<&'a TaskId>,
    on_stack: &mut HashSet<&'a TaskId>,
    path: &mut Vec<&'a TaskId>,
    cycles: &mut Vec<Vec<TaskId>>,
) {
    visited.insert(node);
    on_stack.insert(node);
    path.push(node);

    if let Some(&deps) = edges.get(node) {
        for dep in deps {
            // Edges to tasks outside the queue cannot close a cycle.
            if !edges.contains_key(dep) {
                continue;
            }
            if on_stack.contains(dep) {
                if let Some(start) = path.iter().position(|id| *id == dep) {
                    let mut cycle: Vec<TaskId> =
                        path[start..].iter().map(|id| (*id).clone()).collect();
                    cycle.push(dep.clone());
                    cycles.push(cycle);
                }
            } else if !visited.contains(dep) {
                visit(dep, edges, visited, on_stack, path, cycles);
            }
        }
    }

    path.pop();
    on_stack.remove(node);
}

/// Render a cycle path as `a -> b -> a`.
pub fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Priority;

    fn queue_of(tasks: &[(&str, &[&str])]) -> PriorityQueue {
        let mut q = PriorityQueue::new(100);
        for (id, deps) in tasks {
            let deps = deps.iter().map(|d| TaskId::from(*d)).collect();
            q.insert(TaskId::from(*id), Priority::NORMAL, deps).unwrap();
        }
        q
    }

    fn set(ids: &[&str]) -> HashSet<TaskId> {
        ids.iter().map(|s| TaskId::from(*s)).collect()
    }

    #[test]
    fn eligible_requires_completed_dependencies() {
        let q = queue_of(&[("base", &[]), ("dependent", &["base"])]);

        let eligible = eligible_tasks(&q, &set(&[]), &set(&[]));
        assert_eq!(eligible, vec![TaskId::from("base")]);

        let eligible = eligible_tasks(&q, &set(&["base"]), &set(&[]));
        assert!(eligible.contains(&TaskId::from("dependent")));
    }

    #[test]
    fn running_dependency_blocks() {
        let q = queue_of(&[("dependent", &["base"])]);
        let eligible = eligible_tasks(&q, &set(&["base"]), &set(&["base"]));
        assert!(eligible.is_empty());
    }

    #[test]
    fn unknown_dependency_is_not_eligible_but_not_an_error() {
        let q = queue_of(&[("orphan", &["ghost"])]);
        assert!(eligible_tasks(&q, &set(&[]), &set(&[])).is_empty());
    }

    #[test]
    fn detects_two_node_cycle() {
        let q = queue_of(&[("t1", &["t2"]), ("t2", &["t1"])]);
        let cycles = find_cycles(&q);
        assert_eq!(cycles.len(), 1);
        assert_eq!(format_cycle(&cycles[0]), "t1 -> t2 -> t1");
    }

    #[test]
    fn detects_self_dependency() {
        let q = queue_of(&[("selfish", &["selfish"])]);
        let cycles = find_cycles(&q);
        assert_eq!(cycles, vec![vec![TaskId::from("selfish"), TaskId::from("selfish")]]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let q = queue_of(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        assert!(find_cycles(&q).is_empty());
    }

    #[test]
    fn cycle_detection_is_memoized_per_generation() {
        let mut q = queue_of(&[("t1", &["t2"]), ("t2", &["t1"])]);
        let mut resolver = DependencyResolver::new();
        assert_eq!(resolver.detect_cycles(&q).len(), 1);
        // no new insertions: nothing to report
        assert!(resolver.detect_cycles(&q).is_empty());

        q.insert("t3".into(), Priority::NORMAL, vec!["t3".into()]).unwrap();
        let cycles = resolver.detect_cycles(&q);
        // full rescan after a new insertion
        assert_eq!(cycles.len(), 2);
    }

    #[test]
    fn dependency_state_classification() {
        let lookup = |id: &TaskId| match id.as_str() {
            "done" => Some(TaskStatus::Completed),
            "busy" => Some(TaskStatus::Running),
            "broken" => Some(TaskStatus::Failed),
            "stopped" => Some(TaskStatus::Cancelled),
            _ => None,
        };
        let deps = |ids: &[&str]| ids.iter().map(|s| TaskId::from(*s)).collect::<Vec<_>>();

        assert_eq!(dependency_state(&deps(&["done"]), lookup), DependencyState::Ready);
        assert_eq!(dependency_state(&deps(&[]), lookup), DependencyState::Ready);
        assert_eq!(
            dependency_state(&deps(&["done", "busy"]), lookup),
            DependencyState::Waiting
        );
        assert_eq!(
            dependency_state(&deps(&["busy", "ghost"]), lookup),
            DependencyState::Missing("ghost".into())
        );
        assert_eq!(
            dependency_state(&deps(&["stopped"]), lookup),
            DependencyState::Failed {
                dependency: "stopped".into(),
                status: TaskStatus::Cancelled,
            }
        );
        assert!(matches!(
            dependency_state(&deps(&["broken"]), lookup),
            DependencyState::Failed { .. }
        ));
        // a failed dependency decides even when another one is unknown
        assert!(matches!(
            dependency_state(&deps(&["ghost", "broken"]), lookup),
            DependencyState::Failed { .. }
        ));
    }
}
