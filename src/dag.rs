//! DAG Builder.
//!
//! Builds a graph whose nodes are [`TaskRun`](crate::models::task_run::TaskRun)
//! stubs and whose edges carry predecessor -> successor direction. The
//! representation is an arena (`Vec<Node>`) plus index-based adjacency
//! (successors and a predecessor count per node) rather than a cyclic
//! `Rc<RefCell<_>>` ownership graph. Topological progress becomes a
//! counter-decrement: a node joins the ready set exactly when its
//! predecessor count reaches zero.

use crate::errors::SubmissionError;
use crate::models::pipeline::TaskDefinition;
use lazy_regex::regex_is_match;
use std::collections::HashMap;

/// Task names become part of a TaskRun's label and the cluster's workload
/// name, so they're restricted to what both a SQLite column and a
/// Kubernetes resource name tolerate.
fn is_valid_task_name(name: &str) -> bool {
    regex_is_match!(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$", name)
}

#[derive(Debug, Clone)]
struct Node {
    task: TaskDefinition,
    successors: Vec<usize>,
    predecessor_count: usize,
}

/// A built, acyclic task graph for one pipeline submission.
#[derive(Debug, Clone)]
pub struct Dag {
    nodes: Vec<Node>,
    index_by_name: HashMap<String, usize>,
    /// Declaration order, preserved for ready-set tie-breaking.
    declaration_order: Vec<usize>,
}

impl Dag {
    /// Validate `tasks` and build the graph. Fails with
    /// [`SubmissionError::UnknownDependency`] if a `depends` reference does
    /// not resolve, or [`SubmissionError::CycleDetected`] naming one
    /// offending node if the dependency graph is cyclic (I3).
    pub fn build(tasks: &[TaskDefinition]) -> Result<Self, SubmissionError> {
        let mut index_by_name = HashMap::with_capacity(tasks.len());
        let mut nodes: Vec<Node> = Vec::with_capacity(tasks.len());

        for (i, task) in tasks.iter().enumerate() {
            if !is_valid_task_name(&task.name) {
                return Err(SubmissionError::Validation(format!(
                    "task name '{}' must be lowercase alphanumeric with internal hyphens",
                    task.name
                )));
            }
            if index_by_name.contains_key(&task.name) {
                return Err(SubmissionError::Validation(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }
            index_by_name.insert(task.name.clone(), i);
            nodes.push(Node {
                task: task.clone(),
                successors: Vec::new(),
                predecessor_count: 0,
            });
        }

        for (i, task) in tasks.iter().enumerate() {
            let Some(dep_name) = &task.depends else {
                continue;
            };
            let Some(&dep_index) = index_by_name.get(dep_name) else {
                return Err(SubmissionError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep_name.clone(),
                });
            };
            nodes[dep_index].successors.push(i);
            nodes[i].predecessor_count += 1;
        }

        let declaration_order: Vec<usize> = (0..nodes.len()).collect();

        let dag = Self {
            nodes,
            index_by_name,
            declaration_order,
        };
        dag.assert_acyclic()?;
        Ok(dag)
    }

    /// Kahn's algorithm: repeatedly remove zero-indegree nodes. Any node
    /// left over after the queue drains sits on a cycle.
    fn assert_acyclic(&self) -> Result<(), SubmissionError> {
        let mut indegree: Vec<usize> = self.nodes.iter().map(|n| n.predecessor_count).collect();
        let mut queue: Vec<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut visited = 0usize;

        while let Some(i) = queue.pop() {
            visited += 1;
            for &succ in &self.nodes[i].successors {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    queue.push(succ);
                }
            }
        }

        if visited != self.nodes.len() {
            let offender = indegree
                .iter()
                .position(|&d| d > 0)
                .expect("cycle implies a remaining positive indegree node");
            return Err(SubmissionError::CycleDetected(
                self.nodes[offender].task.name.clone(),
            ));
        }

        Ok(())
    }

    /// Every task in declaration order, for constructing initial TaskRuns.
    pub fn tasks_in_order(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.declaration_order.iter().map(|&i| &self.nodes[i].task)
    }

    /// The initial ready set: tasks with no dependencies, in declaration
    /// order.
    pub fn initial_ready_set(&self) -> Vec<&TaskDefinition> {
        self.declaration_order
            .iter()
            .filter(|&&i| self.nodes[i].predecessor_count == 0)
            .map(|&i| &self.nodes[i].task)
            .collect()
    }

    /// Names of the direct dependents of `name`, used by the executor to
    /// propagate TERMINATED on failure.
    pub fn successors_of(&self, name: &str) -> Vec<&str> {
        match self.index_by_name.get(name) {
            Some(&i) => self.nodes[i]
                .successors
                .iter()
                .map(|&s| self.nodes[s].task.name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Name of the single dependency a task declares, if any.
    pub fn dependency_of(&self, name: &str) -> Option<&str> {
        let &i = self.index_by_name.get(name)?;
        // A node's sole predecessor, if any: look it up by scanning, since
        // we keep forward (successor) edges and a predecessor count rather
        // than a redundant back-edge list.
        self.nodes
            .iter()
            .find(|n| n.successors.contains(&i))
            .map(|n| n.task.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::pipeline::TaskDefinition;

    fn task(name: &str, depends: Option<&str>) -> TaskDefinition {
        let mut t = TaskDefinition::new(name, "img");
        t.depends = depends.map(String::from);
        t
    }

    #[test]
    fn initial_ready_set_is_declaration_ordered_roots() {
        let tasks = vec![task("a", None), task("b", None), task("c", Some("a"))];
        let dag = Dag::build(&tasks).unwrap();
        let ready: Vec<&str> = dag.initial_ready_set().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(ready, vec!["a", "b"]);
    }

    #[test]
    fn detects_two_node_cycle() {
        // a -> b -> a
        let tasks = vec![task("a", Some("b")), task("b", Some("a"))];
        let err = Dag::build(&tasks).unwrap_err();
        match err {
            SubmissionError::CycleDetected(node) => assert!(node == "a" || node == "b"),
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_dependency() {
        let tasks = vec![task("export", Some("train"))];
        let err = Dag::build(&tasks).unwrap_err();
        assert_eq!(
            err,
            SubmissionError::UnknownDependency {
                task: "export".into(),
                dependency: "train".into(),
            }
        );
    }

    #[test]
    fn rejects_invalid_task_name() {
        let tasks = vec![task("Train_Job!", None)];
        let err = Dag::build(&tasks).unwrap_err();
        match err {
            SubmissionError::Validation(_) => {}
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_task_name() {
        let tasks = vec![task("train", None), task("train", None)];
        let err = Dag::build(&tasks).unwrap_err();
        match err {
            SubmissionError::Validation(_) => {}
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn successors_of_train_includes_export() {
        let tasks = vec![task("train", None), task("export", Some("train"))];
        let dag = Dag::build(&tasks).unwrap();
        assert_eq!(dag.successors_of("train"), vec!["export"]);
        assert!(dag.successors_of("export").is_empty());
    }
}
