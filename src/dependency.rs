//! Admission check for task dependencies.
//!
//! The graph is rebuilt from task records on every check. Validation can only refuse
//! to enlarge a graph; it never repairs one that is already malformed.

use crate::error::{CoordinationError, HiveResult};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Directed graph: task id -> ids it depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: HashMap<String, Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the outgoing edges of `task_id`.
    pub fn insert(&mut self, task_id: impl Into<String>, dependencies: Vec<String>) {
        self.edges.insert(task_id.into(), dependencies);
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.edges.contains_key(task_id)
    }

    pub fn dependencies_of(&self, task_id: &str) -> &[String] {
        self.edges.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// First cycle reachable from `start`, as `[a, b, .., a]`.
    pub fn find_cycle_from(&self, start: &str) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut path: Vec<&str> = Vec::new();
        if self.visit(start, &mut marks, &mut path) {
            let (last, _) = path.split_last()?;
            let first = path.iter().position(|node| node == last)?;
            return Some(path[first..].iter().map(|s| s.to_string()).collect());
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> bool {
        match marks.get(node) {
            Some(Mark::InProgress) => {
                path.push(node);
                return true;
            }
            Some(Mark::Done) => return false,
            None => {}
        }

        marks.insert(node, Mark::InProgress);
        path.push(node);

        for dep in self.dependencies_of(node) {
            if self.visit(dep, marks, path) {
                return true;
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        false
    }
}

impl FromIterator<(String, Vec<String>)> for DependencyGraph {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        Self {
            edges: iter.into_iter().collect(),
        }
    }
}

/// Outcome of a dry-run validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReport {
    pub task_id: String,
    pub valid: bool,
    pub self_dependency: bool,
    pub missing: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyValidator;

impl DependencyValidator {
    pub fn new() -> Self {
        Self
    }

    /// Reject `task_id -> dependencies` if it depends on itself or closes a cycle
    /// with the existing graph.
    pub fn check_admission(
        &self,
        graph: &DependencyGraph,
        task_id: &str,
        dependencies: &[String],
    ) -> HiveResult<()> {
        if dependencies.iter().any(|dep| dep == task_id) {
            return Err(CoordinationError::SelfDependency(task_id.to_string()));
        }

        if let Some(path) = Self::cycle_with(graph, task_id, dependencies) {
            return Err(CoordinationError::CycleDetected { path });
        }

        Ok(())
    }

    /// Report every problem with a proposal instead of stopping at the first.
    pub fn validate(
        &self,
        graph: &DependencyGraph,
        task_id: &str,
        dependencies: &[String],
    ) -> DependencyReport {
        let self_dependency = dependencies.iter().any(|dep| dep == task_id);
        let mut seen = HashSet::new();
        let missing: Vec<String> = dependencies
            .iter()
            .filter(|dep| *dep != task_id && !graph.contains(dep) && seen.insert(dep.as_str()))
            .cloned()
            .collect();
        let cycle = if self_dependency {
            Some(vec![task_id.to_string(), task_id.to_string()])
        } else {
            Self::cycle_with(graph, task_id, dependencies)
        };

        DependencyReport {
            task_id: task_id.to_string(),
            valid: !self_dependency && missing.is_empty() && cycle.is_none(),
            self_dependency,
            missing,
            cycle,
        }
    }

    fn cycle_with(
        graph: &DependencyGraph,
        task_id: &str,
        dependencies: &[String],
    ) -> Option<Vec<String>> {
        let mut proposed = graph.clone();
        proposed.insert(task_id, dependencies.to_vec());
        proposed.find_cycle_from(task_id)
    }
}
