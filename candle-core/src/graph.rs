//! Dependency graph between metrics
//!
//! Built once when a catalog is loaded. Edges point from a metric to the
//! metrics that declared it as a dependency. Propagation at runtime is plain
//! recursion, so the graph is rejected at load time if it contains a cycle.

use crate::catalog::{CatalogError, MetricDefinition};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// For each metric index, the indices of metrics depending on it, in
    /// registration order.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build and validate the graph for metrics in registration order.
    pub fn build(
        definitions: &[Arc<MetricDefinition>],
        index: &HashMap<String, usize>,
    ) -> Result<Self, CatalogError> {
        let mut dependents = vec![Vec::new(); definitions.len()];

        for (metric_idx, def) in definitions.iter().enumerate() {
            for dependency in &def.dependencies {
                let dep_idx = *index.get(dependency).ok_or_else(|| {
                    CatalogError::UnknownDependency {
                        metric: def.id.clone(),
                        dependency: dependency.clone(),
                    }
                })?;

                let edges: &mut Vec<usize> = &mut dependents[dep_idx];
                if !edges.contains(&metric_idx) {
                    edges.push(metric_idx);
                }
            }
        }

        let graph = Self { dependents };
        graph.check_acyclic(definitions)?;
        Ok(graph)
    }

    pub fn dependents(&self, index: usize) -> &[usize] {
        self.dependents.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }

    /// Kahn's algorithm. Whatever cannot be ordered sits on, or between,
    /// cycles; nodes merely downstream of a cycle are pruned from the report.
    fn check_acyclic(&self, definitions: &[Arc<MetricDefinition>]) -> Result<(), CatalogError> {
        let n = self.dependents.len();
        let mut in_degree = vec![0usize; n];
        for edges in &self.dependents {
            for &to in edges {
                in_degree[to] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut ordered = vec![false; n];
        let mut visited = 0;

        while let Some(node) = queue.pop_front() {
            ordered[node] = true;
            visited += 1;
            for &to in &self.dependents[node] {
                in_degree[to] -= 1;
                if in_degree[to] == 0 {
                    queue.push_back(to);
                }
            }
        }

        if visited == n {
            return Ok(());
        }

        let mut remaining: Vec<bool> = ordered.iter().map(|done| !done).collect();
        loop {
            let mut pruned = false;
            for node in 0..n {
                if remaining[node] && !self.dependents[node].iter().any(|&to| remaining[to]) {
                    remaining[node] = false;
                    pruned = true;
                }
            }
            if !pruned {
                break;
            }
        }

        let members = (0..n)
            .filter(|&i| remaining[i])
            .map(|i| definitions[i].id.clone())
            .collect();
        Err(CatalogError::DependencyCycle(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(defs: Vec<MetricDefinition>) -> Result<DependencyGraph, CatalogError> {
        let defs: Vec<Arc<MetricDefinition>> = defs.into_iter().map(Arc::new).collect();
        let index = defs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        DependencyGraph::build(&defs, &index)
    }

    #[test]
    fn test_dependents_in_registration_order() {
        let graph = build(vec![
            MetricDefinition::new("soc"),
            MetricDefinition::new("range").with_dependencies(&["soc"]),
            MetricDefinition::new("charge_time").with_dependencies(&["soc", "range"]),
        ])
        .unwrap();

        assert_eq!(graph.dependents(0), &[1, 2]);
        assert_eq!(graph.dependents(1), &[2]);
        assert!(graph.dependents(2).is_empty());
        assert!(graph.dependents(99).is_empty());
    }

    #[test]
    fn test_duplicate_dependency_is_single_edge() {
        let graph = build(vec![
            MetricDefinition::new("a"),
            MetricDefinition::new("b").with_dependencies(&["a", "a"]),
        ])
        .unwrap();
        assert_eq!(graph.dependents(0), &[1]);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = build(vec![MetricDefinition::new("range").with_dependencies(&["gids"])]).unwrap_err();
        assert_eq!(
            err,
            CatalogError::UnknownDependency {
                metric: "range".into(),
                dependency: "gids".into()
            }
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = build(vec![MetricDefinition::new("a").with_dependencies(&["a"])]).unwrap_err();
        assert_eq!(err, CatalogError::DependencyCycle(vec!["a".into()]));
    }

    #[test]
    fn test_cycle_reports_only_members() {
        let err = build(vec![
            MetricDefinition::new("root"),
            MetricDefinition::new("a").with_dependencies(&["root", "c"]),
            MetricDefinition::new("b").with_dependencies(&["a"]),
            MetricDefinition::new("c").with_dependencies(&["b"]),
            MetricDefinition::new("downstream").with_dependencies(&["c"]),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            CatalogError::DependencyCycle(vec!["a".into(), "b".into(), "c".into()])
        );
    }
}
