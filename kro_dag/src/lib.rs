//! Directed-acyclic graph over string ids.
//!
//! Deliberately minimal: the graphs this crate sorts top out at a few hundred
//! nodes (the children of one resource graph definition), so a `BTreeMap` of
//! `BTreeSet`s keeps the lexicographic tie-break required for deterministic
//! topological order without pulling in a general-purpose graph crate.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("node {0:?} already present")]
    DuplicateNode(String),
    #[error("edge references unknown node {0:?}")]
    UnknownNode(String),
    #[error("cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),
}

/// A directed-acyclic graph over `String` node ids.
///
/// Adjacency is kept in `BTreeMap`/`BTreeSet` so that iteration order is
/// always lexicographic by id, which is what makes `topological_sort`
/// deterministic across processes for the same input.
#[derive(Debug, Default, Clone)]
pub struct Dag {
    nodes: BTreeSet<String>,
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<String>) -> Result<(), DagError> {
        let id = id.into();
        if !self.nodes.insert(id.clone()) {
            return Err(DagError::DuplicateNode(id));
        }
        self.edges.entry(id).or_default();
        Ok(())
    }

    /// Adds an edge `from -> to`, meaning `from` depends on `to` (`to` must
    /// be processed first in topological order).
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), DagError> {
        if !self.nodes.contains(from) {
            return Err(DagError::UnknownNode(from.to_string()));
        }
        if !self.nodes.contains(to) {
            return Err(DagError::UnknownNode(to.to_string()));
        }
        self.edges.entry(from.to_string()).or_default().insert(to.to_string());
        Ok(())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.edges.get(id).into_iter().flat_map(|s| s.iter().map(String::as_str))
    }

    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Kahn's algorithm, processing the ready set in lexicographic order at
    /// every step so the overall order is reproducible regardless of
    /// insertion order.
    pub fn topological_sort(&self) -> Result<Vec<String>, DagError> {
        if let Some(cycle) = self.find_cycle() {
            return Err(DagError::CycleDetected(cycle));
        }

        // indegree[node] = number of not-yet-emitted dependencies `node` has.
        let mut indegree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.edges.get(n).map_or(0, BTreeSet::len)))
            .collect();

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        // dependents[id] = set of nodes whose edge list contains id
        let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (node, deps) in &self.edges {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().insert(node.as_str());
            }
        }

        while let Some(&id) = ready.iter().next() {
            ready.remove(id);
            order.push(id.to_string());
            if let Some(dependent_set) = dependents.get(id) {
                for &dependent in dependent_set {
                    let count = indegree.get_mut(dependent).expect("known node");
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            // find_cycle() above should have caught this; defensive only.
            return Err(DagError::CycleDetected(order));
        }
        Ok(order)
    }

    /// DFS-based cycle detection that reports the actual cycle as a path of
    /// ids, lexicographically picking the earliest offending start node.
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: BTreeMap<&str, Mark> =
            self.nodes.iter().map(|n| (n.as_str(), Mark::Unvisited)).collect();
        let mut stack: Vec<&str> = Vec::new();

        fn visit<'a>(
            id: &'a str,
            edges: &'a BTreeMap<String, BTreeSet<String>>,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(id) {
                Some(Mark::Done) => return None,
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|&n| n == id).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(id.to_string());
                    return Some(cycle);
                }
                _ => {}
            }
            marks.insert(id, Mark::InProgress);
            stack.push(id);
            if let Some(deps) = edges.get(id) {
                for dep in deps {
                    if let Some(cycle) = visit(dep.as_str(), edges, marks, stack) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            marks.insert(id, Mark::Done);
            None
        }

        for id in self.nodes.iter().map(String::as_str) {
            if marks.get(id) == Some(&Mark::Unvisited) {
                if let Some(cycle) = visit(id, &self.edges, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag(nodes: &[&str], edges: &[(&str, &str)]) -> Dag {
        let mut d = Dag::new();
        for n in nodes {
            d.add_node(*n).unwrap();
        }
        for (from, to) in edges {
            d.add_edge(from, to).unwrap();
        }
        d
    }

    #[test]
    fn toposort_covers_all_ids_and_respects_order() {
        let d = dag(&["c", "b", "a"], &[("b", "a"), ("c", "b")]);
        let order = d.topological_sort().unwrap();
        let mut ids: Vec<_> = order.clone();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn toposort_is_deterministic_lexicographic_tie_break() {
        let d = dag(&["z", "y", "x"], &[]);
        assert_eq!(d.topological_sort().unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn cycle_is_detected_and_reported() {
        let d = dag(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let err = d.topological_sort().unwrap_err();
        match err {
            DagError::CycleDetected(cycle) => {
                assert!(cycle.contains(&"a".to_string()));
                assert!(cycle.contains(&"b".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn add_edge_rejects_unknown_node() {
        let mut d = Dag::new();
        d.add_node("a").unwrap();
        assert_eq!(d.add_edge("a", "ghost"), Err(DagError::UnknownNode("ghost".into())));
    }

    #[test]
    fn duplicate_node_is_an_error() {
        let mut d = Dag::new();
        d.add_node("a").unwrap();
        assert_eq!(d.add_node("a"), Err(DagError::DuplicateNode("a".into())));
    }
}
