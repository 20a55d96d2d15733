//! Dependency graph analysis.
//!
//! Builds the task graph from declared dependencies plus branch edges
//! (owner -> target), then reports missing dependencies, cycles, roots and
//! reachability. Kahn's algorithm yields the topological order; the nodes
//! it cannot visit are narrowed to exactly those on cycles with
//! `petgraph::algo::tarjan_scc`.

use std::collections::{BTreeSet, HashMap, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use weaver_types::workflow::TaskDefinition;

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Task graph indexed by definition position.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    upstream: Vec<Vec<usize>>,
    downstream: Vec<Vec<usize>>,
    missing: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph. Unknown dependency names are recorded, not dropped.
    pub fn build(tasks: &[TaskDefinition]) -> Self {
        let names: Vec<String> = tasks.iter().map(|t| t.name.clone()).collect();
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, name) in names.iter().enumerate() {
            index.entry(name.clone()).or_insert(i);
        }

        let mut graph = Self {
            names,
            index,
            upstream: vec![Vec::new(); tasks.len()],
            downstream: vec![Vec::new(); tasks.len()],
            missing: Vec::new(),
        };

        for (to, task) in tasks.iter().enumerate() {
            for dep in &task.dependencies {
                match graph.index.get(dep).copied() {
                    Some(from) => graph.add_edge(from, to),
                    None => {
                        if !graph.missing.contains(dep) {
                            graph.missing.push(dep.clone());
                        }
                    }
                }
            }
        }

        // The owner must finish before any target of its branches.
        for (from, task) in tasks.iter().enumerate() {
            for branch in &task.conditional_branches {
                if let Some(to) = graph.index.get(&branch.task_name).copied() {
                    graph.add_edge(from, to);
                }
            }
        }

        graph
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        if !self.upstream[to].contains(&from) {
            self.upstream[to].push(from);
            self.downstream[from].push(to);
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Direct upstream tasks (dependencies and branch owners).
    pub fn upstream(&self, idx: usize) -> &[usize] {
        &self.upstream[idx]
    }

    /// Direct downstream tasks.
    pub fn downstream(&self, idx: usize) -> &[usize] {
        &self.downstream[idx]
    }

    /// Every task `idx` transitively depends on.
    pub fn ancestors(&self, idx: usize) -> BTreeSet<usize> {
        self.closure(idx, &self.upstream)
    }

    /// Every task that transitively depends on `idx`.
    pub fn descendants(&self, idx: usize) -> BTreeSet<usize> {
        self.closure(idx, &self.downstream)
    }

    fn closure(&self, idx: usize, edges: &[Vec<usize>]) -> BTreeSet<usize> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![idx];
        while let Some(current) = stack.pop() {
            for &next in &edges[current] {
                if visited.insert(next) {
                    stack.push(next);
                }
            }
        }
        visited
    }

    /// Run the full analysis.
    pub fn analyze(&self) -> DagReport {
        let n = self.len();

        // Kahn's algorithm; ties go to the earliest task in definition order.
        let mut in_degree: Vec<usize> = self.upstream.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &next in &self.downstream[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        let cyclic = order.len() < n;
        let cyclic_nodes = if cyclic {
            let visited: BTreeSet<usize> = order.iter().copied().collect();
            let remainder: Vec<usize> = (0..n).filter(|i| !visited.contains(i)).collect();
            self.cycle_members(&remainder)
        } else {
            Vec::new()
        };

        let roots: Vec<usize> = (0..n).filter(|&i| self.upstream[i].is_empty()).collect();

        let mut reached = vec![false; n];
        let mut queue: VecDeque<usize> = roots.iter().copied().collect();
        for &root in &roots {
            reached[root] = true;
        }
        while let Some(node) = queue.pop_front() {
            for &next in &self.downstream[node] {
                if !reached[next] {
                    reached[next] = true;
                    queue.push_back(next);
                }
            }
        }

        DagReport {
            missing_dependencies: self.missing.clone(),
            cyclic,
            cyclic_nodes: cyclic_nodes.iter().map(|&i| self.names[i].clone()).collect(),
            roots_exist: !roots.is_empty(),
            roots: roots.iter().map(|&i| self.names[i].clone()).collect(),
            unreachable: (0..n)
                .filter(|&i| !reached[i])
                .map(|i| self.names[i].clone())
                .collect(),
            topological_order: order.iter().map(|&i| self.names[i].clone()).collect(),
        }
    }

    /// Strongly connected components of the remainder that actually form cycles.
    fn cycle_members(&self, remainder: &[usize]) -> Vec<usize> {
        let mut sub = DiGraph::<usize, ()>::new();
        let nodes: HashMap<usize, _> = remainder.iter().map(|&i| (i, sub.add_node(i))).collect();
        for &from in remainder {
            for to in &self.downstream[from] {
                if let Some(&target) = nodes.get(to) {
                    sub.add_edge(nodes[&from], target, ());
                }
            }
        }

        let mut members: Vec<usize> = tarjan_scc(&sub)
            .into_iter()
            .filter(|scc| scc.len() > 1 || sub.contains_edge(scc[0], scc[0]))
            .flatten()
            .map(|node| sub[node])
            .collect();
        members.sort_unstable();
        members
    }
}

// ---------------------------------------------------------------------------
// DagReport
// ---------------------------------------------------------------------------

/// Outcome of graph analysis. All name lists are in definition order except
/// `topological_order`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagReport {
    pub missing_dependencies: Vec<String>,
    pub cyclic: bool,
    /// Exactly the tasks that lie on a cycle.
    pub cyclic_nodes: Vec<String>,
    pub roots_exist: bool,
    pub roots: Vec<String>,
    /// Tasks no root reaches.
    pub unreachable: Vec<String>,
    /// Complete only when the graph is acyclic.
    pub topological_order: Vec<String>,
}

impl DagReport {
    pub fn is_valid(&self) -> bool {
        self.missing_dependencies.is_empty()
            && !self.cyclic
            && self.roots_exist
            && self.unreachable.is_empty()
    }

    /// Convert the first violation into a `WorkflowError`.
    pub fn ensure_valid(self) -> Result<Self, WorkflowError> {
        if !self.missing_dependencies.is_empty() {
            return Err(WorkflowError::UnknownDependency(format!(
                "unknown task(s) referenced as dependencies: {}",
                self.missing_dependencies.join(", ")
            )));
        }
        if self.cyclic {
            return Err(WorkflowError::CycleDetected(format!(
                "tasks on a cycle: {}",
                self.cyclic_nodes.join(", ")
            )));
        }
        if !self.roots_exist {
            return Err(WorkflowError::ValidationError(
                "workflow has no root task".to_string(),
            ));
        }
        if !self.unreachable.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "tasks not reachable from any root: {}",
                self.unreachable.join(", ")
            )));
        }
        Ok(self)
    }
}

/// Build and analyze in one step.
pub fn validate(tasks: &[TaskDefinition]) -> DagReport {
    DependencyGraph::build(tasks).analyze()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
