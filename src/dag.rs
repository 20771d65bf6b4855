use crate::error::{Error, Result};
use crate::ids::NodeFqn;
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinSet;

/// A node that can participate in a dependency DAG.
pub trait GraphNode: Send + Sync {
    fn fqn(&self) -> NodeFqn;
    fn depends_on(&self) -> Vec<NodeFqn>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    Serial,
    Parallel,
}

pub type NodeFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

#[derive(Debug)]
enum Slot<N> {
    /// Synthetic entry point; every otherwise-unreferenced node hangs off
    /// it so the graph is weakly connected.
    Root,
    Node(Arc<N>),
}

/// Directed acyclic dependency graph over the jobs of a build or the
/// steps of a job.
///
/// Construction validates the edge set (same-workflow dangling
/// dependencies are an error, cross-workflow ones are deferred), rejects
/// cycles, and applies a transitive reduction so walks traverse the
/// unique minimal edge set.
#[derive(Debug)]
pub struct Dag<N> {
    graph: StableDiGraph<Slot<N>, ()>,
    root: NodeIndex,
    by_fqn: HashMap<NodeFqn, NodeIndex>,
}

impl<N: GraphNode> Dag<N> {
    pub fn build(nodes: Vec<N>) -> Result<Self> {
        Self::build_from_arcs(nodes.into_iter().map(Arc::new).collect())
    }

    fn build_from_arcs(nodes: Vec<Arc<N>>) -> Result<Self> {
        let mut graph = StableDiGraph::new();
        let root = graph.add_node(Slot::Root);
        let mut by_fqn: HashMap<NodeFqn, NodeIndex> = HashMap::new();
        let mut errors: Vec<Error> = Vec::new();

        for node in nodes {
            let fqn = node.fqn();
            if by_fqn.contains_key(&fqn) {
                errors.push(Error::validation(format!("duplicate node {fqn}")));
                continue;
            }
            let idx = graph.add_node(Slot::Node(node));
            by_fqn.insert(fqn, idx);
        }

        let indices: Vec<NodeIndex> = by_fqn.values().copied().collect();
        for &idx in &indices {
            let (fqn, deps) = match &graph[idx] {
                Slot::Node(n) => (n.fqn(), n.depends_on()),
                Slot::Root => continue,
            };
            let mut edge_seen = HashSet::new();
            for dep in deps {
                match by_fqn.get(&dep) {
                    Some(&dep_idx) => {
                        if edge_seen.insert(dep_idx) {
                            graph.add_edge(dep_idx, idx, ());
                        }
                    }
                    // A dangling target declared in the same workflow is a
                    // definition error. Cross-workflow targets may not be
                    // materialized yet: deferred, resolved at job-add time.
                    None if dep.workflow == fqn.workflow => {
                        errors.push(Error::validation(format!(
                            "node {fqn} depends on unknown node {dep}"
                        )));
                    }
                    None => {}
                }
            }
        }

        if let Some(err) = Error::combine(errors) {
            return Err(err);
        }

        for &idx in &indices {
            if graph
                .neighbors_directed(idx, Direction::Incoming)
                .next()
                .is_none()
            {
                graph.add_edge(root, idx, ());
            }
        }

        if toposort(&graph, None).is_err() {
            return Err(Error::CycleDetected(
                "dependency graph contains a cycle".to_string(),
            ));
        }

        let mut dag = Self {
            graph,
            root,
            by_fqn,
        };
        dag.transitive_reduce();
        Ok(dag)
    }

    /// Remove every edge u→w for which a longer path u→…→w exists. For a
    /// DAG this yields the unique minimal edge set.
    fn transitive_reduce(&mut self) {
        let edges: Vec<(NodeIndex, NodeIndex)> = self
            .graph
            .edge_indices()
            .map(|e| self.graph.edge_endpoints(e).expect("edge endpoints"))
            .collect();

        for (u, v) in edges {
            if u == self.root {
                continue;
            }
            let redundant = self
                .graph
                .neighbors_directed(u, Direction::Outgoing)
                .filter(|&w| w != v)
                .any(|w| self.reaches(w, v));
            if redundant {
                if let Some(e) = self.graph.find_edge(u, v) {
                    self.graph.remove_edge(e);
                }
            }
        }
    }

    fn reaches(&self, from: NodeIndex, to: NodeIndex) -> bool {
        let mut dfs = Dfs::new(&self.graph, from);
        while let Some(nx) = dfs.next(&self.graph) {
            if nx == to {
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.graph.node_count() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, fqn: &NodeFqn) -> bool {
        self.by_fqn.contains_key(fqn)
    }

    pub fn node(&self, fqn: &NodeFqn) -> Option<Arc<N>> {
        self.by_fqn.get(fqn).map(|&idx| self.arc_at(idx))
    }

    /// All nodes, in a stable insertion-derived order.
    pub fn nodes(&self) -> Vec<Arc<N>> {
        let mut indices: Vec<NodeIndex> = self.by_fqn.values().copied().collect();
        indices.sort();
        indices.into_iter().map(|idx| self.arc_at(idx)).collect()
    }

    fn arc_at(&self, idx: NodeIndex) -> Arc<N> {
        match &self.graph[idx] {
            Slot::Node(n) => Arc::clone(n),
            Slot::Root => unreachable!("root is never exposed"),
        }
    }

    fn closure(&self, fqn: &NodeFqn, dir: Direction) -> Result<Vec<Arc<N>>> {
        let &start = self
            .by_fqn
            .get(fqn)
            .ok_or_else(|| Error::not_found(format!("node {fqn}")))?;
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for next in self.graph.neighbors_directed(idx, dir) {
                if next == self.root || !seen.insert(next) {
                    continue;
                }
                out.push(self.arc_at(next));
                stack.push(next);
            }
        }
        Ok(out)
    }

    /// Transitive in-closure of `fqn`, excluding root and `fqn` itself.
    pub fn ancestors(&self, fqn: &NodeFqn) -> Result<Vec<Arc<N>>> {
        self.closure(fqn, Direction::Incoming)
    }

    /// Transitive out-closure of `fqn`, excluding `fqn` itself.
    pub fn descendants(&self, fqn: &NodeFqn) -> Result<Vec<Arc<N>>> {
        self.closure(fqn, Direction::Outgoing)
    }

    /// The sub-DAG of every node in `keep` plus everything upstream of it.
    pub fn trim(&self, keep: &[NodeFqn]) -> Result<Dag<N>> {
        if keep.is_empty() {
            return Err(Error::InvalidArgument(
                "trim requires at least one node to keep".to_string(),
            ));
        }
        let mut kept: HashSet<NodeFqn> = HashSet::new();
        for fqn in keep {
            if !self.contains(fqn) {
                return Err(Error::not_found(format!("node {fqn}")));
            }
            kept.insert(fqn.clone());
            for anc in self.ancestors(fqn)? {
                kept.insert(anc.fqn());
            }
        }
        let nodes: Vec<Arc<N>> = self
            .nodes()
            .into_iter()
            .filter(|n| kept.contains(&n.fqn()))
            .collect();
        Self::build_from_arcs(nodes)
    }
}

impl<N: GraphNode + 'static> Dag<N> {
    /// Visit every non-root node exactly once, each only after all of its
    /// in-neighbours have been visited.
    ///
    /// Serial mode aborts on the first callback error and returns it
    /// alone; remaining nodes are not visited. Parallel mode runs ready
    /// nodes concurrently, always visits every node, and returns all
    /// callback errors as one composite.
    pub async fn walk<F>(&self, mode: Parallelism, f: F) -> Result<()>
    where
        F: Fn(Arc<N>) -> NodeFuture + Send + Sync + 'static,
    {
        match mode {
            Parallelism::Serial => self.walk_serial(f).await,
            Parallelism::Parallel => self.walk_parallel(f).await,
        }
    }

    async fn walk_serial<F>(&self, f: F) -> Result<()>
    where
        F: Fn(Arc<N>) -> NodeFuture + Send + Sync + 'static,
    {
        let order = toposort(&self.graph, None)
            .map_err(|_| Error::CycleDetected("dependency graph contains a cycle".to_string()))?;
        for idx in order {
            if idx == self.root {
                continue;
            }
            f(self.arc_at(idx)).await?;
        }
        Ok(())
    }

    async fn walk_parallel<F>(&self, f: F) -> Result<()>
    where
        F: Fn(Arc<N>) -> NodeFuture + Send + Sync + 'static,
    {
        let mut indegree: HashMap<NodeIndex, usize> = HashMap::new();
        for &idx in self.by_fqn.values() {
            indegree.insert(
                idx,
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .filter(|&p| p != self.root)
                    .count(),
            );
        }

        let mut tasks: JoinSet<(NodeIndex, Result<()>)> = JoinSet::new();
        let mut spawn_ready = |tasks: &mut JoinSet<(NodeIndex, Result<()>)>,
                               indegree: &mut HashMap<NodeIndex, usize>| {
            let ready: Vec<NodeIndex> = indegree
                .iter()
                .filter(|(_, &deg)| deg == 0)
                .map(|(&idx, _)| idx)
                .collect();
            for idx in ready {
                indegree.remove(&idx);
                let fut = f(self.arc_at(idx));
                tasks.spawn(async move { (idx, fut.await) });
            }
        };

        spawn_ready(&mut tasks, &mut indegree);

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (done, result) = match joined {
                Ok(pair) => pair,
                Err(e) => return Err(Error::internal(format!("walk task panicked: {e}"))),
            };
            if let Err(e) = result {
                errors.push(e);
            }
            for child in self.graph.neighbors_directed(done, Direction::Outgoing) {
                if let Some(deg) = indegree.get_mut(&child) {
                    *deg = deg.saturating_sub(1);
                }
            }
            spawn_ready(&mut tasks, &mut indegree);
        }

        match Error::combine(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
