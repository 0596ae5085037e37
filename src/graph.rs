//! Generic dependency graph over ordered node identifiers.
//!
//! Nodes are stored once in a `petgraph` [`DiGraph`] and looked up through an
//! ordered index, so every query that returns nodes is deterministic: nodes
//! come back sorted, successors in the order their edges were first added.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::{Debug, Display, Write};

use camino::Utf8PathBuf;
use petgraph::algo::dijkstra;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{EdgeRef, Reversed};

use crate::error::{GraphError, StoreError};
use crate::store::{Store, StorePath};

/// Metadata attached to an edge. Adding an edge that already exists merges
/// the new property into the stored one, which by default simply overwrites.
pub trait EdgeProperty: Clone {
    fn merge(&mut self, other: Self) {
        *self = other;
    }
}

impl EdgeProperty for () {}

/// Edge annotated with the files that caused the dependency. Merging unions
/// the file sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileListEdge {
    pub files: BTreeSet<Utf8PathBuf>,
}

impl FileListEdge {
    pub fn new(files: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        Self {
            files: files.into_iter().collect(),
        }
    }
}

impl EdgeProperty for FileListEdge {
    fn merge(&mut self, other: Self) {
        self.files.extend(other.files);
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraph<N, E = ()> {
    graph: DiGraph<N, E>,
    index: BTreeMap<N, NodeIndex>,
}

impl<N, E> Default for DependencyGraph<N, E> {
    fn default() -> Self {
        Self {
            graph: DiGraph::new(),
            index: BTreeMap::new(),
        }
    }
}

impl<N, E> DependencyGraph<N, E>
where
    N: Ord + Clone + Debug,
    E: EdgeProperty,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_node(&mut self, node: &N) -> NodeIndex {
        if let Some(&index) = self.index.get(node) {
            return index;
        }

        let index = self.graph.add_node(node.clone());
        self.index.insert(node.clone(), index);
        index
    }

    fn lookup(&self, node: &N) -> Result<NodeIndex, GraphError> {
        self.index
            .get(node)
            .copied()
            .ok_or_else(|| GraphError::NodeNotFound(format!("{node:?}")))
    }

    /// Adds `from -> to`, creating missing nodes. An existing edge is left
    /// untouched.
    pub fn add_edge(&mut self, from: N, to: N)
    where
        E: Default,
    {
        let a = self.ensure_node(&from);
        let b = self.ensure_node(&to);

        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, E::default());
        }
    }

    /// Adds `from -> to` carrying `property`, merging it into the existing
    /// property when the edge is already present.
    pub fn add_edge_with(&mut self, from: N, to: N, property: E) {
        let a = self.ensure_node(&from);
        let b = self.ensure_node(&to);

        match self.graph.find_edge(a, b) {
            Some(edge) => self.graph[edge].merge(property),
            None => {
                self.graph.add_edge(a, b, property);
            }
        }
    }

    /// Outgoing edges of `index`, oldest first.
    fn successor_indices(&self, index: NodeIndex) -> Vec<NodeIndex> {
        // petgraph walks adjacency lists newest first
        let mut edges: Vec<_> = self
            .graph
            .edges(index)
            .map(|edge| (edge.id(), edge.target()))
            .collect();
        edges.sort_by_key(|(id, _)| *id);
        edges.into_iter().map(|(_, target)| target).collect()
    }

    pub fn get_successors(&self, node: &N) -> Result<Vec<N>, GraphError> {
        let index = self.lookup(node)?;

        Ok(self
            .successor_indices(index)
            .into_iter()
            .map(|succ| self.graph[succ].clone())
            .collect())
    }

    /// All nodes in ascending order.
    pub fn get_all_nodes(&self) -> Vec<N> {
        self.index.keys().cloned().collect()
    }

    pub fn has_node(&self, node: &N) -> bool {
        self.index.contains_key(node)
    }

    pub fn num_vertices(&self) -> usize {
        self.graph.node_count()
    }

    pub fn num_edges(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn get_edge_property(&self, from: &N, to: &N) -> Option<&E> {
        let a = self.index.get(from)?;
        let b = self.index.get(to)?;
        let edge = self.graph.find_edge(*a, *b)?;
        Some(&self.graph[edge])
    }

    /// Depth-first walk from `start` that always explores the successor
    /// closest to `target` first.
    ///
    /// Distances are computed once per call over the reversed graph. Ties keep
    /// edge insertion order, and successors that cannot reach `target` are
    /// never visited. Successors already on the current path are skipped, so
    /// the walk terminates on cyclic graphs.
    ///
    /// * `visit_node(node, depth)` returning `false` prunes the subtree below
    ///   `node` (the edge leading to it has already been reported).
    /// * `visit_edge(from, to, is_last, depth)` is called before descending
    ///   into `to`; `is_last` marks the final successor of `from`.
    /// * `should_stop(node)` returning `true` ends the whole walk.
    pub fn dfs_from_target(
        &self,
        start: &N,
        target: &N,
        mut visit_node: impl FnMut(&N, usize) -> bool,
        mut visit_edge: impl FnMut(&N, &N, bool, usize),
        mut should_stop: impl FnMut(&N) -> bool,
    ) -> Result<(), GraphError> {
        let start = self.lookup(start)?;
        let target = self.lookup(target)?;

        let distance: HashMap<NodeIndex, usize> =
            dijkstra(Reversed(&self.graph), target, None, |_| 1usize)
                .into_iter()
                .collect();

        let mut walk = Walk {
            graph: self,
            distance: &distance,
            on_path: HashSet::new(),
            visit_node: &mut visit_node,
            visit_edge: &mut visit_edge,
            should_stop: &mut should_stop,
        };

        walk.visit(start, 0);
        Ok(())
    }

    /// Every elementary cycle, each as the list of its nodes starting and
    /// ending at its earliest-inserted node.
    ///
    /// This is Johnson's algorithm: for each node `s` in insertion order, the
    /// circuits through `s` are enumerated inside the strongly connected
    /// component of `s` restricted to nodes not before `s`.
    pub fn find_cycles(&self) -> Vec<Vec<N>> {
        let mut cycles = Vec::new();

        for s in self.graph.node_indices() {
            let scc = self.component_from(s);
            if scc.len() == 1 && self.graph.find_edge(s, s).is_none() {
                continue;
            }

            let mut search = Circuits {
                graph: self,
                start: s,
                scc: &scc,
                stack: Vec::new(),
                blocked: HashSet::new(),
                block_map: HashMap::new(),
                found: &mut cycles,
            };
            search.circuit(s);
        }

        cycles
    }

    /// Nodes `>= s` that are both reachable from `s` and can reach `s`
    /// without passing through a node inserted before `s`.
    fn component_from(&self, s: NodeIndex) -> HashSet<NodeIndex> {
        let reach = |direction: petgraph::Direction| {
            let mut seen = HashSet::from([s]);
            let mut queue = vec![s];

            while let Some(node) = queue.pop() {
                for next in self.graph.neighbors_directed(node, direction) {
                    if next >= s && seen.insert(next) {
                        queue.push(next);
                    }
                }
            }

            seen
        };

        let forward = reach(petgraph::Direction::Outgoing);
        let backward = reach(petgraph::Direction::Incoming);
        forward.intersection(&backward).copied().collect()
    }
}

impl<N, E> DependencyGraph<N, E>
where
    N: Ord + Clone + Debug + Display,
    E: EdgeProperty,
{
    /// Draws the dependency chains from `start` to `target` as a tree.
    ///
    /// Without `all` only the first shortest chain is drawn. With `all` every
    /// chain is drawn, but each node's subtree is expanded only once.
    pub fn render_why_depends(
        &self,
        start: &N,
        target: &N,
        all: bool,
    ) -> Result<String, GraphError> {
        let mut out = format!("{start}\n");
        let mut tails: Vec<&'static str> = Vec::new();
        let mut expanded = BTreeSet::new();

        self.dfs_from_target(
            start,
            target,
            |node, _| {
                if !all {
                    return true;
                }
                node != target && expanded.insert(node.clone())
            },
            |_, to, is_last, depth| {
                // A single chain is always drawn with closing branches
                let is_last = is_last || !all;
                tails.truncate(depth);
                for tail in &tails {
                    out.push_str(tail);
                }

                let branch = if is_last { "└───" } else { "├───" };
                let _ = writeln!(out, "{branch}{to}");
                tails.push(if is_last { "    " } else { "│   " });
            },
            |node| !all && node == target,
        )?;

        Ok(out)
    }
}

impl DependencyGraph<StorePath> {
    /// The reference graph of a closure: one edge per (path, reference),
    /// self-references included.
    pub fn from_closure(
        store: &dyn Store,
        closure: &BTreeSet<StorePath>,
    ) -> Result<Self, StoreError> {
        let mut graph = Self::new();

        for path in closure {
            let info = store
                .query_path_info(path)?
                .ok_or_else(|| StoreError::NotValid(path.clone()))?;

            for reference in &info.references {
                graph.add_edge(path.clone(), reference.clone());
            }
        }

        Ok(graph)
    }
}

struct Walk<'a, N, E, VN, VE, SS> {
    graph: &'a DependencyGraph<N, E>,
    distance: &'a HashMap<NodeIndex, usize>,
    on_path: HashSet<NodeIndex>,
    visit_node: &'a mut VN,
    visit_edge: &'a mut VE,
    should_stop: &'a mut SS,
}

impl<N, E, VN, VE, SS> Walk<'_, N, E, VN, VE, SS>
where
    N: Ord + Clone + Debug,
    E: EdgeProperty,
    VN: FnMut(&N, usize) -> bool,
    VE: FnMut(&N, &N, bool, usize),
    SS: FnMut(&N) -> bool,
{
    /// Returns `true` once the walk has to stop.
    fn visit(&mut self, node: NodeIndex, depth: usize) -> bool {
        let graph = &self.graph.graph;

        if !(self.visit_node)(&graph[node], depth) {
            return false;
        }

        if (self.should_stop)(&graph[node]) {
            return true;
        }

        self.on_path.insert(node);

        let mut next: Vec<(usize, NodeIndex)> = self
            .graph
            .successor_indices(node)
            .into_iter()
            .filter(|succ| !self.on_path.contains(succ))
            .filter_map(|succ| self.distance.get(&succ).map(|&d| (d, succ)))
            .collect();
        next.sort_by_key(|(d, _)| *d);

        let last = next.len().saturating_sub(1);
        for (i, (_, succ)) in next.into_iter().enumerate() {
            (self.visit_edge)(&graph[node], &graph[succ], i == last, depth);

            if self.visit(succ, depth + 1) {
                return true;
            }
        }

        self.on_path.remove(&node);
        false
    }
}

struct Circuits<'a, N, E> {
    graph: &'a DependencyGraph<N, E>,
    start: NodeIndex,
    scc: &'a HashSet<NodeIndex>,
    stack: Vec<NodeIndex>,
    blocked: HashSet<NodeIndex>,
    block_map: HashMap<NodeIndex, HashSet<NodeIndex>>,
    found: &'a mut Vec<Vec<N>>,
}

impl<N, E> Circuits<'_, N, E>
where
    N: Ord + Clone + Debug,
    E: EdgeProperty,
{
    fn circuit(&mut self, v: NodeIndex) -> bool {
        let mut closed = false;
        self.stack.push(v);
        self.blocked.insert(v);

        let successors: Vec<_> = self
            .graph
            .successor_indices(v)
            .into_iter()
            .filter(|w| self.scc.contains(w))
            .collect();

        for &w in &successors {
            if w == self.start {
                let mut cycle: Vec<N> = self
                    .stack
                    .iter()
                    .map(|&i| self.graph.graph[i].clone())
                    .collect();
                cycle.push(self.graph.graph[w].clone());
                self.found.push(cycle);
                closed = true;
            } else if !self.blocked.contains(&w) && self.circuit(w) {
                closed = true;
            }
        }

        if closed {
            self.unblock(v);
        } else {
            for &w in &successors {
                self.block_map.entry(w).or_default().insert(v);
            }
        }

        self.stack.pop();
        closed
    }

    fn unblock(&mut self, u: NodeIndex) {
        self.blocked.remove(&u);

        if let Some(waiting) = self.block_map.remove(&u) {
            for w in waiting {
                if self.blocked.contains(&w) {
                    self.unblock(w);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&'static str, &'static str)]) -> DependencyGraph<&'static str> {
        let mut graph = DependencyGraph::new();
        for &(a, b) in edges {
            graph.add_edge(a, b);
        }
        graph
    }

    #[test]
    fn test_add_edge_is_idempotent() {
        let mut g = graph(&[("a", "b"), ("a", "c")]);
        let before = g.get_successors(&"a").unwrap();

        g.add_edge("a", "b");
        assert_eq!(g.get_successors(&"a").unwrap(), before);
        assert_eq!(before, vec!["b", "c"]);
        assert_eq!(g.num_vertices(), 3);
    }

    #[test]
    fn test_nodes_come_from_edges() {
        let g = graph(&[("c", "a"), ("b", "c")]);

        assert_eq!(g.get_all_nodes(), vec!["a", "b", "c"]);
        assert!(g.has_node(&"a"));
        assert!(!g.has_node(&"z"));
    }

    #[test]
    fn test_unknown_node_is_an_error() {
        let g = graph(&[("a", "b")]);

        assert_eq!(
            g.get_successors(&"z"),
            Err(GraphError::NodeNotFound("\"z\"".into()))
        );
        assert!(g.dfs_from_target(&"a", &"z", |_, _| true, |_, _, _, _| {}, |_| false).is_err());
    }

    #[test]
    fn test_file_list_edges_merge() {
        let mut g: DependencyGraph<&str, FileListEdge> = DependencyGraph::new();
        g.add_edge_with("a", "b", FileListEdge::new(["x".into()]));
        g.add_edge_with("a", "b", FileListEdge::new(["y".into(), "x".into()]));

        let files = &g.get_edge_property(&"a", &"b").unwrap().files;
        assert_eq!(files.len(), 2);
        assert_eq!(g.get_successors(&"a").unwrap(), vec!["b"]);
    }

    #[test]
    fn test_plain_properties_overwrite() {
        #[derive(Debug, Clone, PartialEq)]
        struct Weight(u32);
        impl EdgeProperty for Weight {}

        let mut g: DependencyGraph<&str, Weight> = DependencyGraph::new();
        g.add_edge_with("a", "b", Weight(1));
        g.add_edge_with("a", "b", Weight(5));

        assert_eq!(g.get_edge_property(&"a", &"b"), Some(&Weight(5)));
        assert_eq!(g.get_edge_property(&"b", &"a"), None);
    }

    #[test]
    fn test_find_cycles_basic() {
        assert_eq!(graph(&[("a", "b"), ("b", "a")]).find_cycles(), vec![vec!["a", "b", "a"]]);
        assert_eq!(
            graph(&[("a", "b"), ("b", "c"), ("c", "a")]).find_cycles(),
            vec![vec!["a", "b", "c", "a"]]
        );
        assert!(graph(&[("a", "b")]).find_cycles().is_empty());
        assert_eq!(graph(&[("a", "a")]).find_cycles(), vec![vec!["a", "a"]]);
    }

    #[test]
    fn test_find_cycles_disjoint() {
        let g = graph(&[("a", "b"), ("b", "a"), ("c", "d"), ("d", "c"), ("b", "c")]);

        assert_eq!(g.find_cycles(), vec![vec!["a", "b", "a"], vec!["c", "d", "c"]]);
    }

    #[test]
    fn test_find_cycles_overlapping() {
        // Two cycles sharing the edge a -> b
        let g = graph(&[("a", "b"), ("b", "a"), ("b", "c"), ("c", "a")]);

        assert_eq!(
            g.find_cycles(),
            vec![vec!["a", "b", "a"], vec!["a", "b", "c", "a"]]
        );
    }

    #[test]
    fn test_dfs_prefers_shortest_route() {
        // a reaches d either directly through b, or the long way through c
        let g = graph(&[("a", "c"), ("a", "b"), ("c", "e"), ("e", "d"), ("b", "d")]);
        let mut path = Vec::new();

        g.dfs_from_target(
            &"a",
            &"d",
            |node, _| {
                path.push(*node);
                true
            },
            |_, _, _, _| {},
            |node| *node == "d",
        )
        .unwrap();

        assert_eq!(path, vec!["a", "b", "d"]);
    }

    #[test]
    fn test_dfs_ties_keep_insertion_order() {
        let g = graph(&[("a", "c"), ("a", "b"), ("c", "t"), ("b", "t")]);
        let mut edges = Vec::new();

        g.dfs_from_target(
            &"a",
            &"t",
            |_, _| true,
            |from, to, last, depth| edges.push((*from, *to, last, depth)),
            |_| false,
        )
        .unwrap();

        assert_eq!(
            edges,
            vec![
                ("a", "c", false, 0),
                ("c", "t", true, 1),
                ("a", "b", true, 0),
                ("b", "t", true, 1),
            ]
        );
    }

    #[test]
    fn test_dfs_skips_unreachable_and_pruned() {
        let g = graph(&[("a", "x"), ("a", "b"), ("b", "c"), ("c", "t")]);
        let mut nodes = Vec::new();
        let mut edges = Vec::new();

        g.dfs_from_target(
            &"a",
            &"t",
            |node, _| {
                nodes.push(*node);
                *node != "c"
            },
            |from, to, _, _| edges.push((*from, *to)),
            |_| false,
        )
        .unwrap();

        // x cannot reach t, c's subtree is pruned but the edge into it is reported
        assert_eq!(nodes, vec!["a", "b", "c"]);
        assert_eq!(edges, vec![("a", "b"), ("b", "c")]);
    }

    #[test]
    fn test_dfs_terminates_on_cycles() {
        let g = graph(&[("a", "b"), ("b", "a"), ("b", "t")]);
        let mut count = 0;

        g.dfs_from_target(&"a", &"t", |_, _| { count += 1; true }, |_, _, _, _| {}, |_| false)
            .unwrap();

        assert_eq!(count, 3);
    }

    #[test]
    fn test_from_closure() {
        use crate::store::{LocalStore, compute_closure};

        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let store = LocalStore::open(&root).unwrap();

        let libc = store.add_text("libc", "libc", []).unwrap();
        let lib = store.add_text("lib", "lib", [libc.clone()]).unwrap();
        let app = store.add_text("app", "app", [lib.clone(), libc.clone()]).unwrap();

        // Outputs that mention their own path refer to themselves
        let mut info = store.query_path_info(&app).unwrap().unwrap();
        info.references.insert(app.clone());
        store.register_valid_path(info).unwrap();

        let closure = compute_closure(&store, [app.clone()]).unwrap();
        let g = DependencyGraph::from_closure(&store, &closure).unwrap();

        assert_eq!(g.num_vertices(), 3);
        assert_eq!(g.num_edges(), 4);
        let successors: BTreeSet<_> = g.get_successors(&app).unwrap().into_iter().collect();
        assert_eq!(successors, BTreeSet::from([lib.clone(), libc.clone(), app.clone()]));
        assert_eq!(g.get_successors(&lib).unwrap(), vec![libc.clone()]);
        assert!(g.get_successors(&libc).unwrap().is_empty());

        // The self-reference is the only cycle, reported as a self-loop
        assert_eq!(g.find_cycles(), vec![vec![app.clone(), app]]);
    }

    #[test]
    fn test_why_depends_first_path() {
        let g = graph(&[("app", "lib"), ("app", "tool"), ("lib", "libc"), ("tool", "lib")]);

        let tree = g.render_why_depends(&"app", &"libc", false).unwrap();
        assert_eq!(tree, "app\n└───lib\n    └───libc\n");
    }

    #[test]
    fn test_why_depends_all_paths() {
        let g = graph(&[("app", "lib"), ("app", "tool"), ("lib", "libc"), ("tool", "lib")]);

        let tree = g.render_why_depends(&"app", &"libc", true).unwrap();
        assert_eq!(
            tree,
            "app\n├───lib\n│   └───libc\n└───tool\n    └───lib\n"
        );
    }
}
