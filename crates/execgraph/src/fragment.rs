//! Execution fragments and their composition
//!
//! A fragment is a self-contained, acyclic subgraph of nodes. Every
//! dependency of every node resolves inside the fragment, so the entry set
//! is exactly the nodes without dependencies and the exit set is exactly
//! the nodes nothing depends on. Fragments are the unit of composition:
//! independent planners each return one, and [`merge`] and [`chain`]
//! combine them.

use crate::error::{GraphError, Result};
use crate::node::{ExecutionNode, NodeId};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// A validated acyclic subgraph with entry and exit sets.
///
/// The empty fragment is valid and means "nothing to do".
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    nodes: BTreeMap<NodeId, ExecutionNode>,
    entry: BTreeSet<NodeId>,
    exit: BTreeSet<NodeId>,
}

impl Fragment {
    /// The fragment with no nodes.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A fragment holding a single node.
    pub fn single(id: NodeId, node: ExecutionNode) -> Result<Self> {
        let mut builder = FragmentBuilder::new();
        builder.add(id, node)?;
        builder.build()
    }

    /// Validate a node map and compute its boundary sets.
    fn from_nodes(nodes: BTreeMap<NodeId, ExecutionNode>) -> Result<Self> {
        validate(&nodes)?;

        let mut depended_on = BTreeSet::new();
        for node in nodes.values() {
            depended_on.extend(node.dependencies().iter().cloned());
        }

        let entry: BTreeSet<NodeId> = nodes
            .iter()
            .filter(|(_, node)| node.dependencies().is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        let exit: BTreeSet<NodeId> = nodes
            .keys()
            .filter(|id| !depended_on.contains(*id))
            .cloned()
            .collect();

        if !nodes.is_empty() {
            if entry.is_empty() {
                return Err(GraphError::MissingBoundary {
                    nodes: nodes.len(),
                    boundary: "entry",
                });
            }
            if exit.is_empty() {
                return Err(GraphError::MissingBoundary {
                    nodes: nodes.len(),
                    boundary: "exit",
                });
            }
        }

        Ok(Self { nodes, entry, exit })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, id: &NodeId) -> Option<&ExecutionNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Iterate nodes in identifier order.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &ExecutionNode)> {
        self.nodes.iter()
    }

    /// Identifiers of every node.
    pub fn ids(&self) -> BTreeSet<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// Nodes without dependencies.
    pub fn entry_nodes(&self) -> &BTreeSet<NodeId> {
        &self.entry
    }

    /// Nodes no other node depends on.
    pub fn exit_nodes(&self) -> &BTreeSet<NodeId> {
        &self.exit
    }

    /// Reverse dependency map: node -> nodes that depend on it.
    pub fn dependents(&self) -> BTreeMap<NodeId, BTreeSet<NodeId>> {
        let mut dependents: BTreeMap<NodeId, BTreeSet<NodeId>> = self
            .nodes
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (id, node) in &self.nodes {
            for dep in node.dependencies() {
                dependents.entry(dep.clone()).or_default().insert(id.clone());
            }
        }
        dependents
    }

    /// Every node `id` transitively depends on.
    pub fn ancestors_of(&self, id: &NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&NodeId> = VecDeque::new();
        if let Some(node) = self.nodes.get(id) {
            queue.extend(node.dependencies());
        }
        while let Some(current) = queue.pop_front() {
            if seen.insert(current.clone())
                && let Some(node) = self.nodes.get(current)
            {
                queue.extend(node.dependencies());
            }
        }
        seen
    }

    /// Every node that transitively depends on `id`.
    pub fn descendants_of(&self, id: &NodeId) -> BTreeSet<NodeId> {
        let dependents = self.dependents();
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        if let Some(direct) = dependents.get(id) {
            queue.extend(direct.iter().cloned());
        }
        while let Some(current) = queue.pop_front() {
            if let Some(direct) = dependents.get(&current) {
                queue.extend(direct.iter().filter(|d| !seen.contains(*d)).cloned());
            }
            seen.insert(current);
        }
        seen
    }

    /// Identifiers in an order that respects every dependency.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let (graph, _) = dependency_graph(&self.nodes);
        match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(|idx| graph[idx].clone()).collect(),
            // Fragments are validated acyclic on construction
            Err(_) => self.nodes.keys().cloned().collect(),
        }
    }

    /// Merge another fragment into this one. See [`merge`].
    pub fn merge(self, other: Fragment) -> Result<Fragment> {
        merge(self, other)
    }

    /// Sequence another fragment after this one. See [`chain`].
    pub fn then(self, next: Fragment) -> Result<Fragment> {
        chain(self, next)
    }
}

/// Incremental construction of a fragment.
#[derive(Debug, Default)]
pub struct FragmentBuilder {
    nodes: BTreeMap<NodeId, ExecutionNode>,
}

impl FragmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, rejecting a second node with the same identifier.
    pub fn add(&mut self, id: NodeId, node: ExecutionNode) -> Result<&mut Self> {
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        self.nodes.insert(id, node);
        Ok(self)
    }

    /// Number of nodes added so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Validate and produce the fragment.
    pub fn build(self) -> Result<Fragment> {
        Fragment::from_nodes(self.nodes)
    }
}

/// Union two fragments.
///
/// Fails if both define the same identifier differently. Identical
/// duplicates (same payload identity, hosts and dependencies) are kept
/// once, which is how two planners requesting the same artifact end up
/// with a single download. Merging with an empty fragment returns the
/// other operand unchanged.
pub fn merge(a: Fragment, b: Fragment) -> Result<Fragment> {
    if b.is_empty() {
        return Ok(a);
    }
    if a.is_empty() {
        return Ok(b);
    }
    let nodes = union(a.nodes, b.nodes)?;
    Fragment::from_nodes(nodes)
}

/// Merge any number of fragments, left to right.
pub fn merge_all<I>(fragments: I) -> Result<Fragment>
where
    I: IntoIterator<Item = Fragment>,
{
    fragments
        .into_iter()
        .try_fold(Fragment::empty(), merge)
}

/// Sequence `next` after `first`.
///
/// Every entry node of `next` gains every exit node of `first` as a
/// dependency, then the two are merged. The result's entry set is
/// `first`'s (or `next`'s when `first` is empty) and its exit set is
/// `next`'s (or `first`'s when `next` is empty).
pub fn chain(first: Fragment, next: Fragment) -> Result<Fragment> {
    if first.is_empty() {
        return Ok(next);
    }
    if next.is_empty() {
        return Ok(first);
    }

    let Fragment {
        nodes: mut next_nodes,
        entry: next_entry,
        ..
    } = next;
    for id in &next_entry {
        if let Some(node) = next_nodes.get_mut(id) {
            node.add_dependencies(&first.exit);
        }
    }

    let nodes = union(first.nodes, next_nodes)?;
    Fragment::from_nodes(nodes)
}

/// Add dependency edges between nodes already in `fragment`.
///
/// Each pair is `(dependent, dependency)`. Both ends must exist, and the
/// result is validated again, so an edge that closes a cycle is rejected.
/// Boundary sets are recomputed: a dependent stops being an entry node and
/// a dependency stops being an exit node.
pub fn link<I>(fragment: Fragment, edges: I) -> Result<Fragment>
where
    I: IntoIterator<Item = (NodeId, NodeId)>,
{
    let mut nodes = fragment.nodes;
    for (dependent, dependency) in edges {
        if !nodes.contains_key(&dependency) {
            return Err(GraphError::UnknownNode(dependency));
        }
        let node = nodes
            .get_mut(&dependent)
            .ok_or_else(|| GraphError::UnknownNode(dependent.clone()))?;
        node.add_dependencies([&dependency]);
    }
    Fragment::from_nodes(nodes)
}

fn union(
    mut nodes: BTreeMap<NodeId, ExecutionNode>,
    other: BTreeMap<NodeId, ExecutionNode>,
) -> Result<BTreeMap<NodeId, ExecutionNode>> {
    for (id, node) in other {
        match nodes.get(&id) {
            Some(existing) if existing.same_decision(&node) => {
                log::debug!("Collapsing duplicate node {}", id);
            }
            Some(_) => return Err(GraphError::Collision { id }),
            None => {
                nodes.insert(id, node);
            }
        }
    }
    Ok(nodes)
}

fn validate(nodes: &BTreeMap<NodeId, ExecutionNode>) -> Result<()> {
    for (id, node) in nodes {
        if node.hosts().is_empty() {
            return Err(GraphError::NoHosts(id.clone()));
        }
        for dep in node.dependencies() {
            if !nodes.contains_key(dep) {
                return Err(GraphError::DanglingDependency {
                    node: id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let (graph, _) = dependency_graph(nodes);
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].clone()))
}

/// Graph with an edge from each dependency to its dependent.
fn dependency_graph(
    nodes: &BTreeMap<NodeId, ExecutionNode>,
) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
    let mut graph = DiGraph::with_capacity(nodes.len(), nodes.len());
    let mut index = HashMap::with_capacity(nodes.len());
    for id in nodes.keys() {
        index.insert(id.clone(), graph.add_node(id.clone()));
    }
    for (id, node) in nodes {
        for dep in node.dependencies() {
            if let (Some(from), Some(to)) = (index.get(dep), index.get(id)) {
                graph.add_edge(*from, *to, ());
            }
        }
    }
    (graph, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Noop;
    use crate::types::Host;

    fn control() -> Host {
        Host::local("control")
    }

    fn node(tag: &str) -> ExecutionNode {
        ExecutionNode::new(tag, Noop::new(tag), [control()])
    }

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    /// a -> b -> c, built under the given id prefix
    fn line(prefix: &str) -> Fragment {
        let a = id(&format!("{prefix}:a"));
        let b = id(&format!("{prefix}:b"));
        let c = id(&format!("{prefix}:c"));
        let mut builder = FragmentBuilder::new();
        builder.add(a.clone(), node(a.as_str())).unwrap();
        builder
            .add(b.clone(), node(b.as_str()).depends_on([a]))
            .unwrap();
        builder
            .add(c.clone(), node(c.as_str()).depends_on([b]))
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_empty_fragment_is_valid() {
        let fragment = FragmentBuilder::new().build().unwrap();
        assert!(fragment.is_empty());
        assert!(fragment.entry_nodes().is_empty());
        assert!(fragment.exit_nodes().is_empty());
    }

    #[test]
    fn test_boundaries_of_a_line() {
        let fragment = line("x");
        assert_eq!(fragment.len(), 3);
        assert_eq!(fragment.entry_nodes(), &BTreeSet::from([id("x:a")]));
        assert_eq!(fragment.exit_nodes(), &BTreeSet::from([id("x:c")]));
    }

    #[test]
    fn test_duplicate_id_in_builder_rejected() {
        let mut builder = FragmentBuilder::new();
        builder.add(id("a"), node("a")).unwrap();
        let err = builder.add(id("a"), node("a")).unwrap_err();
        assert_eq!(err, GraphError::DuplicateNode(id("a")));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let mut builder = FragmentBuilder::new();
        builder
            .add(id("b"), node("b").depends_on([id("missing")]))
            .unwrap();
        let err = builder.build().unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingDependency {
                node: id("b"),
                dependency: id("missing"),
            }
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let mut builder = FragmentBuilder::new();
        builder.add(id("a"), node("a").depends_on([id("b")])).unwrap();
        builder.add(id("b"), node("b").depends_on([id("a")])).unwrap();
        assert!(matches!(builder.build(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut builder = FragmentBuilder::new();
        builder.add(id("a"), node("a").depends_on([id("a")])).unwrap();
        assert!(matches!(builder.build(), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_node_without_hosts_rejected() {
        let mut builder = FragmentBuilder::new();
        builder
            .add(id("a"), ExecutionNode::new("a", Noop::new("a"), []))
            .unwrap();
        assert_eq!(builder.build().unwrap_err(), GraphError::NoHosts(id("a")));
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let fragment = line("x");
        let left = merge(Fragment::empty(), fragment.clone()).unwrap();
        let right = merge(fragment.clone(), Fragment::empty()).unwrap();
        for merged in [left, right] {
            assert_eq!(merged.ids(), fragment.ids());
            assert_eq!(merged.entry_nodes(), fragment.entry_nodes());
            assert_eq!(merged.exit_nodes(), fragment.exit_nodes());
        }
        assert!(merge(Fragment::empty(), Fragment::empty()).unwrap().is_empty());
    }

    #[test]
    fn test_merge_unions_boundaries() {
        let merged = merge(line("x"), line("y")).unwrap();
        assert_eq!(merged.len(), 6);
        assert_eq!(
            merged.entry_nodes(),
            &BTreeSet::from([id("x:a"), id("y:a")])
        );
        assert_eq!(merged.exit_nodes(), &BTreeSet::from([id("x:c"), id("y:c")]));
    }

    #[test]
    fn test_merge_is_associative() {
        let left = merge(merge(line("x"), line("y")).unwrap(), line("z")).unwrap();
        let right = merge(line("x"), merge(line("y"), line("z")).unwrap()).unwrap();
        assert_eq!(left.ids(), right.ids());
        assert_eq!(left.entry_nodes(), right.entry_nodes());
        assert_eq!(left.exit_nodes(), right.exit_nodes());
    }

    #[test]
    fn test_merge_collapses_identical_duplicates() {
        let merged = merge(line("x"), line("x")).unwrap();
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_merge_rejects_different_payload() {
        let a = Fragment::single(id("n"), node("one")).unwrap();
        let b = Fragment::single(id("n"), node("two")).unwrap();
        assert_eq!(
            merge(a, b).unwrap_err(),
            GraphError::Collision { id: id("n") }
        );
    }

    #[test]
    fn test_merge_rejects_different_hosts() {
        let a = Fragment::single(id("n"), node("n")).unwrap();
        let b = Fragment::single(
            id("n"),
            ExecutionNode::new("n", Noop::new("n"), [Host::new("node1", "10.0.0.1")]),
        )
        .unwrap();
        assert!(matches!(merge(a, b), Err(GraphError::Collision { .. })));
    }

    #[test]
    fn test_merge_rejects_different_dependencies() {
        let mut builder = FragmentBuilder::new();
        builder.add(id("dep"), node("dep")).unwrap();
        builder
            .add(id("n"), node("n").depends_on([id("dep")]))
            .unwrap();
        let with_dep = builder.build().unwrap();
        let without_dep = Fragment::single(id("n"), node("n")).unwrap();
        assert!(matches!(
            merge(with_dep, without_dep),
            Err(GraphError::Collision { .. })
        ));
    }

    #[test]
    fn test_shared_node_depended_on_by_other_operand_is_not_exit() {
        // Both planners need "shared"; only the second builds on it.
        let a = Fragment::single(id("shared"), node("shared")).unwrap();
        let mut builder = FragmentBuilder::new();
        builder.add(id("shared"), node("shared")).unwrap();
        builder
            .add(id("use"), node("use").depends_on([id("shared")]))
            .unwrap();
        let b = builder.build().unwrap();

        let merged = merge(a, b).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.entry_nodes(), &BTreeSet::from([id("shared")]));
        assert_eq!(merged.exit_nodes(), &BTreeSet::from([id("use")]));
    }

    #[test]
    fn test_chain_wires_exit_to_entry() {
        let chained = chain(line("x"), line("y")).unwrap();
        assert_eq!(chained.len(), 6);
        assert_eq!(chained.entry_nodes(), &BTreeSet::from([id("x:a")]));
        assert_eq!(chained.exit_nodes(), &BTreeSet::from([id("y:c")]));
        let y_a = chained.get(&id("y:a")).unwrap();
        assert!(y_a.dependencies().contains(&id("x:c")));
    }

    #[test]
    fn test_chain_with_empty_operands() {
        let fragment = line("x");
        assert_eq!(chain(Fragment::empty(), fragment.clone()).unwrap().ids(), fragment.ids());
        assert_eq!(chain(fragment.clone(), Fragment::empty()).unwrap().ids(), fragment.ids());
    }

    #[test]
    fn test_link_adds_edges_between_existing_nodes() {
        let fragment = merge(line("x"), line("y")).unwrap();
        let linked = link(fragment, [(id("y:a"), id("x:b"))]).unwrap();

        assert_eq!(linked.entry_nodes(), &BTreeSet::from([id("x:a")]));
        assert_eq!(linked.exit_nodes(), &BTreeSet::from([id("x:c"), id("y:c")]));
        assert!(linked.ancestors_of(&id("y:c")).contains(&id("x:a")));
    }

    #[test]
    fn test_link_rejects_unknown_nodes_and_cycles() {
        let err = link(line("x"), [(id("x:a"), id("nope"))]).unwrap_err();
        assert_eq!(err, GraphError::UnknownNode(id("nope")));

        let err = link(line("x"), [(id("nope"), id("x:a"))]).unwrap_err();
        assert_eq!(err, GraphError::UnknownNode(id("nope")));

        assert!(matches!(
            link(line("x"), [(id("x:a"), id("x:c"))]),
            Err(GraphError::Cycle(_))
        ));
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let fragment = chain(line("x"), merge(line("y"), line("z")).unwrap()).unwrap();
        let order = fragment.topological_order();
        assert_eq!(order.len(), fragment.len());
        let position: HashMap<_, _> = order.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        for (id, node) in fragment.nodes() {
            for dep in node.dependencies() {
                assert!(position[dep] < position[id], "{dep} must precede {id}");
            }
        }
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let fragment = line("x");
        assert_eq!(
            fragment.ancestors_of(&id("x:c")),
            BTreeSet::from([id("x:a"), id("x:b")])
        );
        assert_eq!(
            fragment.descendants_of(&id("x:a")),
            BTreeSet::from([id("x:b"), id("x:c")])
        );
        assert!(fragment.ancestors_of(&id("x:a")).is_empty());
    }

    #[test]
    fn test_merge_all_folds_left_to_right() {
        let merged = merge_all([line("x"), line("y"), Fragment::empty(), line("x")]).unwrap();
        assert_eq!(merged.len(), 6);
    }
}
