//! Pipeline graph structure using daggy.

use crate::error::{Error, Result};
use crate::node::{FormatConstraint, NodeKind, Port, PortDirection, PortList, ProcessingNode};
use daggy::petgraph::Direction;
use daggy::{Dag, NodeIndex, Walker};
use std::fmt;

/// Unique identifier for a node in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) NodeIndex);

impl NodeId {
    /// Get the underlying index.
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// A node in the pipeline graph.
pub struct Node<N> {
    inner: N,
    inputs: PortList,
    outputs: PortList,
    released: bool,
}

impl<N: ProcessingNode> Node<N> {
    fn new(inner: N) -> Self {
        let (inputs, outputs) = inner
            .kind()
            .always_ports()
            .into_iter()
            .partition(Port::is_input);
        Self {
            inner,
            inputs,
            outputs,
            released: false,
        }
    }

    /// The node's name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// The node's kind.
    pub fn kind(&self) -> NodeKind {
        self.inner.kind()
    }

    /// The runtime node.
    pub fn inner(&self) -> &N {
        &self.inner
    }

    /// The runtime node, mutably.
    pub fn inner_mut(&mut self) -> &mut N {
        &mut self.inner
    }

    /// Input ports.
    pub fn inputs(&self) -> &[Port] {
        &self.inputs
    }

    /// Output ports.
    pub fn outputs(&self) -> &[Port] {
        &self.outputs
    }

    /// Whether [`ProcessingNode::release`] has been called.
    pub fn is_released(&self) -> bool {
        self.released
    }

    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.inner.release();
        true
    }
}

impl<N: ProcessingNode> fmt::Debug for Node<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

/// A link between two nodes in the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Name of the upstream (output) port.
    pub src_port: String,
    /// Name of the downstream (input) port.
    pub sink_port: String,
    /// Restriction on frames crossing this link.
    pub constraint: Option<FormatConstraint>,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            src_port: "src".to_string(),
            sink_port: "sink".to_string(),
            constraint: None,
        }
    }
}

impl Link {
    /// Create a link between the default `src` and `sink` ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a link with specific port names.
    pub fn with_ports(src_port: impl Into<String>, sink_port: impl Into<String>) -> Self {
        Self {
            src_port: src_port.into(),
            sink_port: sink_port.into(),
            constraint: None,
        }
    }

    /// Attach a format constraint.
    pub fn constrained(mut self, constraint: FormatConstraint) -> Self {
        self.constraint = Some(constraint);
        self
    }
}

/// Processing graph represented as a directed acyclic graph.
///
/// Nodes are owned by the graph from the moment they are added, so a
/// partially built graph can always be released as a whole. Dropping the
/// graph releases whatever is still held.
pub struct PipelineGraph<N: ProcessingNode> {
    graph: Dag<Node<N>, Link>,
}

impl<N: ProcessingNode> PipelineGraph<N> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self { graph: Dag::new() }
    }

    /// Take ownership of a runtime node. Returns its ID for linking.
    pub fn add_node(&mut self, node: N) -> NodeId {
        NodeId(self.graph.add_node(Node::new(node)))
    }

    /// Get a node by ID.
    pub fn get_node(&self, id: NodeId) -> Option<&Node<N>> {
        self.graph.node_weight(id.0)
    }

    /// Get a mutable reference to a node by ID.
    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node<N>> {
        self.graph.node_weight_mut(id.0)
    }

    /// All node IDs in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.graph.graph().node_indices().map(NodeId)
    }

    /// Ask a splitter or compositor for a new port and record it.
    pub fn request_port(&mut self, id: NodeId, direction: PortDirection) -> Result<String> {
        let node = self
            .graph
            .node_weight_mut(id.0)
            .ok_or_else(|| Error::link("?", "?", "node not found"))?;
        let name = node.inner.request_port(direction)?;
        let port = Port::new(name.clone(), direction);
        match direction {
            PortDirection::Input => node.inputs.push(port),
            PortDirection::Output => node.outputs.push(port),
        }
        Ok(name)
    }

    /// Link two nodes through named ports.
    ///
    /// Both ports must exist and be unused; the link must not close a cycle.
    pub fn link_ports(&mut self, src: NodeId, sink: NodeId, link: Link) -> Result<()> {
        let src_node = self
            .get_node(src)
            .ok_or_else(|| Error::link("?", "?", "source node not found"))?;
        let sink_node = self
            .get_node(sink)
            .ok_or_else(|| Error::link(src_node.name(), "?", "sink node not found"))?;
        let (from, to) = (src_node.name().to_string(), sink_node.name().to_string());

        if !src_node.outputs.iter().any(|p| p.name() == link.src_port) {
            return Err(Error::link(
                from,
                to,
                format!("no output port '{}'", link.src_port),
            ));
        }
        if !sink_node.inputs.iter().any(|p| p.name() == link.sink_port) {
            return Err(Error::link(
                from,
                to,
                format!("no input port '{}'", link.sink_port),
            ));
        }
        if self.children(src).iter().any(|(_, l)| l.src_port == link.src_port) {
            return Err(Error::link(
                from,
                to,
                format!("output port '{}' is already linked", link.src_port),
            ));
        }
        if self.parents(sink).iter().any(|(_, l)| l.sink_port == link.sink_port) {
            return Err(Error::link(
                from,
                to,
                format!("input port '{}' is already linked", link.sink_port),
            ));
        }

        // daggy rejects cycles
        self.graph
            .add_edge(src.0, sink.0, link)
            .map_err(|_| Error::link(from, to, "linking would create a cycle"))?;
        Ok(())
    }

    /// Link through the default `src`/`sink` ports.
    pub fn link(&mut self, src: NodeId, sink: NodeId) -> Result<()> {
        self.link_ports(src, sink, Link::new())
    }

    /// Nodes with no incoming edges.
    pub fn sources(&self) -> Vec<NodeId> {
        self.boundary(Direction::Incoming)
    }

    /// Nodes with no outgoing edges.
    pub fn sinks(&self) -> Vec<NodeId> {
        self.boundary(Direction::Outgoing)
    }

    fn boundary(&self, direction: Direction) -> Vec<NodeId> {
        let g = self.graph.graph();
        g.node_indices()
            .filter(|&idx| g.neighbors_directed(idx, direction).next().is_none())
            .map(NodeId)
            .collect()
    }

    /// Downstream nodes of a node with the connecting links.
    pub fn children(&self, id: NodeId) -> Vec<(NodeId, &Link)> {
        self.graph
            .children(id.0)
            .iter(&self.graph)
            .filter_map(|(edge, node)| Some((NodeId(node), self.graph.edge_weight(edge)?)))
            .collect()
    }

    /// Upstream nodes of a node with the connecting links.
    pub fn parents(&self, id: NodeId) -> Vec<(NodeId, &Link)> {
        self.graph
            .parents(id.0)
            .iter(&self.graph)
            .filter_map(|(edge, node)| Some((NodeId(node), self.graph.edge_weight(edge)?)))
            .collect()
    }

    /// All links as `(upstream, downstream, link)`.
    pub fn links(&self) -> Vec<(NodeId, NodeId, &Link)> {
        self.graph
            .raw_edges()
            .iter()
            .map(|e| (NodeId(e.source()), NodeId(e.target()), &e.weight))
            .collect()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of links.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of nodes of a kind.
    pub fn count_kind(&self, kind: NodeKind) -> usize {
        self.graph
            .raw_nodes()
            .iter()
            .filter(|n| n.weight.kind() == kind)
            .count()
    }

    /// Release every node that has not been released yet.
    ///
    /// Returns how many nodes were released by this call.
    pub fn release_all(&mut self) -> usize {
        let ids: Vec<NodeId> = self.node_ids().collect();
        let mut released = 0;
        for id in ids {
            if let Some(node) = self.graph.node_weight_mut(id.0) {
                if node.release() {
                    released += 1;
                }
            }
        }
        released
    }

    /// Check that the graph is runnable.
    ///
    /// Exactly one source, every boundary node has the right kind, and every
    /// requested port is linked.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::Config("pipeline graph is empty".into()));
        }

        let sources = self.sources();
        if sources.len() != 1 {
            return Err(Error::Config(format!(
                "pipeline graph has {} entry nodes, expected one source",
                sources.len()
            )));
        }
        for id in sources {
            let node = self.node_ref(id)?;
            if node.kind() != NodeKind::Source {
                return Err(Error::Config(format!(
                    "node '{}' has no inputs but is a {}",
                    node.name(),
                    node.kind()
                )));
            }
        }

        let sinks = self.sinks();
        if sinks.is_empty() {
            return Err(Error::Config("pipeline graph has no sink".into()));
        }
        for id in sinks {
            let node = self.node_ref(id)?;
            if node.kind() != NodeKind::Sink {
                return Err(Error::Config(format!(
                    "node '{}' has no outputs but is a {}",
                    node.name(),
                    node.kind()
                )));
            }
        }

        for id in self.node_ids() {
            let node = self.node_ref(id)?;
            let children = self.children(id);
            let parents = self.parents(id);
            let dangling = node
                .outputs
                .iter()
                .find(|p| !children.iter().any(|(_, l)| l.src_port == p.name()))
                .or_else(|| {
                    node.inputs
                        .iter()
                        .find(|p| !parents.iter().any(|(_, l)| l.sink_port == p.name()))
                });
            if let Some(port) = dangling {
                return Err(Error::Config(format!(
                    "port '{}' of node '{}' is not linked",
                    port.name(),
                    node.name()
                )));
            }
        }

        Ok(())
    }

    fn node_ref(&self, id: NodeId) -> Result<&Node<N>> {
        self.get_node(id)
            .ok_or_else(|| Error::Config(format!("node {} not found", id.index())))
    }
}

impl<N: ProcessingNode> Drop for PipelineGraph<N> {
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            tracing::debug!("released {} nodes on drop", released);
        }
    }
}

impl<N: ProcessingNode> Default for PipelineGraph<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: ProcessingNode> fmt::Debug for PipelineGraph<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutTile;
    use crate::node::PortTemplate;

    struct TestNode {
        name: String,
        kind: NodeKind,
        serial: usize,
        releases: usize,
    }

    impl TestNode {
        fn new(kind: NodeKind, name: &str) -> Self {
            Self {
                name: name.to_string(),
                kind,
                serial: 0,
                releases: 0,
            }
        }
    }

    impl ProcessingNode for TestNode {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> NodeKind {
            self.kind
        }

        fn request_port(&mut self, direction: PortDirection) -> Result<String> {
            let template = self
                .kind
                .request_template(direction)
                .copied()
                .unwrap_or(PortTemplate::SRC_REQUEST);
            let name = template.instantiate(self.serial);
            self.serial += 1;
            Ok(name)
        }

        fn set_placement(&mut self, _port: &str, _tile: &LayoutTile) -> Result<()> {
            Ok(())
        }

        fn release(&mut self) {
            self.releases += 1;
        }
    }

    #[test]
    fn test_graph_creation() {
        let graph: PipelineGraph<TestNode> = PipelineGraph::new();
        assert!(graph.is_empty());
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_link_nodes() {
        let mut graph = PipelineGraph::new();
        let src = graph.add_node(TestNode::new(NodeKind::Source, "src"));
        let scale = graph.add_node(TestNode::new(NodeKind::Scaler, "scale"));
        let sink = graph.add_node(TestNode::new(NodeKind::Sink, "sink"));

        graph.link(src, scale).unwrap();
        graph.link(scale, sink).unwrap();
        assert_eq!(graph.edge_count(), 2);

        let children = graph.children(src);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, scale);

        let parents = graph.parents(scale);
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].0, src);

        assert_eq!(graph.sources(), vec![src]);
        assert_eq!(graph.sinks(), vec![sink]);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_port_checks() {
        let mut graph = PipelineGraph::new();
        let src = graph.add_node(TestNode::new(NodeKind::Source, "src"));
        let a = graph.add_node(TestNode::new(NodeKind::Sink, "a"));
        let b = graph.add_node(TestNode::new(NodeKind::Sink, "b"));

        // sinks have no output
        assert!(matches!(graph.link(a, b), Err(Error::Link { .. })));

        graph.link(src, a).unwrap();
        // src is already in use
        assert!(graph.link(src, b).is_err());
    }

    #[test]
    fn test_request_ports() {
        let mut graph = PipelineGraph::new();
        let src = graph.add_node(TestNode::new(NodeKind::Source, "src"));
        let split = graph.add_node(TestNode::new(NodeKind::Splitter, "split"));
        let a = graph.add_node(TestNode::new(NodeKind::Sink, "a"));
        let b = graph.add_node(TestNode::new(NodeKind::Sink, "b"));
        graph.link(src, split).unwrap();

        let p0 = graph.request_port(split, PortDirection::Output).unwrap();
        // requested but unlinked port fails validation
        assert!(graph.validate().is_err());

        let p1 = graph.request_port(split, PortDirection::Output).unwrap();
        assert_eq!((p0.as_str(), p1.as_str()), ("src_0", "src_1"));

        graph.link_ports(split, a, Link::with_ports(p0, "sink")).unwrap();
        graph.link_ports(split, b, Link::with_ports(p1, "sink")).unwrap();
        assert!(graph.validate().is_ok());
        assert_eq!(graph.count_kind(NodeKind::Sink), 2);
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = PipelineGraph::new();
        let a = graph.add_node(TestNode::new(NodeKind::Queue, "a"));
        let b = graph.add_node(TestNode::new(NodeKind::Queue, "b"));
        graph.link(a, b).unwrap();
        assert!(graph.link(b, a).is_err());
    }

    #[test]
    fn test_release_all_is_once() {
        let mut graph = PipelineGraph::new();
        let a = graph.add_node(TestNode::new(NodeKind::Source, "a"));
        let b = graph.add_node(TestNode::new(NodeKind::Sink, "b"));

        assert_eq!(graph.release_all(), 2);
        assert_eq!(graph.release_all(), 0);
        assert_eq!(graph.get_node(a).unwrap().inner().releases, 1);
        assert_eq!(graph.get_node(b).unwrap().inner().releases, 1);
        assert!(graph.get_node(b).unwrap().is_released());
    }

    #[test]
    fn test_constrained_link() {
        let mut graph = PipelineGraph::new();
        let a = graph.add_node(TestNode::new(NodeKind::Scaler, "a"));
        let b = graph.add_node(TestNode::new(NodeKind::FormatConverter, "b"));
        let c = FormatConstraint {
            size: Some((320, 240)),
            ..FormatConstraint::any()
        };
        graph.link_ports(a, b, Link::new().constrained(c)).unwrap();
        let links = graph.links();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].2.constraint, Some(c));
    }
}
