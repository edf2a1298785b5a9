//! Turns a capture target and a list of stream profiles into a processing graph.
//!
//! With one profile the graph is a straight line:
//!
//! ```text
//! source -> scale-0 -> convert-0 -> output
//! ```
//!
//! With more, the capture is split into one private branch per profile and
//! the branches are composited back onto a single canvas:
//!
//! ```text
//!                     +-> queue-0 -> rate-0 -> scale-0 -> convert-0 -+
//! source -> splitter -+                                              +-> compositor -> output
//!                     +-> queue-1 -> rate-1 -> scale-1 -> convert-1 -+
//! ```
//!
//! The output is a display sink, an encoder/muxer/file chain, or a null sink.

use crate::error::{Error, Result};
use crate::layout::{LayoutTile, canvas_size, compute_layout};
use crate::node::{
    FormatConstraint, NodeKind, NodeSettings, NodeSpec, PortDirection, ProcessingNode, SinkTarget,
};
use crate::pipeline::graph::{Link, NodeId, PipelineGraph};
use crate::profile::{CaptureTarget, ProfileIndex, StreamProfile, validate_profiles};
use crate::runtime::Runtime;
use std::path::PathBuf;

/// Where the final stream goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Render in a window.
    #[default]
    Display,
    /// Encode, mux and write to a file.
    Record {
        /// Output file.
        path: PathBuf,
    },
    /// Throw frames away.
    Discard,
}

/// The nodes making up one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRecord {
    /// Profile this branch renders.
    pub profile_index: ProfileIndex,
    /// Profile this branch renders.
    pub profile: StreamProfile,
    /// Branch queue. Absent for a single profile.
    pub queue: Option<NodeId>,
    /// Frame-rate converter. Absent for a single profile.
    pub rate_converter: Option<NodeId>,
    /// Scaler.
    pub scaler: NodeId,
    /// Format converter, the branch's last node.
    pub converter: NodeId,
    /// Compositor input this branch feeds. Absent for a single profile.
    pub compositor_port: Option<String>,
}

/// Node counts per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Topology {
    /// Capture sources.
    pub sources: usize,
    /// Splitters.
    pub splitters: usize,
    /// Queues.
    pub queues: usize,
    /// Rate converters.
    pub rate_converters: usize,
    /// Scalers.
    pub scalers: usize,
    /// Format converters.
    pub format_converters: usize,
    /// Compositors.
    pub compositors: usize,
    /// Encoders.
    pub encoders: usize,
    /// Muxers.
    pub muxers: usize,
    /// Sinks.
    pub sinks: usize,
}

/// A fully linked graph plus what the builder learned while making it.
#[derive(Debug)]
pub struct BuiltGraph<N: ProcessingNode> {
    /// The graph.
    pub graph: PipelineGraph<N>,
    /// One record per profile, in profile order.
    pub branches: Vec<BranchRecord>,
    /// Tile per profile. Empty for a single profile.
    pub layout: Vec<LayoutTile>,
}

impl<N: ProcessingNode> BuiltGraph<N> {
    /// Number of branches.
    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Count the nodes of every kind.
    pub fn topology(&self) -> Topology {
        let count = |kind| self.graph.count_kind(kind);
        Topology {
            sources: count(NodeKind::Source),
            splitters: count(NodeKind::Splitter),
            queues: count(NodeKind::Queue),
            rate_converters: count(NodeKind::RateConverter),
            scalers: count(NodeKind::Scaler),
            format_converters: count(NodeKind::FormatConverter),
            compositors: count(NodeKind::Compositor),
            encoders: count(NodeKind::Encoder),
            muxers: count(NodeKind::Muxer),
            sinks: count(NodeKind::Sink),
        }
    }
}

/// Builds processing graphs on top of a runtime.
pub struct GraphBuilder<'a, R: Runtime> {
    runtime: &'a R,
    output: OutputMode,
}

impl<'a, R: Runtime> GraphBuilder<'a, R> {
    /// Create a builder rendering to the display.
    pub fn new(runtime: &'a R) -> Self {
        Self {
            runtime,
            output: OutputMode::Display,
        }
    }

    /// Choose the output chain.
    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Build the graph.
    ///
    /// Every node is owned by the graph as soon as it exists. If any step
    /// fails, all nodes created so far are released before the error is
    /// returned.
    pub fn build(
        &self,
        capture: &CaptureTarget,
        profiles: &[StreamProfile],
    ) -> Result<BuiltGraph<R::Node>> {
        validate_profiles(profiles)?;

        let mut graph = PipelineGraph::new();
        match self.populate(&mut graph, capture, profiles) {
            Ok((branches, layout)) => {
                tracing::info!(
                    runtime = self.runtime.name(),
                    branches = branches.len(),
                    nodes = graph.node_count(),
                    links = graph.edge_count(),
                    "pipeline graph built"
                );
                Ok(BuiltGraph {
                    graph,
                    branches,
                    layout,
                })
            }
            Err(e) => {
                let released = graph.release_all();
                tracing::warn!("graph construction failed, released {} nodes: {}", released, e);
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        graph: &mut PipelineGraph<R::Node>,
        capture: &CaptureTarget,
        profiles: &[StreamProfile],
    ) -> Result<(Vec<BranchRecord>, Vec<LayoutTile>)> {
        let source = self.add(
            graph,
            "source",
            NodeSpec::new(NodeKind::Source, "source").with_settings(NodeSettings::Capture(*capture)),
        )?;

        if let [profile] = profiles {
            let branch = self.single_branch(graph, source, *profile)?;
            let output = self.add_output(graph)?;
            self.connect(graph, branch.converter, output, Link::new())?;
            graph.validate()?;
            return Ok((vec![branch], Vec::new()));
        }

        let splitter = self.add(graph, "splitter", NodeSpec::new(NodeKind::Splitter, "splitter"))?;
        self.connect(graph, source, splitter, Link::new())?;

        let mut branches = Vec::with_capacity(profiles.len());
        for (i, profile) in profiles.iter().enumerate() {
            branches.push(self.split_branch(graph, splitter, ProfileIndex(i), *profile)?);
        }

        let layout = compute_layout(profiles);
        let (width, height) = canvas_size(&layout);
        let framerate = profiles
            .iter()
            .map(StreamProfile::framerate)
            .max()
            .unwrap_or(1);
        let compositor = self.add(
            graph,
            "compositor",
            NodeSpec::new(NodeKind::Compositor, "compositor").with_settings(NodeSettings::Canvas {
                width,
                height,
                framerate,
            }),
        )?;

        for branch in &mut branches {
            let tile = &layout[branch.profile_index.get()];
            let port = graph
                .request_port(compositor, PortDirection::Input)
                .map_err(|e| as_construction(e, "compositor", NodeKind::Compositor))?;
            graph
                .get_node_mut(compositor)
                .ok_or_else(|| Error::construction("compositor", NodeKind::Compositor, "node vanished"))?
                .inner_mut()
                .set_placement(&port, tile)
                .map_err(|e| as_construction(e, "compositor", NodeKind::Compositor))?;
            tracing::debug!(
                "placed branch {} on {} at ({}, {}) {}x{}",
                branch.profile_index,
                port,
                tile.x,
                tile.y,
                tile.width,
                tile.height
            );
            self.connect(
                graph,
                branch.converter,
                compositor,
                Link::with_ports("src", port.clone()),
            )?;
            branch.compositor_port = Some(port);
        }

        let output = self.add_output(graph)?;
        self.connect(graph, compositor, output, Link::new())?;
        graph.validate()?;

        Ok((branches, layout))
    }

    /// `source -> scale-0 -> convert-0`, the profile applied between scaler and converter.
    fn single_branch(
        &self,
        graph: &mut PipelineGraph<R::Node>,
        source: NodeId,
        profile: StreamProfile,
    ) -> Result<BranchRecord> {
        let stage = "branch 0";
        let scaler = self.add(graph, stage, NodeSpec::new(NodeKind::Scaler, "scale-0"))?;
        let converter = self.add(
            graph,
            stage,
            NodeSpec::new(NodeKind::FormatConverter, "convert-0"),
        )?;

        self.connect(graph, source, scaler, Link::new())?;
        self.connect(
            graph,
            scaler,
            converter,
            Link::new().constrained(FormatConstraint::from_profile(&profile)),
        )?;

        Ok(BranchRecord {
            profile_index: ProfileIndex(0),
            profile,
            queue: None,
            rate_converter: None,
            scaler,
            converter,
            compositor_port: None,
        })
    }

    /// `splitter -> queue-i -> rate-i -> scale-i -> convert-i`.
    fn split_branch(
        &self,
        graph: &mut PipelineGraph<R::Node>,
        splitter: NodeId,
        index: ProfileIndex,
        profile: StreamProfile,
    ) -> Result<BranchRecord> {
        let stage = format!("branch {index}");
        let queue = self.add(graph, &stage, NodeSpec::new(NodeKind::Queue, format!("queue-{index}")))?;
        let rate = self.add(
            graph,
            &stage,
            NodeSpec::new(NodeKind::RateConverter, format!("rate-{index}")),
        )?;
        let scaler = self.add(graph, &stage, NodeSpec::new(NodeKind::Scaler, format!("scale-{index}")))?;
        let converter = self.add(
            graph,
            &stage,
            NodeSpec::new(NodeKind::FormatConverter, format!("convert-{index}")),
        )?;

        let port = graph
            .request_port(splitter, PortDirection::Output)
            .map_err(|e| as_construction(e, &stage, NodeKind::Splitter))?;
        self.connect(graph, splitter, queue, Link::with_ports(port, "sink"))?;
        self.connect(graph, queue, rate, Link::new())?;
        self.connect(graph, rate, scaler, Link::new())?;
        self.connect(
            graph,
            scaler,
            converter,
            Link::new().constrained(FormatConstraint::from_profile(&profile)),
        )?;

        tracing::debug!("branch {} built for {}", index, profile);
        Ok(BranchRecord {
            profile_index: index,
            profile,
            queue: Some(queue),
            rate_converter: Some(rate),
            scaler,
            converter,
            compositor_port: None,
        })
    }

    /// Create the output chain and return its first node.
    fn add_output(&self, graph: &mut PipelineGraph<R::Node>) -> Result<NodeId> {
        let stage = "output";
        match &self.output {
            OutputMode::Display => self.add(
                graph,
                stage,
                NodeSpec::new(NodeKind::Sink, "display")
                    .with_settings(NodeSettings::Sink(SinkTarget::Display)),
            ),
            OutputMode::Discard => self.add(
                graph,
                stage,
                NodeSpec::new(NodeKind::Sink, "discard")
                    .with_settings(NodeSettings::Sink(SinkTarget::Null)),
            ),
            OutputMode::Record { path } => {
                let encoder = self.add(graph, stage, NodeSpec::new(NodeKind::Encoder, "encoder"))?;
                let muxer = self.add(graph, stage, NodeSpec::new(NodeKind::Muxer, "muxer"))?;
                let sink = self.add(
                    graph,
                    stage,
                    NodeSpec::new(NodeKind::Sink, "filesink")
                        .with_settings(NodeSettings::Sink(SinkTarget::File(path.clone()))),
                )?;
                self.connect(graph, encoder, muxer, Link::new())?;
                self.connect(graph, muxer, sink, Link::new())?;
                Ok(encoder)
            }
        }
    }

    fn add(
        &self,
        graph: &mut PipelineGraph<R::Node>,
        stage: &str,
        spec: NodeSpec,
    ) -> Result<NodeId> {
        let node = self
            .runtime
            .create_node(&spec)
            .map_err(|e| as_construction(e, stage, spec.kind))?;
        let id = graph.add_node(node);
        tracing::trace!("created {} node '{}' for {}", spec.kind, spec.name, stage);
        Ok(id)
    }

    fn connect(
        &self,
        graph: &mut PipelineGraph<R::Node>,
        upstream: NodeId,
        downstream: NodeId,
        link: Link,
    ) -> Result<()> {
        let (Some(up), Some(down)) = (graph.get_node(upstream), graph.get_node(downstream)) else {
            return Err(Error::link("?", "?", "node not in graph"));
        };
        self.runtime
            .link(
                up.inner(),
                &link.src_port,
                down.inner(),
                &link.sink_port,
                link.constraint.as_ref(),
            )
            .map_err(|e| match e {
                Error::Link { .. } => e,
                other => Error::link(up.name(), down.name(), other.to_string()),
            })?;
        graph.link_ports(upstream, downstream, link)
    }
}

fn as_construction(e: Error, stage: &str, kind: NodeKind) -> Error {
    match e {
        Error::GraphConstruction { .. } | Error::Link { .. } => e,
        other => Error::construction(stage, kind, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{LocalConfig, LocalRuntime};

    fn profiles(specs: &[(u32, u32, u32)]) -> Vec<StreamProfile> {
        specs
            .iter()
            .map(|&(w, h, f)| StreamProfile::new(w, h, f).unwrap())
            .collect()
    }

    fn runtime() -> LocalRuntime {
        LocalRuntime::new(LocalConfig::default())
    }

    #[test]
    fn test_single_profile_is_linear() {
        let rt = runtime();
        let built = GraphBuilder::new(&rt)
            .build(&CaptureTarget::default(), &profiles(&[(640, 480, 30)]))
            .unwrap();

        let t = built.topology();
        assert_eq!(t.sources, 1);
        assert_eq!(t.splitters, 0);
        assert_eq!(t.compositors, 0);
        assert_eq!(t.queues, 0);
        assert_eq!(t.rate_converters, 0);
        assert_eq!((t.scalers, t.format_converters, t.sinks), (1, 1, 1));
        assert!(built.layout.is_empty());
        assert_eq!(built.graph.edge_count(), 3);

        let branch = &built.branches[0];
        let links = built.graph.children(branch.scaler);
        assert_eq!(links[0].0, branch.converter);
        assert_eq!(
            links[0].1.constraint,
            Some(FormatConstraint::from_profile(&branch.profile))
        );
    }

    #[test]
    fn test_two_profiles_scenario() {
        let rt = runtime();
        let input = profiles(&[(640, 480, 5), (1280, 720, 30)]);
        let built = GraphBuilder::new(&rt)
            .build(&CaptureTarget::display(0), &input)
            .unwrap();

        let t = built.topology();
        assert_eq!((t.splitters, t.compositors), (1, 1));
        assert_eq!(t.queues, 2);
        assert_eq!(t.rate_converters, 2);
        assert_eq!(t.scalers, 2);
        assert_eq!(t.format_converters, 2);
        assert_eq!(built.branch_count(), 2);

        assert_eq!(built.layout[1].x, 0);
        assert_eq!(built.layout[1].y, 0);
        assert_eq!((built.layout[0].x, built.layout[0].y), (0, 720));

        for (i, branch) in built.branches.iter().enumerate() {
            assert_eq!(branch.profile_index, ProfileIndex(i));
            assert_eq!(branch.compositor_port.as_deref(), Some(format!("sink_{i}").as_str()));
            let children = built.graph.children(branch.scaler);
            assert_eq!(children.len(), 1);
            assert_eq!(
                children[0].1.constraint,
                Some(FormatConstraint::from_profile(&input[i]))
            );
        }
    }

    #[test]
    fn test_constraint_applied_once_per_branch() {
        let rt = runtime();
        let input = profiles(&[(426, 240, 5), (640, 480, 15), (1280, 720, 30)]);
        let built = GraphBuilder::new(&rt)
            .build(&CaptureTarget::default(), &input)
            .unwrap();

        let constrained: Vec<_> = built
            .graph
            .links()
            .into_iter()
            .filter(|(_, _, l)| l.constraint.is_some())
            .collect();
        assert_eq!(constrained.len(), 3);
        assert!(
            constrained
                .iter()
                .all(|(up, _, _)| built.graph.get_node(*up).unwrap().kind() == NodeKind::Scaler)
        );
    }

    #[test]
    fn test_record_output_chain() {
        let rt = runtime();
        let built = GraphBuilder::new(&rt)
            .with_output(OutputMode::Record {
                path: PathBuf::from("out.mp4"),
            })
            .build(&CaptureTarget::default(), &profiles(&[(640, 480, 30), (320, 240, 5)]))
            .unwrap();

        let t = built.topology();
        assert_eq!((t.encoders, t.muxers, t.sinks), (1, 1, 1));
        let sink = built.graph.sinks()[0];
        assert_eq!(built.graph.get_node(sink).unwrap().name(), "filesink");
    }

    #[test]
    fn test_rejects_bad_profile_counts() {
        let rt = runtime();
        let err = GraphBuilder::new(&rt)
            .build(&CaptureTarget::default(), &[])
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let too_many = profiles(&[(320, 240, 5); 11]);
        let err = GraphBuilder::new(&rt)
            .build(&CaptureTarget::default(), &too_many)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_max_branches() {
        let rt = runtime();
        let input = profiles(&[(320, 240, 5); 10]);
        let built = GraphBuilder::new(&rt)
            .with_output(OutputMode::Discard)
            .build(&CaptureTarget::default(), &input)
            .unwrap();
        assert_eq!(built.topology().queues, 10);
        assert_eq!(built.layout.len(), 10);
    }

    #[test]
    fn test_unavailable_kind_fails_construction() {
        let rt = LocalRuntime::new(LocalConfig::default().without(NodeKind::RateConverter));
        let err = GraphBuilder::new(&rt)
            .build(
                &CaptureTarget::default(),
                &profiles(&[(640, 480, 5), (1280, 720, 30)]),
            )
            .unwrap_err();
        match err {
            Error::GraphConstruction { stage, kind, .. } => {
                assert_eq!(stage, "branch 0");
                assert_eq!(kind, NodeKind::RateConverter);
            }
            other => panic!("unexpected error: {other}"),
        }

        // a single profile does not need a rate converter
        assert!(
            GraphBuilder::new(&rt)
                .build(&CaptureTarget::default(), &profiles(&[(640, 480, 5)]))
                .is_ok()
        );
    }
}
