//! In-process runtime built on tokio tasks and kanal channels.
//!
//! Frames here are descriptors: geometry, timestamps, pixel layout and the
//! layers a compositor stacked. No pixels move. That is enough to exercise
//! every path of the pipeline (rate conversion, scaling, tiling, drain on
//! interrupt, fault handling) without a display server.

mod executor;
pub mod frame;
pub mod nodes;

use crate::error::{Error, Result};
use crate::layout::LayoutTile;
use crate::node::{
    FormatConstraint, NodeKind, NodeSettings, NodeSpec, PortDirection, PortTemplate,
    ProcessingNode,
};
use crate::pipeline::PipelineGraph;
use crate::pipeline::bus::{bus, control_channel};
use crate::runtime::{Running, Runtime};
use frame::{Frame, Payload};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Makes one node fail after it has handled a number of frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Name of the node that fails.
    pub node: String,
    /// Frames handled before the failure.
    pub after_frames: u64,
}

/// Settings for [`LocalRuntime`].
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Size of the simulated screen.
    pub screen_size: (u32, u32),
    /// Native capture rate of the source.
    pub capture_rate: u32,
    /// Stop after this many captured frames.
    pub frame_limit: Option<u64>,
    /// Pace the source on a wall clock.
    pub realtime: bool,
    /// Capacity of ordinary links.
    pub channel_capacity: usize,
    /// Capacity of links into a queue node.
    pub queue_capacity: usize,
    /// Node kinds that cannot be created.
    pub unavailable: Vec<NodeKind>,
    /// Injected failure.
    pub fault: Option<Fault>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            screen_size: (1920, 1080),
            capture_rate: 30,
            frame_limit: None,
            realtime: true,
            channel_capacity: 4,
            queue_capacity: 64,
            unavailable: Vec::new(),
            fault: None,
        }
    }
}

impl LocalConfig {
    /// Set the simulated screen size.
    pub fn with_screen_size(mut self, width: u32, height: u32) -> Self {
        self.screen_size = (width, height);
        self
    }

    /// Set the native capture rate.
    pub fn with_capture_rate(mut self, rate: u32) -> Self {
        self.capture_rate = rate;
        self
    }

    /// End the stream after `frames` captured frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Capture as fast as downstream accepts.
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    /// Pretend `kind` is not installed.
    pub fn without(mut self, kind: NodeKind) -> Self {
        self.unavailable.push(kind);
        self
    }

    /// Make `node` post an error after `after_frames` frames.
    pub fn fail_node(mut self, node: impl Into<String>, after_frames: u64) -> Self {
        self.fault = Some(Fault {
            node: node.into(),
            after_frames,
        });
        self
    }
}

/// A node of the local runtime.
#[derive(Debug)]
pub struct LocalNode {
    name: String,
    kind: NodeKind,
    settings: NodeSettings,
    next_port: usize,
    placements: Vec<(String, LayoutTile)>,
    released: bool,
}

impl LocalNode {
    fn new(spec: &NodeSpec) -> Self {
        Self {
            name: spec.name.clone(),
            kind: spec.kind,
            settings: spec.settings.clone(),
            next_port: 0,
            placements: Vec::new(),
            released: false,
        }
    }

    /// Settings the node was created with.
    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Tile assigned to a compositor input port.
    pub fn placement(&self, port: &str) -> Option<LayoutTile> {
        self.placements
            .iter()
            .find(|(p, _)| p == port)
            .map(|(_, tile)| *tile)
    }

    /// Whether [`ProcessingNode::release`] has run.
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl ProcessingNode for LocalNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn request_port(&mut self, direction: PortDirection) -> Result<String> {
        let template: &PortTemplate =
            self.kind
                .request_template(direction)
                .ok_or_else(|| Error::Runtime {
                    message: format!("{} has no request {:?} ports", self.kind, direction),
                    node: Some(self.name.clone()),
                })?;
        let port = template.instantiate(self.next_port);
        self.next_port += 1;
        Ok(port)
    }

    fn set_placement(&mut self, port: &str, tile: &LayoutTile) -> Result<()> {
        if self.kind != NodeKind::Compositor {
            return Err(Error::Runtime {
                message: format!("{} does not place inputs", self.kind),
                node: Some(self.name.clone()),
            });
        }
        self.placements.retain(|(p, _)| p != port);
        self.placements.push((port.to_string(), *tile));
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            tracing::trace!("released {}", self.name);
            self.released = true;
        }
    }
}

/// What a sink saw during a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkReport {
    /// Frames consumed.
    pub frames: u64,
    /// Geometry of the last frame.
    pub last_size: Option<(u32, u32)>,
    /// Layer count of the last frame.
    pub last_layers: usize,
    /// Timestamp of the last frame.
    pub last_pts: Option<Duration>,
    /// Frames carrying an encoded payload.
    pub encoded: u64,
}

impl SinkReport {
    fn record(&mut self, frame: &Frame) {
        self.frames += 1;
        self.last_size = Some((frame.width, frame.height));
        self.last_layers = frame.layers.len();
        self.last_pts = Some(frame.pts);
        if matches!(frame.payload, Payload::Encoded { .. }) {
            self.encoded += 1;
        }
    }
}

/// Runs a graph as tokio tasks on the ambient runtime.
#[derive(Debug)]
pub struct LocalRuntime {
    config: LocalConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reports: Arc<Mutex<HashMap<String, SinkReport>>>,
}

impl LocalRuntime {
    /// Create a runtime.
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            tasks: Mutex::new(Vec::new()),
            reports: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    /// Reports of sinks that reached end-of-stream, keyed by node name.
    pub fn reports(&self) -> HashMap<String, SinkReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl Runtime for LocalRuntime {
    type Node = LocalNode;

    fn name(&self) -> &'static str {
        "local"
    }

    fn create_node(&self, spec: &NodeSpec) -> Result<LocalNode> {
        if self.config.unavailable.contains(&spec.kind) {
            return Err(Error::Runtime {
                message: format!("no {} available", spec.kind),
                node: Some(spec.name.clone()),
            });
        }
        if let NodeSettings::Canvas { width, height, .. } = spec.settings {
            if width == 0 || height == 0 {
                return Err(Error::Runtime {
                    message: format!("empty canvas {width}x{height}"),
                    node: Some(spec.name.clone()),
                });
            }
        }
        tracing::trace!("created {} '{}'", spec.kind, spec.name);
        Ok(LocalNode::new(spec))
    }

    fn link(
        &self,
        upstream: &LocalNode,
        src_port: &str,
        downstream: &LocalNode,
        sink_port: &str,
        constraint: Option<&FormatConstraint>,
    ) -> Result<()> {
        let refuse = |reason: &str| {
            Err(Error::link(
                format!("{}.{}", upstream.name, src_port),
                format!("{}.{}", downstream.name, sink_port),
                reason,
            ))
        };

        if upstream.kind == NodeKind::Sink {
            return refuse("a sink has no outputs");
        }
        if downstream.kind == NodeKind::Source {
            return refuse("a source has no inputs");
        }
        if (upstream.kind == NodeKind::Encoder) != (downstream.kind == NodeKind::Muxer) {
            return refuse("encoded streams only go into a muxer");
        }
        if let Some(c) = constraint {
            if matches!(upstream.kind, NodeKind::Encoder | NodeKind::Muxer) {
                return refuse("encoded streams cannot be constrained");
            }
            if c.size.is_some_and(|(w, h)| w == 0 || h == 0) || c.framerate == Some(0) {
                return refuse(&format!("unsatisfiable constraint {c}"));
            }
        }
        Ok(())
    }

    fn start(&self, graph: &mut PipelineGraph<LocalNode>) -> Result<Running> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::Runtime {
                message: "local runtime must be started inside a tokio runtime".into(),
                node: None,
            });
        }
        graph.validate()?;

        let (sender, receiver) = bus();
        let (events, control) = control_channel();
        let tasks = executor::spawn(graph, &self.config, sender, control, self.reports.clone())?;
        tracing::info!(
            "local runtime started {} tasks for {} links",
            tasks.len(),
            graph.edge_count()
        );

        if let Ok(mut held) = self.tasks.lock() {
            held.extend(tasks);
        }
        Ok(Running {
            bus: receiver,
            events,
        })
    }

    fn stop(&self, _graph: &mut PipelineGraph<LocalNode>) {
        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut held) => held.drain(..).collect(),
            Err(_) => return,
        };
        let unfinished = tasks.iter().filter(|t| !t.is_finished()).count();
        for task in tasks {
            task.abort();
        }
        tracing::debug!("local runtime stopped ({} tasks still running)", unfinished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeSpec;

    #[test]
    fn test_unavailable_kind() {
        let rt = LocalRuntime::new(LocalConfig::default().without(NodeKind::Compositor));
        let err = rt
            .create_node(&NodeSpec::new(NodeKind::Compositor, "compositor"))
            .unwrap_err();
        assert!(matches!(err, Error::Runtime { node: Some(ref n), .. } if n == "compositor"));
        assert!(rt.create_node(&NodeSpec::new(NodeKind::Scaler, "scale")).is_ok());
    }

    #[test]
    fn test_request_ports_are_numbered() {
        let rt = LocalRuntime::new(LocalConfig::default());
        let mut tee = rt
            .create_node(&NodeSpec::new(NodeKind::Splitter, "splitter"))
            .unwrap();
        assert_eq!(tee.request_port(PortDirection::Output).unwrap(), "src_0");
        assert_eq!(tee.request_port(PortDirection::Output).unwrap(), "src_1");
        assert!(tee.request_port(PortDirection::Input).is_err());
    }

    #[test]
    fn test_placement_only_on_compositor() {
        let rt = LocalRuntime::new(LocalConfig::default());
        let tile = LayoutTile {
            profile_index: crate::profile::ProfileIndex(0),
            x: 0,
            y: 0,
            width: 640,
            height: 480,
        };
        let mut scaler = rt.create_node(&NodeSpec::new(NodeKind::Scaler, "scale")).unwrap();
        assert!(scaler.set_placement("sink_0", &tile).is_err());

        let mut mixer = rt
            .create_node(&NodeSpec::new(NodeKind::Compositor, "compositor"))
            .unwrap();
        mixer.set_placement("sink_0", &tile).unwrap();
        assert_eq!(mixer.placement("sink_0"), Some(tile));
        assert_eq!(mixer.placement("sink_1"), None);
    }

    #[test]
    fn test_link_rules() {
        let rt = LocalRuntime::new(LocalConfig::default());
        let node = |kind, name: &str| rt.create_node(&NodeSpec::new(kind, name)).unwrap();
        let encoder = node(NodeKind::Encoder, "encoder");
        let muxer = node(NodeKind::Muxer, "muxer");
        let sink = node(NodeKind::Sink, "sink");
        let scaler = node(NodeKind::Scaler, "scale");
        let convert = node(NodeKind::FormatConverter, "convert");

        assert!(rt.link(&encoder, "src", &muxer, "sink", None).is_ok());
        assert!(rt.link(&encoder, "src", &sink, "sink", None).is_err());
        assert!(rt.link(&sink, "src", &scaler, "sink", None).is_err());

        let zero = FormatConstraint {
            size: Some((0, 480)),
            ..FormatConstraint::any()
        };
        let err = rt.link(&scaler, "src", &convert, "sink", Some(&zero)).unwrap_err();
        assert!(matches!(err, Error::Link { ref from, .. } if from == "scale.src"));
    }

    #[test]
    fn test_start_requires_tokio() {
        let rt = LocalRuntime::new(LocalConfig::default());
        let mut graph = PipelineGraph::new();
        let Err(err) = rt.start(&mut graph) else {
            panic!("started outside a tokio runtime");
        };
        assert!(matches!(err, Error::Runtime { .. }));
    }

    #[tokio::test]
    async fn test_stop_tolerates_unstarted_graph() {
        let rt = LocalRuntime::new(LocalConfig::default());
        let mut graph = PipelineGraph::new();
        rt.stop(&mut graph);
        assert!(rt.reports().is_empty());
    }
}
