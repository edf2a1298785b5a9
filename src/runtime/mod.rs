//! Processing runtimes.
//!
//! A [`Runtime`] instantiates nodes, checks and records links, and runs a
//! finished graph. Two implementations ship with the crate:
//!
//! - [`LocalRuntime`]: in-process tokio tasks joined by kanal channels. It
//!   moves frame descriptors through the graph and is what tests use.
//! - `GstRuntime` (feature `gstreamer`): real screen capture through
//!   GStreamer elements.

pub mod local;

#[cfg(feature = "gstreamer")]
pub mod gst;

pub use local::{Fault, LocalConfig, LocalNode, LocalRuntime, SinkReport};

#[cfg(feature = "gstreamer")]
pub use gst::{GstNode, GstRuntime};

use crate::error::Result;
use crate::node::{FormatConstraint, NodeSpec, ProcessingNode};
use crate::pipeline::PipelineGraph;
use crate::pipeline::bus::{BusReceiver, EventSink};

/// Channels handed to the controller when a graph starts running.
pub struct Running {
    /// Messages from the running graph.
    pub bus: BusReceiver,
    /// Signals into the running graph.
    pub events: EventSink,
}

/// Node instantiation and graph execution.
pub trait Runtime {
    /// The node type this runtime creates.
    type Node: ProcessingNode;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Instantiate one node.
    fn create_node(&self, spec: &NodeSpec) -> Result<Self::Node>;

    /// Connect two nodes, optionally restricting what may flow between them.
    ///
    /// Called before the link is recorded in the graph. Fails with
    /// [`Error::Link`](crate::Error::Link) when the nodes cannot be joined.
    fn link(
        &self,
        upstream: &Self::Node,
        src_port: &str,
        downstream: &Self::Node,
        sink_port: &str,
        constraint: Option<&FormatConstraint>,
    ) -> Result<()>;

    /// Start every node of a fully built graph.
    fn start(&self, graph: &mut PipelineGraph<Self::Node>) -> Result<Running>;

    /// Stop a started graph. Must tolerate a graph that never fully started.
    fn stop(&self, graph: &mut PipelineGraph<Self::Node>);
}
