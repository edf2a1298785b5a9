//! Processing nodes as seen by graph construction.
//!
//! The builder never looks inside a node. It asks a [`Runtime`](crate::runtime::Runtime)
//! for a node of some [`NodeKind`], requests ports on splitters and
//! compositors, places compositor inputs, and finally releases every node it
//! created. Everything else is the runtime's business.

mod constraint;
mod port;

pub use constraint::{FormatConstraint, PixelFormat};
pub use port::{Port, PortDirection, PortList, PortPresence, PortTemplate};

use crate::error::Result;
use crate::layout::LayoutTile;
use crate::profile::CaptureTarget;
use std::fmt;
use std::path::PathBuf;

/// The kinds of processing step a graph is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Screen capture.
    Source,
    /// Duplicates one stream onto any number of outputs.
    Splitter,
    /// Buffers a branch so it cannot stall its siblings.
    Queue,
    /// Drops or duplicates frames to reach a frame rate.
    RateConverter,
    /// Rescales frames.
    Scaler,
    /// Converts the pixel layout.
    FormatConverter,
    /// Places several inputs onto one canvas.
    Compositor,
    /// Compresses raw frames.
    Encoder,
    /// Packs encoded frames into a container.
    Muxer,
    /// Terminal consumer: display, file or null.
    Sink,
}

impl NodeKind {
    /// Lower-case name used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::Splitter => "splitter",
            NodeKind::Queue => "queue",
            NodeKind::RateConverter => "rate converter",
            NodeKind::Scaler => "scaler",
            NodeKind::FormatConverter => "format converter",
            NodeKind::Compositor => "compositor",
            NodeKind::Encoder => "encoder",
            NodeKind::Muxer => "muxer",
            NodeKind::Sink => "sink",
        }
    }

    /// Port templates of this kind.
    pub fn port_templates(&self) -> &'static [PortTemplate] {
        match self {
            NodeKind::Source => &[PortTemplate::SRC],
            NodeKind::Splitter => &[PortTemplate::SINK, PortTemplate::SRC_REQUEST],
            NodeKind::Compositor => &[PortTemplate::SINK_REQUEST, PortTemplate::SRC],
            NodeKind::Sink => &[PortTemplate::SINK],
            NodeKind::Queue
            | NodeKind::RateConverter
            | NodeKind::Scaler
            | NodeKind::FormatConverter
            | NodeKind::Encoder
            | NodeKind::Muxer => &[PortTemplate::SINK, PortTemplate::SRC],
        }
    }

    /// The request template for a direction, if this kind has one.
    pub fn request_template(&self, direction: PortDirection) -> Option<&'static PortTemplate> {
        self.port_templates()
            .iter()
            .find(|t| t.direction == direction && t.presence == PortPresence::Request)
    }

    /// Ports that exist as soon as the node is created.
    pub fn always_ports(&self) -> PortList {
        self.port_templates()
            .iter()
            .filter(|t| t.presence == PortPresence::Always)
            .map(|t| Port::new(t.name, t.direction))
            .collect()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a [`NodeKind::Sink`] delivers its frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    /// Render to a window.
    Display,
    /// Write to a file.
    File(PathBuf),
    /// Discard.
    Null,
}

/// Kind-specific settings fixed at creation time.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum NodeSettings {
    /// Nothing beyond the kind.
    #[default]
    Default,
    /// Source bound to a capture target.
    Capture(CaptureTarget),
    /// Compositor canvas and output rate.
    Canvas {
        /// Output width.
        width: u32,
        /// Output height.
        height: u32,
        /// Output frame rate.
        framerate: u32,
    },
    /// Sink destination.
    Sink(SinkTarget),
}

/// Everything a runtime needs to instantiate one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    /// Kind of node.
    pub kind: NodeKind,
    /// Unique name within the graph, used in logs and bus messages.
    pub name: String,
    /// Kind-specific settings.
    pub settings: NodeSettings,
}

impl NodeSpec {
    /// A node with default settings.
    pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            settings: NodeSettings::Default,
        }
    }

    /// Attach settings.
    pub fn with_settings(mut self, settings: NodeSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// A node instantiated by a runtime.
pub trait ProcessingNode: Send {
    /// Name given at creation.
    fn name(&self) -> &str;

    /// Kind given at creation.
    fn kind(&self) -> NodeKind;

    /// Create a new request port and return its name.
    ///
    /// Only splitters (outputs) and compositors (inputs) support this.
    fn request_port(&mut self, direction: PortDirection) -> Result<String>;

    /// Position one compositor input on the canvas.
    fn set_placement(&mut self, port: &str, tile: &LayoutTile) -> Result<()>;

    /// Give back every resource the node holds. Called exactly once.
    fn release(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ports() {
        let ports = NodeKind::Scaler.always_ports();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().any(|p| p.name() == "sink" && p.is_input()));
        assert!(ports.iter().any(|p| p.name() == "src" && p.is_output()));

        assert!(NodeKind::Source.always_ports().iter().all(Port::is_output));
        assert!(NodeKind::Sink.always_ports().iter().all(Port::is_input));
        assert!(NodeKind::Compositor.always_ports().iter().all(Port::is_output));
    }

    #[test]
    fn test_request_templates() {
        assert_eq!(
            NodeKind::Splitter
                .request_template(PortDirection::Output)
                .map(|t| t.name),
            Some("src_%u")
        );
        assert_eq!(
            NodeKind::Compositor
                .request_template(PortDirection::Input)
                .map(|t| t.name),
            Some("sink_%u")
        );
        assert!(NodeKind::Queue.request_template(PortDirection::Output).is_none());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(NodeKind::RateConverter.to_string(), "rate converter");
        assert_eq!(NodeKind::Sink.to_string(), "sink");
    }
}
