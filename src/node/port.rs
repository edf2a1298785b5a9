//! Ports: the named connection points of processing nodes.
//!
//! Most nodes have a fixed `sink`/`src` pair. The splitter's outputs and the
//! compositor's inputs are created on request, one per branch, from a
//! `%u`-style template.

use smallvec::SmallVec;

/// Direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    /// Receives frames from upstream.
    Input,
    /// Sends frames downstream.
    Output,
}

/// Whether a port always exists or is created on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortPresence {
    /// Present from creation.
    Always,
    /// Created by [`ProcessingNode::request_port`](super::ProcessingNode::request_port).
    Request,
}

/// Template describing a port a node kind can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortTemplate {
    /// Port name, or name pattern with `%u` for request ports.
    pub name: &'static str,
    /// Direction of the port.
    pub direction: PortDirection,
    /// Presence of the port.
    pub presence: PortPresence,
}

impl PortTemplate {
    /// Always-present input named `sink`.
    pub const SINK: PortTemplate = PortTemplate {
        name: "sink",
        direction: PortDirection::Input,
        presence: PortPresence::Always,
    };

    /// Always-present output named `src`.
    pub const SRC: PortTemplate = PortTemplate {
        name: "src",
        direction: PortDirection::Output,
        presence: PortPresence::Always,
    };

    /// Request inputs `sink_0`, `sink_1`, ...
    pub const SINK_REQUEST: PortTemplate = PortTemplate {
        name: "sink_%u",
        direction: PortDirection::Input,
        presence: PortPresence::Request,
    };

    /// Request outputs `src_0`, `src_1`, ...
    pub const SRC_REQUEST: PortTemplate = PortTemplate {
        name: "src_%u",
        direction: PortDirection::Output,
        presence: PortPresence::Request,
    };

    /// Instantiate a request template with a serial number.
    pub fn instantiate(&self, serial: usize) -> String {
        self.name.replace("%u", &serial.to_string())
    }
}

/// A port instance on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    name: String,
    direction: PortDirection,
}

impl Port {
    /// Create a port.
    pub fn new(name: impl Into<String>, direction: PortDirection) -> Self {
        Self {
            name: name.into(),
            direction,
        }
    }

    /// The port's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The port's direction.
    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// Whether this is an input port.
    pub fn is_input(&self) -> bool {
        self.direction == PortDirection::Input
    }

    /// Whether this is an output port.
    pub fn is_output(&self) -> bool {
        self.direction == PortDirection::Output
    }
}

/// Ports of one node. Branch counts are small, so this stays inline.
pub type PortList = SmallVec<[Port; 4]>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_template_instantiation() {
        assert_eq!(PortTemplate::SRC_REQUEST.instantiate(0), "src_0");
        assert_eq!(PortTemplate::SINK_REQUEST.instantiate(9), "sink_9");
        assert_eq!(PortTemplate::SRC.instantiate(3), "src");
    }

    #[test]
    fn test_port_direction() {
        let port = Port::new("sink", PortDirection::Input);
        assert!(port.is_input());
        assert!(!port.is_output());
        assert_eq!(port.name(), "sink");
    }
}
