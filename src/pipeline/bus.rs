//! Control bus between a running graph and its controller.
//!
//! Runtimes post [`BusMessage`]s from their worker tasks; the controller is
//! the single consumer and suspends on [`BusReceiver::recv`]. In the other
//! direction an [`EventSink`] carries [`ControlSignal`]s into the running
//! graph. Both channels are unbounded, so posting never blocks and is safe
//! from signal handlers and node tasks alike.

use std::fmt;
use tokio::sync::mpsc;

/// Messages posted by the runtime while the graph runs.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    /// A node failed. Fatal.
    Error {
        /// What went wrong.
        message: String,
        /// Node that posted the error, if known.
        node: Option<String>,
    },

    /// Every sink has received end-of-stream.
    EndOfStream,

    /// The runtime accepted an end-of-stream request and started draining.
    DrainRequested,

    /// A node changed its internal state.
    StateChanged {
        /// Node name.
        node: String,
        /// Previous state.
        from: String,
        /// New state.
        to: String,
    },

    /// A node's worker started.
    NodeStarted {
        /// Node name.
        node: String,
    },

    /// A node's worker finished.
    NodeFinished {
        /// Node name.
        node: String,
        /// Frames the node handled.
        frames: u64,
    },

    /// Non-fatal issue.
    Warning {
        /// Warning text.
        message: String,
        /// Node that posted the warning, if known.
        node: Option<String>,
    },
}

impl BusMessage {
    /// Whether this message ends the controller's wait.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BusMessage::Error { .. } | BusMessage::EndOfStream)
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusMessage::Error { message, node } => match node {
                Some(n) => write!(f, "Error in {n}: {message}"),
                None => write!(f, "Error: {message}"),
            },
            BusMessage::EndOfStream => write!(f, "EOS"),
            BusMessage::DrainRequested => write!(f, "Drain requested"),
            BusMessage::StateChanged { node, from, to } => {
                write!(f, "Node {node} changed state: {from} -> {to}")
            }
            BusMessage::NodeStarted { node } => write!(f, "Node {node} started"),
            BusMessage::NodeFinished { node, frames } => {
                write!(f, "Node {node} finished ({frames} frames)")
            }
            BusMessage::Warning { message, node } => match node {
                Some(n) => write!(f, "Warning in {n}: {message}"),
                None => write!(f, "Warning: {message}"),
            },
        }
    }
}

/// Create a connected bus sender and receiver.
pub fn bus() -> (BusSender, BusReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BusSender { sender: tx }, BusReceiver { receiver: rx })
}

/// Posting side of the control bus.
#[derive(Clone)]
pub struct BusSender {
    sender: mpsc::UnboundedSender<BusMessage>,
}

impl BusSender {
    /// Post a message. Returns `false` once the receiver is gone.
    pub fn post(&self, message: BusMessage) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Post an error.
    pub fn post_error(&self, message: impl Into<String>, node: Option<String>) {
        self.post(BusMessage::Error {
            message: message.into(),
            node,
        });
    }

    /// Post a warning.
    pub fn post_warning(&self, message: impl Into<String>, node: Option<String>) {
        self.post(BusMessage::Warning {
            message: message.into(),
            node,
        });
    }

    /// Post end-of-stream.
    pub fn post_eos(&self) {
        self.post(BusMessage::EndOfStream);
    }

    /// Post a node-started message.
    pub fn post_node_started(&self, node: impl Into<String>) {
        self.post(BusMessage::NodeStarted { node: node.into() });
    }

    /// Post a node-finished message.
    pub fn post_node_finished(&self, node: impl Into<String>, frames: u64) {
        self.post(BusMessage::NodeFinished {
            node: node.into(),
            frames,
        });
    }
}

/// Consuming side of the control bus.
pub struct BusReceiver {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl BusReceiver {
    /// Wait for the next message.
    ///
    /// Returns `None` once every sender has been dropped.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

}

/// Signals injected into a running graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Stop producing, push end-of-stream through the graph and let sinks finalize.
    EndOfStream,
}

/// Create a connected control-signal sink and receiver.
pub fn control_channel() -> (EventSink, ControlReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { sender: tx }, ControlReceiver { receiver: rx })
}

/// Injects control signals into the running graph.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<ControlSignal>,
}

impl EventSink {
    /// Send a signal. Returns `false` if the graph no longer listens.
    pub fn send(&self, signal: ControlSignal) -> bool {
        self.sender.send(signal).is_ok()
    }
}

/// Runtime side of the control-signal channel.
pub struct ControlReceiver {
    receiver: mpsc::UnboundedReceiver<ControlSignal>,
}

impl ControlReceiver {
    /// Wait for the next signal. `None` once every sink is dropped.
    pub async fn recv(&mut self) -> Option<ControlSignal> {
        self.receiver.recv().await
    }

    /// Take a signal if one is queued.
    pub fn try_recv(&mut self) -> Option<ControlSignal> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_send_recv() {
        let (sender, mut receiver) = bus();
        sender.post_eos();
        assert_eq!(receiver.recv().await, Some(BusMessage::EndOfStream));
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (sender, mut receiver) = bus();
        tokio::spawn(async move {
            sender.post_node_started("source");
            sender.post(BusMessage::DrainRequested);
            sender.post_error("device lost", Some("source".to_string()));
        });
        assert!(matches!(
            receiver.recv().await,
            Some(BusMessage::NodeStarted { .. })
        ));
        assert_eq!(receiver.recv().await, Some(BusMessage::DrainRequested));
        let error = receiver.recv().await.unwrap();
        assert_eq!(error.to_string(), "Error in source: device lost");
    }

    #[tokio::test]
    async fn test_closed_bus() {
        let (sender, mut receiver) = bus();
        drop(sender);
        assert!(receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_control_signal() {
        let (sink, mut receiver) = control_channel();
        assert!(receiver.try_recv().is_none());
        assert!(sink.send(ControlSignal::EndOfStream));
        assert_eq!(receiver.recv().await, Some(ControlSignal::EndOfStream));
        drop(receiver);
        assert!(!sink.send(ControlSignal::EndOfStream));
    }

    #[test]
    fn test_message_display() {
        let msg = BusMessage::NodeFinished {
            node: "sink".into(),
            frames: 12,
        };
        assert_eq!(msg.to_string(), "Node sink finished (12 frames)");
        assert!(BusMessage::EndOfStream.is_terminal());
        assert!(!BusMessage::DrainRequested.is_terminal());
    }
}
