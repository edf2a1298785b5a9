//! Error types for tilecast.

use crate::node::NodeKind;
use thiserror::Error;

/// Result type alias using tilecast's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for graph construction and pipeline execution.
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration cannot produce a usable pipeline.
    #[error("configuration error: {0}")]
    Config(String),

    /// The runtime could not instantiate a required node kind.
    #[error("cannot create {kind} node while building {stage}: {reason}")]
    GraphConstruction {
        /// Build step that was running (e.g. "source", "branch 2").
        stage: String,
        /// Kind of node that failed.
        kind: NodeKind,
        /// Runtime-provided reason.
        reason: String,
    },

    /// Two adjacent nodes could not be connected.
    #[error("cannot link {from} -> {to}: {reason}")]
    Link {
        /// Upstream node name.
        from: String,
        /// Downstream node name.
        to: String,
        /// Why the link was rejected.
        reason: String,
    },

    /// The runtime refused a state change, or the controller was driven out of order.
    #[error("state transition {from} -> {to} failed: {reason}")]
    StateTransition {
        /// State before the attempted transition.
        from: String,
        /// Requested state.
        to: String,
        /// Why the transition failed.
        reason: String,
    },

    /// The control bus reported an error while the pipeline was running.
    #[error("runtime error{}: {message}", node_suffix(.node))]
    Runtime {
        /// Error message from the runtime.
        message: String,
        /// Node that posted the error, if known.
        node: Option<String>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn node_suffix(node: &Option<String>) -> String {
    match node {
        Some(n) => format!(" in {n}"),
        None => String::new(),
    }
}

impl Error {
    /// Create a node instantiation error.
    pub fn construction(stage: impl Into<String>, kind: NodeKind, reason: impl Into<String>) -> Self {
        Error::GraphConstruction {
            stage: stage.into(),
            kind,
            reason: reason.into(),
        }
    }

    /// Create a link error.
    pub fn link(from: impl Into<String>, to: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Link {
            from: from.into(),
            to: to.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error happened while the graph was being built.
    pub fn is_build_error(&self) -> bool {
        matches!(self, Error::GraphConstruction { .. } | Error::Link { .. })
    }
}
