//! Pipeline lifecycle.
//!
//! ```text
//! Null     --construct-->        Ready
//! Ready    --start-->            Playing    (refused: Failed)
//! Playing  --DrainRequested-->   Stopping
//! Playing  --EndOfStream-->      Stopping -> Stopped
//! Playing  --Error-->            Stopping -> Failed
//! Stopping --EndOfStream-->      Stopped
//! Stopping --Error-->            Failed
//! any      --teardown-->         Null
//! ```
//!
//! The controller owns the graph from `construct` until `teardown`. Teardown
//! stops the runtime and releases every node exactly once, and runs from
//! `Drop` as well, so every exit path cleans up.

use crate::error::{Error, Result};
use crate::observability;
use crate::pipeline::builder::BuiltGraph;
use crate::pipeline::bus::BusMessage;
use crate::pipeline::interrupt::InterruptHandle;
use crate::runtime::{Running, Runtime};
use std::fmt;

/// Lifecycle state of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipelineState {
    /// No graph.
    #[default]
    Null,
    /// Graph built, not running.
    Ready,
    /// Running.
    Playing,
    /// Draining or shutting down.
    Stopping,
    /// Finished normally.
    Stopped,
    /// Finished with an error.
    Failed,
}

impl PipelineState {
    /// Whether the pipeline has finished, one way or the other.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The source ran dry and every sink received end-of-stream.
    Completed,
    /// End-of-stream was requested and the graph drained.
    Drained,
}

/// Drives one graph through its lifecycle.
pub struct PipelineController<R: Runtime> {
    runtime: R,
    built: Option<BuiltGraph<R::Node>>,
    running: Option<Running>,
    state: PipelineState,
    drain_requested: bool,
}

impl<R: Runtime> PipelineController<R> {
    /// Create a controller in [`PipelineState::Null`].
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            built: None,
            running: None,
            state: PipelineState::Null,
            drain_requested: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// The runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// The owned graph, between `construct` and `teardown`.
    pub fn graph(&self) -> Option<&BuiltGraph<R::Node>> {
        self.built.as_ref()
    }

    /// Take ownership of a built graph.
    pub fn construct(&mut self, built: BuiltGraph<R::Node>) -> Result<()> {
        if self.state != PipelineState::Null {
            // the rejected graph is released by its own drop
            return Err(self.illegal(PipelineState::Ready, "a graph is already owned"));
        }
        self.built = Some(built);
        self.drain_requested = false;
        self.set_state(PipelineState::Ready);
        Ok(())
    }

    /// Start every branch.
    ///
    /// If the runtime refuses, the graph is released and the controller is
    /// left in [`PipelineState::Failed`]. A link the runtime cannot negotiate
    /// comes back as [`Error::Link`]; other refusals as
    /// [`Error::StateTransition`].
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Ready {
            return Err(self.illegal(PipelineState::Playing, "pipeline is not ready"));
        }
        let Some(built) = self.built.as_mut() else {
            return Err(self.illegal(PipelineState::Playing, "no graph"));
        };

        let branches = built.branches.len();
        match self.runtime.start(&mut built.graph) {
            Ok(running) => {
                self.running = Some(running);
                self.set_state(PipelineState::Playing);
                tracing::info!(runtime = self.runtime.name(), branches, "pipeline playing");
                Ok(())
            }
            Err(e) => {
                tracing::error!("runtime refused to start: {}", e);
                self.release_graph();
                self.set_state(PipelineState::Failed);
                if e.is_build_error() {
                    return Err(e);
                }
                Err(Error::StateTransition {
                    from: PipelineState::Ready.to_string(),
                    to: PipelineState::Playing.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// A handle that injects end-of-stream. Available while the graph runs.
    pub fn interrupt_handle(&self) -> Option<InterruptHandle> {
        self.running
            .as_ref()
            .map(|running| InterruptHandle::new(running.events.clone()))
    }

    /// Wait until the graph drains or fails.
    ///
    /// Suspends on the control bus. Informational messages are logged; an
    /// `Error` ends the wait at once with [`Error::Runtime`].
    pub async fn wait_for_termination(&mut self) -> Result<Termination> {
        if !matches!(self.state, PipelineState::Playing | PipelineState::Stopping) {
            return Err(self.illegal(PipelineState::Stopped, "pipeline is not running"));
        }

        loop {
            let message = match self.running.as_mut() {
                Some(running) => running.bus.recv().await,
                None => None,
            };

            match message {
                Some(BusMessage::Error { message, node }) => {
                    tracing::error!(node = node.as_deref().unwrap_or("-"), "{}", message);
                    observability::record_pipeline_error(node.as_deref());
                    if self.state == PipelineState::Playing {
                        self.set_state(PipelineState::Stopping);
                    }
                    self.set_state(PipelineState::Failed);
                    return Err(Error::Runtime { message, node });
                }
                Some(BusMessage::EndOfStream) => {
                    if self.state == PipelineState::Playing {
                        self.set_state(PipelineState::Stopping);
                    }
                    self.set_state(PipelineState::Stopped);
                    return Ok(if self.drain_requested {
                        Termination::Drained
                    } else {
                        Termination::Completed
                    });
                }
                Some(BusMessage::DrainRequested) => {
                    tracing::info!("draining");
                    self.drain_requested = true;
                    if self.state == PipelineState::Playing {
                        self.set_state(PipelineState::Stopping);
                    }
                }
                Some(BusMessage::Warning { message, node }) => {
                    tracing::warn!(node = node.as_deref().unwrap_or("-"), "{}", message);
                }
                Some(other) => tracing::debug!("{}", other),
                None => {
                    self.set_state(PipelineState::Failed);
                    return Err(Error::Runtime {
                        message: "control bus closed before end-of-stream".into(),
                        node: None,
                    });
                }
            }
        }
    }

    /// Stop the runtime and release the graph. Safe to call any number of times.
    pub fn teardown(&mut self) {
        if self.built.is_none() && self.state == PipelineState::Null {
            return;
        }
        if self.running.is_some() {
            if let Some(built) = self.built.as_mut() {
                self.runtime.stop(&mut built.graph);
            }
        }
        self.running = None;
        self.release_graph();
        self.set_state(PipelineState::Null);
    }

    /// Start, wait for termination, then tear down.
    pub async fn run(&mut self) -> Result<Termination> {
        self.start()?;
        let result = self.wait_for_termination().await;
        self.teardown();
        result
    }

    fn release_graph(&mut self) {
        if let Some(mut built) = self.built.take() {
            let released = built.graph.release_all();
            tracing::debug!("released {} nodes", released);
        }
    }

    fn set_state(&mut self, to: PipelineState) {
        if self.state != to {
            let (from, to_name) = (self.state.to_string(), to.to_string());
            observability::trace_state_change(&from, &to_name);
            observability::record_state_change(&to_name);
            self.state = to;
        }
    }

    fn illegal(&self, to: PipelineState, reason: &str) -> Error {
        Error::StateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl<R: Runtime> Drop for PipelineController<R> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<R: Runtime> fmt::Debug for PipelineController<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineController")
            .field("runtime", &self.runtime.name())
            .field("state", &self.state)
            .field("graph", &self.built.as_ref().map(|b| b.graph.node_count()))
            .finish()
    }
}
