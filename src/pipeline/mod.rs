//! Pipeline construction and lifecycle.
//!
//! - [`GraphBuilder`]: turns profiles into a [`PipelineGraph`]
//! - [`PipelineController`]: starts the graph, waits on the bus, tears down
//! - [`bus`]: messages out of, and signals into, a running graph
//! - [`InterruptHandle`]: requests a graceful drain
//!
//! # Example
//!
//! ```rust,ignore
//! use tilecast::pipeline::{GraphBuilder, OutputMode, PipelineController};
//! use tilecast::runtime::{LocalConfig, LocalRuntime};
//!
//! let runtime = LocalRuntime::new(LocalConfig::default());
//! let built = GraphBuilder::new(&runtime)
//!     .with_output(OutputMode::Discard)
//!     .build(&capture, &profiles)?;
//!
//! let mut controller = PipelineController::new(runtime);
//! controller.construct(built)?;
//! controller.run().await?;
//! ```

mod builder;
pub mod bus;
mod controller;
mod graph;
mod interrupt;

pub use builder::{BranchRecord, BuiltGraph, GraphBuilder, OutputMode, Topology};
pub use bus::{BusMessage, BusReceiver, BusSender, ControlSignal, EventSink};
pub use controller::{PipelineController, PipelineState, Termination};
pub use graph::{Link, Node, NodeId, PipelineGraph};
pub use interrupt::{InterruptHandle, forward_ctrl_c};
