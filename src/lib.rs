//! # Tilecast
//!
//! Captures one screen and fans it out into several independently scaled and
//! rate-converted streams, composited side by side into a single output.
//!
//! ## Features
//!
//! - **Profiles**: each output branch has its own size and frame rate
//! - **Tiling**: the widest branch becomes the hero tile, the rest form a row below it
//! - **Graceful shutdown**: Ctrl-C drains the pipeline through end-of-stream
//! - **Pluggable runtimes**: in-process tokio tasks, or GStreamer with feature `gstreamer`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tilecast::prelude::*;
//!
//! let session = SessionConfig::load("tilecast.conf")?;
//! let runtime = LocalRuntime::new(LocalConfig::default());
//! let built = GraphBuilder::new(&runtime).build(&session.capture, &session.profiles)?;
//!
//! let mut controller = PipelineController::new(runtime);
//! controller.construct(built)?;
//! controller.run().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod layout;
pub mod node;
pub mod observability;
pub mod pipeline;
pub mod profile;
pub mod runtime;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::error::{Error, Result};
    pub use crate::layout::{LayoutTile, compute_layout};
    pub use crate::pipeline::{
        GraphBuilder, OutputMode, PipelineController, PipelineState, Termination,
    };
    pub use crate::profile::{CaptureTarget, StreamProfile};
    pub use crate::runtime::{LocalConfig, LocalRuntime, Runtime};
}

pub use error::{Error, Result};
