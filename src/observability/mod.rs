//! Metrics and tracing helpers.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `tilecast_frames_produced` | Counter | Frames captured by the source |
//! | `tilecast_frames_processed` | Counter | Frames handled by transforms |
//! | `tilecast_frames_dropped` | Counter | Frames a transform consumed without output |
//! | `tilecast_frames_rendered` | Counter | Frames delivered to sinks |
//! | `tilecast_bytes_produced` | Counter | Raw bytes captured |
//! | `tilecast_pipeline_errors` | Counter | Errors posted on the bus |
//! | `tilecast_state_changes` | Counter | Controller state transitions |
//!
//! Nothing is exported unless the binary installs a `metrics` recorder.
//!
//! ## Tracing
//!
//! Each node task runs inside a [`span_node`] span nested in the
//! [`span_pipeline`] span of the run.

mod metrics;
mod tracing_support;

pub use metrics::{
    init_metrics, record_bytes_produced, record_frame_dropped, record_frame_processed,
    record_frame_produced, record_frame_rendered, record_pipeline_error, record_state_change,
};
pub use tracing_support::{span_node, span_pipeline, trace_state_change};
