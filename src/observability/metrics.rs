//! Counters recorded through the `metrics` facade.

use metrics::{Unit, counter};
use std::sync::atomic::{AtomicBool, Ordering};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const FRAMES_PRODUCED: &str = "tilecast_frames_produced";
const FRAMES_PROCESSED: &str = "tilecast_frames_processed";
const FRAMES_DROPPED: &str = "tilecast_frames_dropped";
const FRAMES_RENDERED: &str = "tilecast_frames_rendered";
const BYTES_PRODUCED: &str = "tilecast_bytes_produced";
const PIPELINE_ERRORS: &str = "tilecast_pipeline_errors";
const STATE_CHANGES: &str = "tilecast_state_changes";

/// Describe every metric. Later calls are no-ops.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        FRAMES_PRODUCED,
        Unit::Count,
        "Frames captured by the source"
    );
    metrics::describe_counter!(
        FRAMES_PROCESSED,
        Unit::Count,
        "Frames handled by transforms"
    );
    metrics::describe_counter!(
        FRAMES_DROPPED,
        Unit::Count,
        "Frames consumed by a transform without output"
    );
    metrics::describe_counter!(FRAMES_RENDERED, Unit::Count, "Frames delivered to sinks");
    metrics::describe_counter!(BYTES_PRODUCED, Unit::Bytes, "Raw bytes captured");
    metrics::describe_counter!(PIPELINE_ERRORS, Unit::Count, "Errors posted on the bus");
    metrics::describe_counter!(
        STATE_CHANGES,
        Unit::Count,
        "Pipeline controller state transitions"
    );
}

/// Record a frame captured by a source.
#[inline]
pub fn record_frame_produced(node: &str, bytes: u64) {
    counter!(FRAMES_PRODUCED, "node" => node.to_string()).increment(1);
    record_bytes_produced(node, bytes);
}

/// Record raw bytes captured.
#[inline]
pub fn record_bytes_produced(node: &str, bytes: u64) {
    counter!(BYTES_PRODUCED, "node" => node.to_string()).increment(bytes);
}

/// Record a frame handled by a transform.
#[inline]
pub fn record_frame_processed(node: &str) {
    counter!(FRAMES_PROCESSED, "node" => node.to_string()).increment(1);
}

/// Record a frame a transform swallowed.
#[inline]
pub fn record_frame_dropped(node: &str) {
    counter!(FRAMES_DROPPED, "node" => node.to_string()).increment(1);
}

/// Record a frame reaching a sink.
#[inline]
pub fn record_frame_rendered(node: &str) {
    counter!(FRAMES_RENDERED, "node" => node.to_string()).increment(1);
}

/// Record an error from the bus.
#[inline]
pub fn record_pipeline_error(node: Option<&str>) {
    counter!(PIPELINE_ERRORS, "node" => node.unwrap_or("-").to_string()).increment(1);
}

/// Record a controller state transition.
#[inline]
pub fn record_state_change(to: &str) {
    counter!(STATE_CHANGES, "state" => to.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_recording_without_recorder() {
        record_frame_produced("source", 1920 * 1080 * 4);
        record_frame_processed("scale-0");
        record_frame_dropped("rate-0");
        record_frame_rendered("display");
        record_pipeline_error(None);
        record_pipeline_error(Some("compositor"));
        record_state_change("Playing");
    }
}
