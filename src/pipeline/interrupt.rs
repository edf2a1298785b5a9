//! Turning a process interrupt into a graceful drain.

use crate::pipeline::bus::{ControlSignal, EventSink};
use tokio::task::JoinHandle;

/// Requests end-of-stream on a running graph.
///
/// Cloneable and usable from any task or thread. It never touches controller
/// state: the controller learns about the drain from the bus.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    events: EventSink,
}

impl InterruptHandle {
    /// Wrap the event sink of a running graph.
    pub fn new(events: EventSink) -> Self {
        Self { events }
    }

    /// Inject end-of-stream. Returns `false` if the graph is already gone.
    pub fn request_eos(&self) -> bool {
        self.events.send(ControlSignal::EndOfStream)
    }
}

/// Forward every Ctrl-C to `handle` until the returned task is aborted.
pub fn forward_ctrl_c(handle: InterruptHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("cannot listen for interrupts: {}", e);
                return;
            }
            tracing::info!("interrupt received, draining pipeline");
            if !handle.request_eos() {
                tracing::debug!("pipeline already stopped, ignoring interrupt");
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bus::control_channel;

    #[tokio::test]
    async fn test_request_eos_sends_signal() {
        let (sink, mut receiver) = control_channel();
        let handle = InterruptHandle::new(sink);
        let clone = handle.clone();

        std::thread::spawn(move || clone.request_eos())
            .join()
            .unwrap();
        assert_eq!(receiver.recv().await, Some(ControlSignal::EndOfStream));

        drop(receiver);
        assert!(!handle.request_eos());
    }
}
