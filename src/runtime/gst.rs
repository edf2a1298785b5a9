//! GStreamer runtime.
//!
//! Every node is one GStreamer element inside a single `gst::Pipeline`:
//!
//! | Kind | Element |
//! |------|---------|
//! | Source | `ximagesrc` |
//! | Splitter | `tee` |
//! | Queue | `queue` |
//! | RateConverter | `videorate` |
//! | Scaler | `videoscale` |
//! | FormatConverter | `videoconvert` |
//! | Compositor | `compositor` |
//! | Encoder | `x264enc` |
//! | Muxer | `mp4mux` |
//! | Sink | `autovideosink`, `filesink` or `fakesink` |
//!
//! Link constraints become caps filters. The GStreamer bus is pumped on a
//! dedicated thread and translated into [`BusMessage`]s.

use crate::error::{Error, Result};
use crate::layout::LayoutTile;
use crate::node::{
    FormatConstraint, NodeKind, NodeSettings, NodeSpec, PortDirection, ProcessingNode, SinkTarget,
};
use crate::pipeline::PipelineGraph;
use crate::pipeline::bus::{
    BusMessage, BusSender, ControlReceiver, ControlSignal, bus, control_channel,
};
use crate::runtime::{Running, Runtime};
use gstreamer as gst;
use gstreamer::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const BUS_POLL: Duration = Duration::from_millis(100);

fn factory_for(spec: &NodeSpec) -> &'static str {
    match spec.kind {
        NodeKind::Source => "ximagesrc",
        NodeKind::Splitter => "tee",
        NodeKind::Queue => "queue",
        NodeKind::RateConverter => "videorate",
        NodeKind::Scaler => "videoscale",
        NodeKind::FormatConverter => "videoconvert",
        NodeKind::Compositor => "compositor",
        NodeKind::Encoder => "x264enc",
        NodeKind::Muxer => "mp4mux",
        NodeKind::Sink => match &spec.settings {
            NodeSettings::Sink(SinkTarget::Display) => "autovideosink",
            NodeSettings::Sink(SinkTarget::File(_)) => "filesink",
            _ => "fakesink",
        },
    }
}

fn raw_caps(constraint: &FormatConstraint) -> gst::Caps {
    let mut caps = gst::Caps::builder("video/x-raw");
    if let Some((width, height)) = constraint.size {
        caps = caps
            .field("width", clamp_i32(width))
            .field("height", clamp_i32(height));
    }
    if let Some(rate) = constraint.framerate {
        caps = caps.field("framerate", gst::Fraction::new(clamp_i32(rate), 1));
    }
    if let Some(format) = constraint.format {
        caps = caps.field("format", format.as_str());
    }
    caps.build()
}

fn clamp_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

/// A node backed by a GStreamer element.
#[derive(Debug)]
pub struct GstNode {
    name: String,
    kind: NodeKind,
    element: gst::Element,
    canvas: Option<FormatConstraint>,
    request_pads: Vec<gst::Pad>,
    released: bool,
}

impl GstNode {
    /// The wrapped element.
    pub fn element(&self) -> &gst::Element {
        &self.element
    }

    fn pad(&self, name: &str) -> Option<&gst::Pad> {
        self.request_pads.iter().find(|p| p.name().as_str() == name)
    }

    fn fail(&self, message: impl Into<String>) -> Error {
        Error::Runtime {
            message: message.into(),
            node: Some(self.name.clone()),
        }
    }
}

impl ProcessingNode for GstNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn request_port(&mut self, direction: PortDirection) -> Result<String> {
        let template = self
            .kind
            .request_template(direction)
            .ok_or_else(|| self.fail(format!("{} has no request {:?} ports", self.kind, direction)))?;
        let pad = self
            .element
            .request_pad_simple(template.name)
            .ok_or_else(|| self.fail(format!("pad request for {} refused", template.name)))?;
        let name = pad.name().to_string();
        self.request_pads.push(pad);
        Ok(name)
    }

    fn set_placement(&mut self, port: &str, tile: &LayoutTile) -> Result<()> {
        let pad = self
            .pad(port)
            .ok_or_else(|| self.fail(format!("no requested pad {port}")))?;
        pad.set_property("xpos", tile.x);
        pad.set_property("ypos", tile.y);
        pad.set_property("width", clamp_i32(tile.width));
        pad.set_property("height", clamp_i32(tile.height));
        tracing::debug!(
            "{}.{} placed at {},{} {}x{}",
            self.name,
            port,
            tile.x,
            tile.y,
            tile.width,
            tile.height
        );
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = self.element.set_state(gst::State::Null);
        for pad in self.request_pads.drain(..) {
            self.element.release_request_pad(&pad);
        }
        if let Some(bin) = self
            .element
            .parent()
            .and_then(|p| p.downcast::<gst::Bin>().ok())
        {
            if let Err(e) = bin.remove(&self.element) {
                tracing::warn!("cannot remove {} from pipeline: {}", self.name, e);
            }
        }
    }
}

/// Threads and tasks that exist while the pipeline plays.
struct Bridge {
    stop: Arc<AtomicBool>,
    pump: thread::JoinHandle<()>,
    control: tokio::task::JoinHandle<()>,
}

/// Runs a graph as a GStreamer pipeline.
pub struct GstRuntime {
    pipeline: gst::Pipeline,
    bridge: Mutex<Option<Bridge>>,
}

impl GstRuntime {
    /// Initialise GStreamer and create an empty pipeline.
    pub fn new() -> Result<Self> {
        gst::init().map_err(|e| Error::Runtime {
            message: format!("gstreamer init failed: {e}"),
            node: None,
        })?;
        Ok(Self {
            pipeline: gst::Pipeline::with_name("tilecast"),
            bridge: Mutex::new(None),
        })
    }

    fn configure(&self, spec: &NodeSpec, element: &gst::Element) {
        match (&spec.kind, &spec.settings) {
            (NodeKind::Source, NodeSettings::Capture(target)) => {
                if target.has_display() {
                    element.set_property("display-name", format!(":{}", target.display_id));
                }
                element.set_property("startx", u32::try_from(target.origin_x).unwrap_or(0));
                element.set_property("starty", u32::try_from(target.origin_y).unwrap_or(0));
                element.set_property("use-damage", false);
            }
            (NodeKind::Sink, NodeSettings::Sink(SinkTarget::File(path))) => {
                element.set_property("location", path.to_string_lossy().to_string());
            }
            (NodeKind::Encoder, _) => {
                element.set_property_from_str("tune", "zerolatency");
            }
            _ => {}
        }
    }
}

impl Runtime for GstRuntime {
    type Node = GstNode;

    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn create_node(&self, spec: &NodeSpec) -> Result<GstNode> {
        let factory = factory_for(spec);
        let fail = |message: String| Error::Runtime {
            message,
            node: Some(spec.name.clone()),
        };
        let element = gst::ElementFactory::make(factory)
            .name(spec.name.as_str())
            .build()
            .map_err(|e| fail(format!("cannot create {factory}: {e}")))?;
        self.configure(spec, &element);
        self.pipeline
            .add(&element)
            .map_err(|e| fail(format!("cannot add {factory} to pipeline: {e}")))?;

        let canvas = match spec.settings {
            NodeSettings::Canvas {
                width,
                height,
                framerate,
            } => Some(FormatConstraint {
                size: Some((width, height)),
                framerate: Some(framerate),
                format: None,
            }),
            _ => None,
        };
        tracing::debug!("created {} '{}'", factory, spec.name);

        Ok(GstNode {
            name: spec.name.clone(),
            kind: spec.kind,
            element,
            canvas,
            request_pads: Vec::new(),
            released: false,
        })
    }

    fn link(
        &self,
        upstream: &GstNode,
        src_port: &str,
        downstream: &GstNode,
        sink_port: &str,
        constraint: Option<&FormatConstraint>,
    ) -> Result<()> {
        // mp4mux hands out its own request pads
        let sink_pad = (downstream.kind != NodeKind::Muxer).then_some(sink_port);
        let filter = constraint.or(upstream.canvas.as_ref()).map(raw_caps);

        let linked = match &filter {
            Some(caps) => upstream.element.link_pads_filtered(
                Some(src_port),
                &downstream.element,
                sink_pad,
                caps,
            ),
            None => upstream
                .element
                .link_pads(Some(src_port), &downstream.element, sink_pad),
        };
        linked.map_err(|e| {
            Error::link(
                format!("{}.{}", upstream.name, src_port),
                format!("{}.{}", downstream.name, sink_port),
                e.to_string(),
            )
        })
    }

    fn start(&self, graph: &mut PipelineGraph<GstNode>) -> Result<Running> {
        graph.validate()?;
        let handle = tokio::runtime::Handle::try_current().map_err(|_| Error::Runtime {
            message: "gstreamer runtime must be started inside a tokio runtime".into(),
            node: None,
        })?;
        let gst_bus = self.pipeline.bus().ok_or_else(|| Error::Runtime {
            message: "pipeline has no bus".into(),
            node: None,
        })?;

        let (sender, receiver) = bus();
        let (events, control) = control_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let pump = {
            let sender = sender.clone();
            let stop = stop.clone();
            let pipeline_name = self.pipeline.name().to_string();
            thread::Builder::new()
                .name("tilecast-bus".into())
                .spawn(move || pump_bus(gst_bus, sender, stop, pipeline_name))?
        };
        let control = handle.spawn(forward_control(control, self.pipeline.clone(), sender));

        let bridge = Bridge {
            stop,
            pump,
            control,
        };
        if let Err(e) = self.pipeline.set_state(gst::State::Playing) {
            shutdown(bridge);
            let _ = self.pipeline.set_state(gst::State::Null);
            return Err(Error::Runtime {
                message: format!("pipeline refused to play: {e}"),
                node: None,
            });
        }
        tracing::info!("gstreamer pipeline playing with {} elements", graph.node_count());

        if let Ok(mut slot) = self.bridge.lock() {
            if let Some(old) = slot.replace(bridge) {
                shutdown(old);
            }
        }
        Ok(Running {
            bus: receiver,
            events,
        })
    }

    fn stop(&self, _graph: &mut PipelineGraph<GstNode>) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            tracing::warn!("pipeline did not reach NULL: {}", e);
        }
        let bridge = self.bridge.lock().ok().and_then(|mut slot| slot.take());
        if let Some(bridge) = bridge {
            shutdown(bridge);
        }
    }
}

fn shutdown(bridge: Bridge) {
    bridge.stop.store(true, Ordering::SeqCst);
    bridge.control.abort();
    if bridge.pump.join().is_err() {
        tracing::warn!("bus thread panicked");
    }
}

async fn forward_control(mut control: ControlReceiver, pipeline: gst::Pipeline, sender: BusSender) {
    while let Some(signal) = control.recv().await {
        match signal {
            ControlSignal::EndOfStream => {
                tracing::info!("sending end-of-stream into the pipeline");
                if pipeline.send_event(gst::event::Eos::new()) {
                    sender.post(BusMessage::DrainRequested);
                } else {
                    sender.post_warning("pipeline rejected end-of-stream", None);
                }
            }
        }
    }
}

fn pump_bus(gst_bus: gst::Bus, sender: BusSender, stop: Arc<AtomicBool>, pipeline_name: String) {
    let timeout = gst::ClockTime::from_mseconds(BUS_POLL.as_millis() as u64);
    while !stop.load(Ordering::SeqCst) {
        let Some(message) = gst_bus.timed_pop(timeout) else {
            continue;
        };
        let source = message.src().map(|s| s.name().to_string());

        let translated = match message.view() {
            gst::MessageView::Eos(_) => Some(BusMessage::EndOfStream),
            gst::MessageView::Error(err) => Some(BusMessage::Error {
                message: match err.debug() {
                    Some(debug) => format!("{} ({})", err.error(), debug),
                    None => err.error().to_string(),
                },
                node: source,
            }),
            gst::MessageView::Warning(warning) => Some(BusMessage::Warning {
                message: warning.error().to_string(),
                node: source,
            }),
            gst::MessageView::StateChanged(change) => {
                source
                    .filter(|name| *name == pipeline_name)
                    .map(|node| BusMessage::StateChanged {
                        node,
                        from: format!("{:?}", change.old()),
                        to: format!("{:?}", change.current()),
                    })
            }
            _ => None,
        };

        if let Some(translated) = translated {
            let terminal = translated.is_terminal();
            if !sender.post(translated) || terminal {
                break;
            }
        }
    }
    tracing::debug!("bus thread finished");
}
