//! Spawns one tokio task per node and joins them with kanal channels.

use super::frame::{Frame, pts_for};
use super::nodes::{
    Composite, Convert, DisplaySink, Emitted, Encode, FileSink, Mux, NullSink, Passthrough,
    RateConvert, Scale, Stage, Terminal,
};
use super::{LocalConfig, LocalNode, SinkReport};
use crate::error::{Error, Result};
use crate::node::{NodeKind, NodeSettings, PixelFormat, SinkTarget};
use crate::observability;
use crate::pipeline::bus::{BusMessage, BusSender, ControlReceiver, ControlSignal};
use crate::pipeline::{NodeId, PipelineGraph};
use futures::stream::{self, StreamExt};
use kanal::{AsyncReceiver, AsyncSender, bounded_async};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::Instrument;

/// Message passed between nodes.
#[derive(Debug)]
enum Message {
    Frame(Frame),
    Eos,
}

/// Format decisions pushed onto nodes by link constraints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct Fixation {
    pub size: Option<(u32, u32)>,
    pub framerate: Option<u32>,
    pub format: Option<PixelFormat>,
}

/// Resolve every link constraint onto the node that has to satisfy it.
///
/// Size goes to the nearest upstream scaler, frame rate to the nearest
/// upstream rate converter and pixel layout to the nearest upstream format
/// converter. If none exists before the source, the source takes it, unless
/// a splitter is in the way: a shared source cannot serve one branch.
pub(super) fn fixate(graph: &PipelineGraph<LocalNode>) -> Result<HashMap<NodeId, Fixation>> {
    let mut fixed: HashMap<NodeId, Fixation> = HashMap::new();

    for (up, down, link) in graph.links() {
        let Some(constraint) = link.constraint else {
            continue;
        };
        let describe = || {
            let name = |id| graph.get_node(id).map_or("?", |n| n.name());
            (name(up).to_string(), name(down).to_string())
        };

        if let Some(size) = constraint.size {
            let target = provider(graph, up, NodeKind::Scaler).ok_or_else(|| {
                let (from, to) = describe();
                Error::link(from, to, "no scaler upstream can provide the size")
            })?;
            fixed.entry(target).or_default().size = Some(size);
        }
        if let Some(rate) = constraint.framerate {
            let target = provider(graph, up, NodeKind::RateConverter).ok_or_else(|| {
                let (from, to) = describe();
                Error::link(from, to, "no rate converter upstream can provide the frame rate")
            })?;
            fixed.entry(target).or_default().framerate = Some(rate);
        }
        if let Some(format) = constraint.format {
            let target = provider(graph, up, NodeKind::FormatConverter).ok_or_else(|| {
                let (from, to) = describe();
                Error::link(from, to, "no format converter upstream can provide the format")
            })?;
            fixed.entry(target).or_default().format = Some(format);
        }
    }

    Ok(fixed)
}

/// Walk upstream from `start` to the first node of `kind`, falling back to the source.
fn provider(graph: &PipelineGraph<LocalNode>, start: NodeId, kind: NodeKind) -> Option<NodeId> {
    let mut current = start;
    loop {
        let node = graph.get_node(current)?;
        match node.kind() {
            k if k == kind => return Some(current),
            NodeKind::Source => return Some(current),
            NodeKind::Splitter | NodeKind::Compositor => return None,
            _ => {}
        }
        let parents = graph.parents(current);
        match parents.as_slice() {
            [(parent, _)] => current = *parent,
            _ => return None,
        }
    }
}

type PortKey = (NodeId, String);

/// Channels for every link, keyed by node and port.
struct ChannelNetwork {
    outputs: HashMap<PortKey, AsyncSender<Message>>,
    inputs: HashMap<PortKey, AsyncReceiver<Message>>,
}

impl ChannelNetwork {
    fn build(graph: &PipelineGraph<LocalNode>, config: &LocalConfig) -> Self {
        let mut network = Self {
            outputs: HashMap::new(),
            inputs: HashMap::new(),
        };
        for (up, down, link) in graph.links() {
            let into_queue = graph
                .get_node(down)
                .is_some_and(|n| n.kind() == NodeKind::Queue);
            let capacity = if into_queue {
                config.queue_capacity
            } else {
                config.channel_capacity
            };
            let (tx, rx) = bounded_async::<Message>(capacity);
            network.outputs.insert((up, link.src_port.clone()), tx);
            network.inputs.insert((down, link.sink_port.clone()), rx);
        }
        network
    }

    /// Output senders of a node in port-name order.
    fn take_outputs(&mut self, node: NodeId) -> Vec<AsyncSender<Message>> {
        let mut keys: Vec<PortKey> = self
            .outputs
            .keys()
            .filter(|(n, _)| *n == node)
            .cloned()
            .collect();
        keys.sort_by(|a, b| port_order(&a.1, &b.1));
        keys.iter().filter_map(|k| self.outputs.remove(k)).collect()
    }

    /// Input receivers of a node with their port names, in port-name order.
    fn take_inputs(&mut self, node: NodeId) -> Vec<(String, AsyncReceiver<Message>)> {
        let mut keys: Vec<PortKey> = self
            .inputs
            .keys()
            .filter(|(n, _)| *n == node)
            .cloned()
            .collect();
        keys.sort_by(|a, b| port_order(&a.1, &b.1));
        keys.into_iter()
            .filter_map(|k| {
                let rx = self.inputs.remove(&k)?;
                Some((k.1, rx))
            })
            .collect()
    }
}

/// Orders `sink_2` before `sink_10`.
fn port_order(a: &str, b: &str) -> std::cmp::Ordering {
    let serial = |s: &str| s.rsplit('_').next().and_then(|n| n.parse::<usize>().ok());
    serial(a).cmp(&serial(b)).then_with(|| a.cmp(b))
}

/// Everything the tasks of one run share.
#[derive(Clone)]
struct Shared {
    bus: BusSender,
    sinks_remaining: Arc<AtomicUsize>,
    reports: Arc<Mutex<HashMap<String, SinkReport>>>,
}

/// Spawn the tasks of a validated graph.
pub(super) fn spawn(
    graph: &PipelineGraph<LocalNode>,
    config: &LocalConfig,
    bus: BusSender,
    control: ControlReceiver,
    reports: Arc<Mutex<HashMap<String, SinkReport>>>,
) -> Result<Vec<JoinHandle<()>>> {
    let fixed = fixate(graph)?;
    let mut channels = ChannelNetwork::build(graph, config);
    let shared = Shared {
        bus,
        sinks_remaining: Arc::new(AtomicUsize::new(graph.sinks().len())),
        reports,
    };

    // open sinks first so a bad path fails the start, not the run
    let mut terminals: HashMap<NodeId, Box<dyn Terminal>> = HashMap::new();
    for id in graph.sinks() {
        let node = lookup(graph, id)?;
        let terminal: Box<dyn Terminal> = match &node.inner().settings {
            NodeSettings::Sink(SinkTarget::Display) => Box::new(DisplaySink::new(node.name())),
            NodeSettings::Sink(SinkTarget::File(path)) => Box::new(FileSink::create(path)?),
            _ => Box::new(NullSink),
        };
        terminals.insert(id, terminal);
    }

    let mut control = Some(control);
    let mut tasks = TaskSet(Vec::with_capacity(graph.node_count()));
    for id in graph.node_ids() {
        let node = lookup(graph, id)?;
        let name = node.name().to_string();
        let fixation = fixed.get(&id).copied().unwrap_or_default();
        let fault = config
            .fault
            .as_ref()
            .filter(|f| f.node == name)
            .map(|f| f.after_frames);
        let inputs = channels.take_inputs(id);
        let outputs = channels.take_outputs(id);
        let shared = shared.clone();
        let span = observability::span_node(&name, node.kind().as_str());

        let task = match node.kind() {
            NodeKind::Source => {
                let control = control.take().ok_or_else(|| Error::Runtime {
                    message: "graph has more than one source".into(),
                    node: Some(name.clone()),
                })?;
                let capture = CaptureConfig {
                    width: fixation.size.map_or(config.screen_size.0, |s| s.0),
                    height: fixation.size.map_or(config.screen_size.1, |s| s.1),
                    rate: fixation.framerate.unwrap_or(config.capture_rate),
                    format: fixation.format.unwrap_or(PixelFormat::Bgrx),
                    limit: config.frame_limit,
                    realtime: config.realtime,
                };
                tracing::debug!(
                    "{} captures {}x{}@{} {}",
                    name,
                    capture.width,
                    capture.height,
                    capture.rate,
                    capture.format
                );
                tokio::spawn(
                    source_task(name, capture, outputs, control, fault, shared).instrument(span),
                )
            }
            NodeKind::Splitter => {
                let rx = single_input(&name, inputs)?;
                tokio::spawn(splitter_task(name, rx, outputs, fault, shared).instrument(span))
            }
            NodeKind::Compositor => {
                let (width, height, framerate) = match node.inner().settings {
                    NodeSettings::Canvas {
                        width,
                        height,
                        framerate,
                    } => (width, height, framerate),
                    _ => (config.screen_size.0, config.screen_size.1, config.capture_rate),
                };
                let tiles = inputs
                    .iter()
                    .map(|(port, _)| node.inner().placement(port))
                    .collect();
                let composite = Composite::new(width, height, framerate, tiles);
                let receivers = inputs.into_iter().map(|(_, rx)| rx).collect();
                tokio::spawn(
                    compositor_task(name, composite, receivers, outputs, fault, shared)
                        .instrument(span),
                )
            }
            NodeKind::Sink => {
                let rx = single_input(&name, inputs)?;
                let terminal = terminals.remove(&id).ok_or_else(|| Error::Runtime {
                    message: "sink has downstream links".into(),
                    node: Some(name.clone()),
                })?;
                tokio::spawn(sink_task(name, terminal, rx, fault, shared).instrument(span))
            }
            kind => {
                let rx = single_input(&name, inputs)?;
                let stage: Box<dyn Stage> = match kind {
                    NodeKind::RateConverter => Box::new(RateConvert::new(fixation.framerate)),
                    NodeKind::Scaler => Box::new(Scale::new(fixation.size)),
                    NodeKind::FormatConverter => Box::new(Convert::new(fixation.format)),
                    NodeKind::Encoder => Box::new(Encode::new(u64::from(config.capture_rate))),
                    NodeKind::Muxer => Box::new(Mux::default()),
                    _ => Box::new(Passthrough),
                };
                tokio::spawn(
                    transform_task(name, stage, rx, outputs, fault, shared).instrument(span),
                )
            }
        };
        tasks.0.push(task);
    }

    Ok(std::mem::take(&mut tasks.0))
}

/// Aborts whatever it still holds when dropped, so a failed start leaves nothing running.
struct TaskSet(Vec<JoinHandle<()>>);

impl Drop for TaskSet {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

fn lookup(graph: &PipelineGraph<LocalNode>, id: NodeId) -> Result<&crate::pipeline::Node<LocalNode>> {
    graph.get_node(id).ok_or_else(|| Error::Runtime {
        message: format!("node {} vanished", id.index()),
        node: None,
    })
}

fn single_input(
    name: &str,
    inputs: Vec<(String, AsyncReceiver<Message>)>,
) -> Result<AsyncReceiver<Message>> {
    let mut inputs = inputs.into_iter();
    match (inputs.next(), inputs.next()) {
        (Some((_, rx)), None) => Ok(rx),
        _ => Err(Error::Runtime {
            message: "expected exactly one linked input".into(),
            node: Some(name.to_string()),
        }),
    }
}

/// Posts an error once a node has handled `after` frames.
fn tripped(fault: Option<u64>, frames: u64, name: &str, shared: &Shared) -> bool {
    if fault.is_some_and(|after| frames >= after) {
        tracing::error!("{} failing after {} frames", name, frames);
        shared
            .bus
            .post_error(format!("injected failure after {frames} frames"), Some(name.to_string()));
        return true;
    }
    false
}

async fn send_all(name: &str, outputs: &mut Vec<AsyncSender<Message>>, frames: Emitted) {
    for frame in frames {
        let mut i = 0;
        while i < outputs.len() {
            if outputs[i].send(Message::Frame(frame.clone())).await.is_ok() {
                i += 1;
            } else {
                tracing::warn!("{}: downstream receiver dropped", name);
                outputs.remove(i);
            }
        }
    }
}

async fn send_eos(outputs: &[AsyncSender<Message>]) {
    for tx in outputs {
        let _ = tx.send(Message::Eos).await;
    }
}

struct CaptureConfig {
    width: u32,
    height: u32,
    rate: u32,
    format: PixelFormat,
    limit: Option<u64>,
    realtime: bool,
}

/// Wait for the next capture tick, returning any control signal that arrived first.
async fn next_tick(
    pacer: &mut Option<Interval>,
    control: &mut ControlReceiver,
    listening: &mut bool,
) -> Option<ControlSignal> {
    match pacer {
        Some(interval) if *listening => tokio::select! {
            biased;
            signal = control.recv() => {
                if signal.is_none() {
                    *listening = false;
                }
                signal
            }
            _ = interval.tick() => None,
        },
        Some(interval) => {
            interval.tick().await;
            None
        }
        None => {
            tokio::task::yield_now().await;
            control.try_recv()
        }
    }
}

async fn source_task(
    name: String,
    capture: CaptureConfig,
    mut outputs: Vec<AsyncSender<Message>>,
    mut control: ControlReceiver,
    fault: Option<u64>,
    shared: Shared,
) {
    tracing::debug!("source task '{}' started", name);
    shared.bus.post_node_started(&name);

    let mut pacer = capture.realtime.then(|| {
        let mut interval = tokio::time::interval(pts_for(1, capture.rate));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut listening = true;
    let mut produced: u64 = 0;

    loop {
        if capture.limit.is_some_and(|limit| produced >= limit) {
            tracing::info!("{} finished after {} frames", name, produced);
            break;
        }
        if let Some(ControlSignal::EndOfStream) =
            next_tick(&mut pacer, &mut control, &mut listening).await
        {
            tracing::info!("{} received end-of-stream request after {} frames", name, produced);
            shared.bus.post(BusMessage::DrainRequested);
            break;
        }
        if tripped(fault, produced, &name, &shared) {
            return;
        }

        let frame = Frame::raw(
            produced,
            pts_for(produced, capture.rate),
            capture.width,
            capture.height,
            capture.format,
        );
        observability::record_frame_produced(&name, frame.byte_size());
        produced += 1;

        let mut emitted = Emitted::new();
        emitted.push(frame);
        send_all(&name, &mut outputs, emitted).await;
        if outputs.is_empty() {
            tracing::warn!("{}: no downstream left, stopping", name);
            break;
        }
    }

    send_eos(&outputs).await;
    tracing::debug!("source task '{}' finished", name);
    shared.bus.post_node_finished(&name, produced);
}

async fn splitter_task(
    name: String,
    rx: AsyncReceiver<Message>,
    mut outputs: Vec<AsyncSender<Message>>,
    fault: Option<u64>,
    shared: Shared,
) {
    tracing::debug!("splitter task '{}' started with {} outputs", name, outputs.len());
    shared.bus.post_node_started(&name);
    let mut frames: u64 = 0;

    while let Ok(Message::Frame(frame)) = rx.recv().await {
        if tripped(fault, frames, &name, &shared) {
            return;
        }
        frames += 1;
        let before = outputs.len();
        let mut emitted = Emitted::new();
        emitted.push(frame);
        send_all(&name, &mut outputs, emitted).await;
        if outputs.len() < before {
            shared
                .bus
                .post_warning("a branch stopped accepting frames", Some(name.clone()));
        }
    }

    // end-of-stream or upstream gone
    send_eos(&outputs).await;
    tracing::debug!("splitter task '{}' finished", name);
    shared.bus.post_node_finished(&name, frames);
}

async fn transform_task(
    name: String,
    mut stage: Box<dyn Stage>,
    rx: AsyncReceiver<Message>,
    mut outputs: Vec<AsyncSender<Message>>,
    fault: Option<u64>,
    shared: Shared,
) {
    tracing::debug!("transform task '{}' started", name);
    shared.bus.post_node_started(&name);
    let mut frames: u64 = 0;

    while let Ok(Message::Frame(frame)) = rx.recv().await {
        if tripped(fault, frames, &name, &shared) {
            return;
        }
        frames += 1;
        observability::record_frame_processed(&name);
        let mut emitted = Emitted::new();
        if let Err(e) = stage.process(frame, &mut emitted) {
            tracing::error!("transform '{}' error: {}", name, e);
            shared.bus.post_error(e.to_string(), Some(name.clone()));
            return;
        }
        if emitted.is_empty() {
            observability::record_frame_dropped(&name);
        }
        send_all(&name, &mut outputs, emitted).await;
    }

    let mut emitted = Emitted::new();
    if let Err(e) = stage.finish(&mut emitted) {
        shared.bus.post_error(e.to_string(), Some(name.clone()));
        return;
    }
    send_all(&name, &mut outputs, emitted).await;
    send_eos(&outputs).await;
    tracing::debug!("transform task '{}' finished", name);
    shared.bus.post_node_finished(&name, frames);
}

async fn compositor_task(
    name: String,
    mut composite: Composite,
    inputs: Vec<AsyncReceiver<Message>>,
    mut outputs: Vec<AsyncSender<Message>>,
    fault: Option<u64>,
    shared: Shared,
) {
    tracing::debug!("compositor task '{}' started with {} inputs", name, inputs.len());
    shared.bus.post_node_started(&name);

    // each input ends at its own end-of-stream; the merge ends when all have
    let streams = inputs.into_iter().enumerate().map(|(i, rx)| {
        stream::unfold(rx, move |rx| async move {
            match rx.recv().await {
                Ok(Message::Frame(frame)) => Some(((i, frame), rx)),
                Ok(Message::Eos) | Err(_) => None,
            }
        })
        .boxed()
    });
    let mut merged = stream::select_all(streams);
    let mut frames: u64 = 0;

    while let Some((input, frame)) = merged.next().await {
        if tripped(fault, frames, &name, &shared) {
            return;
        }
        frames += 1;
        let mut emitted = Emitted::new();
        if let Some(warning) = composite.push(input, frame, &mut emitted) {
            tracing::warn!("{}: {}", name, warning);
            shared.bus.post_warning(warning, Some(name.clone()));
        }
        send_all(&name, &mut outputs, emitted).await;
    }

    send_eos(&outputs).await;
    tracing::debug!("compositor task '{}' finished", name);
    shared.bus.post_node_finished(&name, frames);
}

async fn sink_task(
    name: String,
    mut terminal: Box<dyn Terminal>,
    rx: AsyncReceiver<Message>,
    fault: Option<u64>,
    shared: Shared,
) {
    tracing::debug!("sink task '{}' started", name);
    shared.bus.post_node_started(&name);
    let mut report = SinkReport::default();

    loop {
        match rx.recv().await {
            Ok(Message::Frame(frame)) => {
                if tripped(fault, report.frames, &name, &shared) {
                    return;
                }
                if let Err(e) = terminal.consume(&frame) {
                    tracing::error!("sink '{}' error: {}", name, e);
                    shared.bus.post_error(e.to_string(), Some(name.clone()));
                    return;
                }
                observability::record_frame_rendered(&name);
                report.record(&frame);
            }
            Ok(Message::Eos) => {
                tracing::debug!("sink '{}' received EOS", name);
                break;
            }
            Err(_) => {
                tracing::debug!("sink '{}': channel closed", name);
                break;
            }
        }
    }

    if let Err(e) = terminal.finish() {
        shared.bus.post_error(e.to_string(), Some(name.clone()));
        return;
    }

    let frames = report.frames;
    if let Ok(mut reports) = shared.reports.lock() {
        reports.insert(name.clone(), report);
    }
    tracing::debug!("sink task '{}' finished", name);
    shared.bus.post_node_finished(&name, frames);

    if shared.sinks_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
        shared.bus.post_eos();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::FormatConstraint;
    use crate::pipeline::{GraphBuilder, OutputMode};
    use crate::profile::{CaptureTarget, StreamProfile};
    use crate::runtime::LocalRuntime;

    fn build(profiles: &[(u32, u32, u32)]) -> (LocalRuntime, crate::pipeline::BuiltGraph<LocalNode>) {
        let rt = LocalRuntime::new(LocalConfig::default());
        let profiles: Vec<_> = profiles
            .iter()
            .map(|&(w, h, f)| StreamProfile::new(w, h, f).unwrap())
            .collect();
        let built = GraphBuilder::new(&rt)
            .with_output(OutputMode::Discard)
            .build(&CaptureTarget::default(), &profiles)
            .unwrap();
        (rt, built)
    }

    #[test]
    fn test_fixation_multi_branch() {
        let (_rt, built) = build(&[(640, 480, 5), (1280, 720, 30)]);
        let fixed = fixate(&built.graph).unwrap();

        for branch in &built.branches {
            let scaler = fixed[&branch.scaler];
            assert_eq!(
                scaler.size,
                Some((branch.profile.width(), branch.profile.height()))
            );
            let rate = fixed[&branch.rate_converter.unwrap()];
            assert_eq!(rate.framerate, Some(branch.profile.framerate()));
        }
        let source = built.graph.sources()[0];
        assert!(!fixed.contains_key(&source));
    }

    #[test]
    fn test_fixation_single_branch_uses_source_rate() {
        let (_rt, built) = build(&[(640, 480, 10)]);
        let fixed = fixate(&built.graph).unwrap();
        let source = built.graph.sources()[0];
        assert_eq!(fixed[&source].framerate, Some(10));
        assert_eq!(fixed[&source].size, None);
        assert_eq!(fixed[&built.branches[0].scaler].size, Some((640, 480)));
    }

    #[test]
    fn test_port_order() {
        let mut ports = vec!["sink_10", "sink_2", "sink_0"];
        ports.sort_by(|a, b| port_order(a, b));
        assert_eq!(ports, vec!["sink_0", "sink_2", "sink_10"]);
    }

    #[test]
    fn test_constraint_behind_splitter_is_rejected() {
        let rt = LocalRuntime::new(LocalConfig::default());
        let mut graph = PipelineGraph::new();
        let spec = |kind, name: &str| crate::node::NodeSpec::new(kind, name);
        use crate::runtime::Runtime;
        let src = graph.add_node(rt.create_node(&spec(NodeKind::Source, "source")).unwrap());
        let split = graph.add_node(rt.create_node(&spec(NodeKind::Splitter, "split")).unwrap());
        let conv = graph.add_node(rt.create_node(&spec(NodeKind::FormatConverter, "conv")).unwrap());
        graph.link(src, split).unwrap();
        let port = graph
            .request_port(split, crate::node::PortDirection::Output)
            .unwrap();
        let c = FormatConstraint {
            framerate: Some(5),
            ..FormatConstraint::any()
        };
        graph
            .link_ports(split, conv, crate::pipeline::Link::with_ports(port, "sink").constrained(c))
            .unwrap();
        assert!(matches!(fixate(&graph), Err(Error::Link { .. })));
    }
}
