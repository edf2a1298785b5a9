//! Teardown guarantees, checked with a runtime that counts node releases.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tilecast::layout::LayoutTile;
use tilecast::node::{FormatConstraint, NodeKind, NodeSpec, PortDirection, ProcessingNode};
use tilecast::pipeline::bus::{BusSender, ControlReceiver, ControlSignal, bus, control_channel};
use tilecast::pipeline::{GraphBuilder, PipelineController, PipelineGraph, PipelineState};
use tilecast::profile::{CaptureTarget, StreamProfile};
use tilecast::runtime::{Running, Runtime};
use tilecast::{Error, Result};

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    released: AtomicUsize,
    stops: AtomicUsize,
}

struct CountingNode {
    name: String,
    kind: NodeKind,
    ports: usize,
    counters: Arc<Counters>,
    released: bool,
}

impl ProcessingNode for CountingNode {
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
            .ok_or_else(|| Error::Config("no request ports".into()))?;
        self.ports += 1;
        Ok(template.instantiate(self.ports - 1))
    }

    fn set_placement(&mut self, _port: &str, _tile: &LayoutTile) -> Result<()> {
        Ok(())
    }

    fn release(&mut self) {
        assert!(!self.released, "{} released twice", self.name);
        self.released = true;
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CountingRuntime {
    counters: Arc<Counters>,
    missing: Option<&'static str>,
    unlinkable: Option<(&'static str, &'static str)>,
    refuse_start: bool,
    unnegotiated_at_start: bool,
    wires: Mutex<Option<(BusSender, ControlReceiver)>>,
}

impl Runtime for CountingRuntime {
    type Node = CountingNode;

    fn name(&self) -> &'static str {
        "counting"
    }

    fn create_node(&self, spec: &NodeSpec) -> Result<CountingNode> {
        if self.missing == Some(spec.name.as_str()) {
            return Err(Error::Runtime {
                message: "plugin missing".into(),
                node: Some(spec.name.clone()),
            });
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(CountingNode {
            name: spec.name.clone(),
            kind: spec.kind,
            ports: 0,
            counters: self.counters.clone(),
            released: false,
        })
    }

    fn link(
        &self,
        from: &CountingNode,
        _: &str,
        to: &CountingNode,
        _: &str,
        constraint: Option<&FormatConstraint>,
    ) -> Result<()> {
        match self.unlinkable {
            Some((up, down)) if constraint.is_some() && from.name == up && to.name == down => {
                Err(Error::link(up, down, "not negotiated"))
            }
            _ => Ok(()),
        }
    }

    fn start(&self, _graph: &mut PipelineGraph<CountingNode>) -> Result<Running> {
        if self.unnegotiated_at_start {
            return Err(Error::link("split", "convert-0", "framerate cannot be fixed"));
        }
        if self.refuse_start {
            return Err(Error::Runtime {
                message: "device busy".into(),
                node: None,
            });
        }
        let (sender, receiver) = bus();
        let (events, control) = control_channel();
        *self.wires.lock().unwrap() = Some((sender, control));
        Ok(Running {
            bus: receiver,
            events,
        })
    }

    fn stop(&self, _graph: &mut PipelineGraph<CountingNode>) {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn three_profiles() -> Vec<StreamProfile> {
    [(426, 240, 5), (640, 480, 15), (1280, 720, 30)]
        .iter()
        .map(|&(w, h, f)| StreamProfile::new(w, h, f).unwrap())
        .collect()
}

fn ready(runtime: CountingRuntime) -> PipelineController<CountingRuntime> {
    let built = GraphBuilder::new(&runtime)
        .build(&CaptureTarget::display(0), &three_profiles())
        .unwrap();
    let mut controller = PipelineController::new(runtime);
    controller.construct(built).unwrap();
    controller
}

#[test]
fn test_partial_build_releases_what_was_created() {
    let runtime = CountingRuntime {
        missing: Some("compositor"),
        ..Default::default()
    };
    let Err(err) = GraphBuilder::new(&runtime).build(&CaptureTarget::default(), &three_profiles())
    else {
        panic!("build succeeded without a compositor");
    };

    assert!(matches!(
        err,
        Error::GraphConstruction { ref stage, kind: NodeKind::Compositor, .. } if stage == "compositor"
    ));
    let created = runtime.counters.created.load(Ordering::SeqCst);
    // source, splitter and four nodes per branch
    assert_eq!(created, 2 + 3 * 4);
    assert_eq!(runtime.counters.released.load(Ordering::SeqCst), created);
}

#[test]
fn test_refused_link_releases_what_was_created() {
    let runtime = CountingRuntime {
        unlinkable: Some(("scale-1", "convert-1")),
        ..Default::default()
    };
    let Err(err) = GraphBuilder::new(&runtime).build(&CaptureTarget::default(), &three_profiles())
    else {
        panic!("build succeeded across an unlinkable pair");
    };

    assert!(matches!(
        err,
        Error::Link { ref from, ref to, .. } if from == "scale-1" && to == "convert-1"
    ));
    let created = runtime.counters.created.load(Ordering::SeqCst);
    assert!(created > 0);
    assert_eq!(runtime.counters.released.load(Ordering::SeqCst), created);
}

#[test]
fn test_unnegotiated_start_keeps_link_error() {
    let counters = Arc::new(Counters::default());
    let mut controller = ready(CountingRuntime {
        counters: counters.clone(),
        unnegotiated_at_start: true,
        ..Default::default()
    });

    let err = controller.start().unwrap_err();
    assert!(matches!(err, Error::Link { ref to, .. } if to == "convert-0"));
    assert_eq!(controller.state(), PipelineState::Failed);
    assert_eq!(
        counters.released.load(Ordering::SeqCst),
        counters.created.load(Ordering::SeqCst)
    );
}

#[test]
fn test_failed_start_releases_every_node_once() {
    let counters = Arc::new(Counters::default());
    let mut controller = ready(CountingRuntime {
        counters: counters.clone(),
        refuse_start: true,
        ..Default::default()
    });
    let nodes = counters.created.load(Ordering::SeqCst);

    let err = controller.start().unwrap_err();
    assert!(matches!(err, Error::StateTransition { .. }));
    assert_eq!(controller.state(), PipelineState::Failed);
    assert_eq!(counters.released.load(Ordering::SeqCst), nodes);

    controller.teardown();
    drop(controller);
    assert_eq!(counters.released.load(Ordering::SeqCst), nodes);
    assert_eq!(counters.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_interrupt_then_eos_stops_and_tears_down_once() {
    let counters = Arc::new(Counters::default());
    let mut controller = ready(CountingRuntime {
        counters: counters.clone(),
        ..Default::default()
    });
    controller.start().unwrap();
    assert_eq!(controller.state(), PipelineState::Playing);

    let handle = controller.interrupt_handle().unwrap();
    assert!(handle.request_eos());
    {
        let mut wires = controller.runtime().wires.lock().unwrap();
        let (sender, control) = wires.as_mut().unwrap();
        assert_eq!(control.try_recv(), Some(ControlSignal::EndOfStream));
        sender.post(tilecast::pipeline::BusMessage::DrainRequested);
        sender.post_eos();
    }

    controller.wait_for_termination().await.unwrap();
    assert_eq!(controller.state(), PipelineState::Stopped);

    let nodes = counters.created.load(Ordering::SeqCst);
    controller.teardown();
    controller.teardown();
    drop(controller);
    assert_eq!(counters.released.load(Ordering::SeqCst), nodes);
    assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_error_fails_without_waiting_for_eos() {
    let counters = Arc::new(Counters::default());
    let mut controller = ready(CountingRuntime {
        counters: counters.clone(),
        ..Default::default()
    });
    controller.start().unwrap();
    {
        let wires = controller.runtime().wires.lock().unwrap();
        let (sender, _) = wires.as_ref().unwrap();
        sender.post_error("not negotiated", Some("scale-2".into()));
    }

    let err = controller.wait_for_termination().await.unwrap_err();
    assert!(matches!(err, Error::Runtime { node: Some(ref n), .. } if n == "scale-2"));
    assert_eq!(controller.state(), PipelineState::Failed);

    drop(controller);
    assert_eq!(
        counters.released.load(Ordering::SeqCst),
        counters.created.load(Ordering::SeqCst)
    );
    assert_eq!(counters.stops.load(Ordering::SeqCst), 1);
}
