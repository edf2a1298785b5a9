use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tilecast::config::SessionConfig;
use tilecast::observability;
use tilecast::pipeline::{
    GraphBuilder, OutputMode, PipelineController, Termination, forward_ctrl_c,
};
use tilecast::runtime::{LocalConfig, LocalRuntime, Runtime};
use tilecast::{Error, Result};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Where the composite goes
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum Output {
    /// Show it in a window
    #[default]
    Display,
    /// Encode it into a file
    Record,
    /// Throw it away
    Discard,
}

/// Which runtime executes the pipeline
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum RuntimeKind {
    /// In-process tasks with simulated capture
    #[default]
    Local,
    /// GStreamer elements (needs the `gstreamer` feature)
    Gstreamer,
}

/// tilecast command line arguments
#[derive(Parser, Debug)]
#[command(name = "tilecast")]
#[command(version, about = "Capture a screen and tile it into several scaled streams", long_about = None)]
struct CliArgs {
    /// Session config file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Output of the composite
    #[arg(short = 'o', long, value_name = "MODE", default_value = "display")]
    output: Output,

    /// Target file for `--output record`
    #[arg(short = 'f', long, value_name = "PATH", default_value = "output.mp4")]
    file: PathBuf,

    /// Pipeline runtime
    #[arg(short = 'r', long, value_name = "RUNTIME", default_value = "local")]
    runtime: RuntimeKind,

    /// Simulated screen size for the local runtime
    #[arg(long, value_name = "WxH", default_value = "1920x1080", value_parser = parse_size)]
    capture_size: (u32, u32),

    /// Native capture rate for the local runtime
    #[arg(long, value_name = "FPS", default_value_t = 30)]
    capture_rate: u32,

    /// Stop the local capture after this many frames
    #[arg(long, value_name = "N")]
    frames: Option<u64>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);
    observability::init_metrics();

    tracing::info!("Starting tilecast v{}", env!("CARGO_PKG_VERSION"));

    let session = match SessionConfig::load(&args.config) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("cannot use {}: {}", args.config.display(), e);
            return ExitCode::from(2);
        }
    };
    tracing::info!(
        "{} profiles, {} lines skipped",
        session.profiles.len(),
        session.diagnostics.len()
    );

    let result = match args.runtime {
        RuntimeKind::Local => {
            if args.capture_rate == 0 {
                Err(Error::Config("capture rate must be positive".into()))
            } else {
                let mut config = LocalConfig::default()
                    .with_screen_size(args.capture_size.0, args.capture_size.1)
                    .with_capture_rate(args.capture_rate);
                if let Some(frames) = args.frames {
                    config = config.with_frame_limit(frames);
                }
                run_session(LocalRuntime::new(config), &session, output_mode(&args)).await
            }
        }
        RuntimeKind::Gstreamer => run_gstreamer(&session, output_mode(&args)).await,
    };

    match result {
        Ok(termination) => {
            tracing::info!("pipeline finished: {:?}", termination);
            ExitCode::SUCCESS
        }
        Err(e @ Error::Config(_)) => {
            tracing::error!("{}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(1)
        }
    }
}

fn output_mode(args: &CliArgs) -> OutputMode {
    match args.output {
        Output::Display => OutputMode::Display,
        Output::Record => OutputMode::Record {
            path: args.file.clone(),
        },
        Output::Discard => OutputMode::Discard,
    }
}

/// Build, run and tear down one pipeline on `runtime`.
async fn run_session<R: Runtime>(
    runtime: R,
    session: &SessionConfig,
    output: OutputMode,
) -> Result<Termination> {
    let span = observability::span_pipeline(runtime.name());
    async move {
        let built = GraphBuilder::new(&runtime)
            .with_output(output)
            .build(&session.capture, &session.profiles)?;
        tracing::info!(
            branches = built.branch_count(),
            nodes = built.graph.node_count(),
            links = built.graph.edge_count(),
            "graph built"
        );

        let mut controller = PipelineController::new(runtime);
        controller.construct(built)?;
        controller.start()?;

        let interrupts = controller.interrupt_handle().map(forward_ctrl_c);
        let result = controller.wait_for_termination().await;
        if let Some(task) = interrupts {
            task.abort();
        }
        controller.teardown();
        result
    }
    .instrument(span)
    .await
}

#[cfg(feature = "gstreamer")]
async fn run_gstreamer(session: &SessionConfig, output: OutputMode) -> Result<Termination> {
    let runtime = tilecast::runtime::GstRuntime::new()?;
    run_session(runtime, session, output).await
}

#[cfg(not(feature = "gstreamer"))]
async fn run_gstreamer(_session: &SessionConfig, _output: OutputMode) -> Result<Termination> {
    Err(Error::Config(
        "tilecast was built without the `gstreamer` feature".into(),
    ))
}

fn parse_size(s: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got `{s}`"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| format!("invalid dimension `{v}`"))
    };
    Ok((parse(w)?, parse(h)?))
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "tilecast=error",
        LogLevel::Warn => "tilecast=warn",
        LogLevel::Info => "tilecast=info",
        LogLevel::Verbose => "tilecast=debug,gstreamer=info",
        LogLevel::Debug => "tilecast=debug,gstreamer=debug",
        LogLevel::Trace => "tilecast=trace,gstreamer=debug",
    };

    // RUST_LOG wins
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
