mod config;
mod diagnostics;
mod display;
mod error;
mod gesture;
mod gloss_log;
mod labels;
mod models;
mod pipeline;
mod stream;
mod types;

use std::{
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use clap::Parser;

use config::{Config, DEFAULT_CONFIG_PATH, Overrides};
use diagnostics::PipelineStats;
use display::DisplayBoard;
use gesture::{ClassifierMode, ClassifierVariant, OrtGestureModel};
use gloss_log::GlossLog;
use labels::LabelSource;
use models::{ModelFile, ensure_model_ready_with_progress};
use pipeline::{
    CaptureSession, ClassificationDispatcher, FrameSource, HandDetector, OrtHandDetector,
    RecognitionParts, RelayConnection, ReplaySource, SessionContext, SessionState, SourceOpener,
};
use stream::{BroadcastReceiver, EventSink, EventSource, StreamingClient, polling};

/// Recognizes hand signs from a camera and relays them to a Socket.IO room.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// JSON settings file; missing means defaults.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Relay base URL, e.g. http://localhost:5000
    #[arg(long)]
    server: Option<String>,

    /// Announce this user with join/leave events.
    #[arg(long)]
    username: Option<String>,

    #[arg(long)]
    camera_index: Option<u32>,

    /// static (hand shape) or trajectory (fingertip path)
    #[arg(long)]
    classifier: Option<ClassifierMode>,

    /// Replay these images instead of opening a camera.
    #[arg(long, num_args = 1..)]
    replay: Vec<PathBuf>,

    /// Stop after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    run_for: Option<u64>,

    /// Print the effective settings and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    config.apply(Overrides {
        server: cli.server,
        username: cli.username,
        camera_index: cli.camera_index,
        classifier: cli.classifier,
        replay: cli.replay,
    });

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let stats = Arc::new(PipelineStats::new());
    let detector = build_detector(&config)?;
    let dispatcher = ClassificationDispatcher::new(
        build_classifier(&config)?,
        LabelSource::new(config.classifier.label_table.clone()),
        GlossLog::new(config.gloss_log.path.clone()),
        stats.clone(),
    );
    let relay = connect_relay(&config, &stats)?;

    let context = SessionContext {
        username: config.stream.username.clone(),
        stats: stats.clone(),
        display: DisplayBoard::new(),
    };
    let mut session = CaptureSession::start(
        context,
        frame_source_opener(&config),
        RecognitionParts {
            detector,
            dispatcher,
        },
        relay,
        &config.session_settings(),
    );

    let deadline = cli
        .run_for
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    while !session.state().is_stopped() && deadline.is_none_or(|at| Instant::now() < at) {
        thread::sleep(Duration::from_millis(200));
    }
    session.stop();

    log::info!(
        "session stats: {}",
        serde_json::to_string(&stats.snapshot())?
    );
    if let Some(text) = session.display().text() {
        log::info!("last gesture shown: {text}");
    }

    match session.state() {
        SessionState::Stopped { fault: Some(fault) } => Err(anyhow!("session stopped: {fault}")),
        _ => Ok(()),
    }
}

fn build_detector(config: &Config) -> Result<Box<dyn HandDetector>> {
    let handpose = ModelFile {
        name: "handpose estimator",
        path: config.detector.model_path.clone(),
        url: config.detector.model_url.clone(),
    };
    let palm = ModelFile {
        name: "palm detector",
        path: config.detector.palm_model_path.clone(),
        url: config.detector.palm_model_url.clone(),
    };
    ensure_model_ready_with_progress(&handpose)?;
    ensure_model_ready_with_progress(&palm)?;
    let detector =
        OrtHandDetector::load(&handpose.path, &palm.path, config.detector.settings())?;
    Ok(Box::new(detector))
}

fn build_classifier(config: &Config) -> Result<ClassifierVariant> {
    let classifier = &config.classifier;
    let model = match classifier.mode {
        ClassifierMode::Static => ModelFile {
            name: "keypoint classifier",
            path: classifier.keypoint_model.clone(),
            url: classifier.keypoint_model_url.clone(),
        },
        ClassifierMode::Trajectory => ModelFile {
            name: "point history classifier",
            path: classifier.point_history_model.clone(),
            url: classifier.point_history_model_url.clone(),
        },
    };
    ensure_model_ready_with_progress(&model)?;

    let model = OrtGestureModel::load(&model.path, config.classifier_input_len())?;
    Ok(match classifier.mode {
        ClassifierMode::Static => ClassifierVariant::Static(Box::new(model)),
        ClassifierMode::Trajectory => ClassifierVariant::Trajectory(Box::new(model)),
    })
}

fn connect_relay(config: &Config, stats: &Arc<PipelineStats>) -> Result<RelayConnection> {
    let options = polling::PollingOptions {
        server: config.stream.server.clone(),
        request_timeout: Duration::from_millis(config.stream.request_timeout_ms),
    };
    let (sink, source) = polling::connect(&options)
        .with_context(|| format!("failed to connect to relay at {}", options.server))?;

    Ok(RelayConnection {
        client: StreamingClient::new(
            Box::new(sink) as Box<dyn EventSink>,
            config.stream.retry_policy(),
            stats.clone(),
        ),
        receiver: BroadcastReceiver::new(Box::new(source) as Box<dyn EventSource>, stats.clone())
            .with_error_backoff(Duration::from_millis(config.stream.poll_error_backoff_ms)),
    })
}

fn frame_source_opener(config: &Config) -> SourceOpener {
    let replay = config.camera.replay.clone();
    if !replay.is_empty() {
        return Box::new(move || {
            let source = ReplaySource::open(replay)?;
            Ok(Box::new(source) as Box<dyn FrameSource>)
        });
    }
    camera_opener(config.camera.index)
}

#[cfg(feature = "camera-nokhwa")]
fn camera_opener(index: u32) -> SourceOpener {
    Box::new(move || {
        let camera = pipeline::NokhwaSource::open(index)?;
        Ok(Box::new(camera) as Box<dyn FrameSource>)
    })
}

#[cfg(not(feature = "camera-nokhwa"))]
fn camera_opener(_index: u32) -> SourceOpener {
    Box::new(|| Err(anyhow!("built without camera support; use --replay")))
}
