//! Flinger engine harness: replays recorded control requests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use flinger::{ControlRequest, EngineBuilder, EngineConfig};
use flinger_media::{FrameTarget, HostAdapter, ImageFrame, MediaFrame, PlaybackSnapshot, HOST_ACCEPTED};

/// Flinger engine harness
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON file holding an array of control requests
    script: PathBuf,

    /// JSON engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Host adapter that logs every event and accepts it.
struct LoggingHostAdapter;

impl HostAdapter for LoggingHostAdapter {
    fn on_frame(&self, target: &FrameTarget<'_>, frame: &MediaFrame) -> i32 {
        debug!(
            session = target.session_id,
            instance = target.instance_id,
            idx = frame.idx,
            pts = frame.pts,
            bytes = frame.payload.len(),
            "Frame"
        );
        HOST_ACCEPTED
    }

    fn on_image_frame(&self, target: &FrameTarget<'_>, frame: &ImageFrame) -> i32 {
        debug!(
            session = target.session_id,
            width = frame.width,
            height = frame.height,
            "Image frame"
        );
        HOST_ACCEPTED
    }

    fn on_state_changed(&self, session_id: &str, instance_id: &str, state: &PlaybackSnapshot) {
        info!(
            session = session_id,
            instance = instance_id,
            network = ?state.network_state,
            ready = ?state.ready_state,
            paused = state.paused,
            seeking = state.seeking,
            "State changed"
        );
    }
}

fn read_script(path: &Path) -> Result<Vec<ControlRequest>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Flinger engine v{}", flinger::VERSION);

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let engine = EngineBuilder::new()
        .config(config)
        .host_adapter(Arc::new(LoggingHostAdapter))
        .build();

    let requests = read_script(&args.script)?;
    info!("Replaying {} requests", requests.len());

    let mut failures = 0;
    for request in &requests {
        let response = engine.handle(request);
        if !response.is_ok() {
            failures += 1;
        }
        println!("{}", serde_json::to_string(&response)?);
    }

    info!("Replay complete, {} of {} requests failed", failures, requests.len());
    Ok(())
}
