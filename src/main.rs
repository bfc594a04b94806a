//! FisheyeCast - Real-time fisheye synthesis from a five-camera cube rig
//!
//! This application takes five 90° panel images (front, left, right, top,
//! bottom), resamples them into a single circular fisheye frame through a
//! cached pixel map, and streams the frames to TCP consumers. A small HTTP
//! API exposes status, a preview image and live lens reconfiguration.

mod config;
mod engine;
mod error;
mod output;
mod panel;
mod pipeline;
mod pixel_map;
mod projection;
mod resample;
mod server;
mod snapshot;
mod source;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::engine::FisheyeEngine;
use crate::output::{ChannelSink, DiscardSink, FrameSink};
use crate::pipeline::PipelineOptions;
use crate::projection::ProjectionModel;
use crate::server::AppState;

/// FisheyeCast - cube rig to fisheye video
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Output image width and height in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Sub-samples per pixel axis
    #[arg(short = 'n', long)]
    sample_factor: Option<u32>,

    /// Lens projection: name (e.g. equisolid_angle) or index 0-4
    #[arg(long)]
    projection: Option<ProjectionModel>,

    /// Target FPS (0 = unlimited)
    #[arg(long)]
    fps: Option<u32>,

    /// Web server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Stop after rendering this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Render a single frame to this image file (.png or .jpg) and exit
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Also write the source panels to the snapshot directory
    #[arg(long)]
    dump_panels: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --verbose when set
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(log_level).into())
        .from_env_lossy();
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("FisheyeCast v{}", env!("CARGO_PKG_VERSION"));

    // Load or create configuration
    let mut config = config::Config::load_or_create(&args.config)?;

    // CLI args override config file values
    if let Some(width) = args.width {
        config.fisheye.image_width = width;
    }
    if let Some(n) = args.sample_factor {
        config.fisheye.sample_factor = n;
    }
    if let Some(projection) = args.projection {
        config.fisheye.projection = projection;
    }
    if let Some(fps) = args.fps {
        config.source.fps = fps;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let fisheye = config.fisheye;
    let geometry = fisheye.geometry().context("Invalid fisheye configuration")?;
    info!(
        "Output: {}x{} N={} projection={} ({:.0}° field of view)",
        geometry.image_width(),
        geometry.image_width(),
        geometry.sample_factor(),
        fisheye.projection,
        fisheye.projection.field_of_view_degrees()
    );

    let engine = FisheyeEngine::new(
        geometry.image_width(),
        geometry.sample_factor(),
        fisheye.projection,
    )?;
    let engine = Arc::new(engine);

    let mut source = source::open(&config.source, geometry.image_width())?;

    if let Some(path) = &args.snapshot {
        let panels = source.next_frame()?;
        let frame = engine.render(&panels.as_frame(), 0)?;
        snapshot::save_frame(path, &frame)?;
        if args.dump_panels {
            snapshot::save_panels(&config.snapshot.directory, panels)?;
        }
        return Ok(());
    }

    let options = PipelineOptions {
        fps: config.source.fps,
        header_offset: config.stream.header_offset,
        max_frames: args.frames,
        preview: true,
    };
    let stream = config.stream.clone();
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let config = Arc::new(parking_lot::RwLock::new(config));
    let state = Arc::new(AppState::new(config, args.config.clone(), engine));

    // Frame transport
    let (sink, streamer_handle) = if stream.enabled {
        let (sink, rx) = ChannelSink::new(stream.queue_depth);
        let sink: Arc<dyn FrameSink> = Arc::new(sink);
        let bind = stream.bind.clone();
        let handle = tokio::spawn(async move { output::run_streamer(&bind, rx).await });
        (sink, Some(handle))
    } else {
        info!("Frame stream disabled, rendered frames are discarded");
        let sink: Arc<dyn FrameSink> = Arc::new(DiscardSink::default());
        (sink, None)
    };

    // Start the render pipeline
    let pipeline_state = state.clone();
    let pipeline_handle = tokio::task::spawn_blocking(move || {
        pipeline::run_pipeline(pipeline_state, source, sink, options)
    });

    // Start the web server
    info!("Starting web server at http://{}", addr);
    let server_state = state.clone();
    let server_handle = tokio::spawn(async move { server::run_server(&addr, server_state).await });

    let streamer = async move {
        match streamer_handle {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    // Wait for any of them to finish (or error)
    tokio::select! {
        result = pipeline_handle => {
            match result {
                Ok(Ok(())) => info!("Pipeline exited normally"),
                Ok(Err(e)) => tracing::error!("Pipeline error: {:#}", e),
                Err(e) => tracing::error!("Pipeline task panicked: {}", e),
            }
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => tracing::error!("Server error: {:#}", e),
                Err(e) => tracing::error!("Server task panicked: {}", e),
            }
        }
        result = streamer => {
            match result {
                Ok(Ok(())) => info!("Streamer exited normally"),
                Ok(Err(e)) => tracing::error!("Streamer error: {:#}", e),
                Err(e) => tracing::error!("Streamer task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    // The render thread polls this between frames
    state.request_stop();

    Ok(())
}
