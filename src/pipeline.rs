//! Render loop
//!
//! Pulls panels from a source, resamples them through the shared engine and
//! hands each finished frame to the sink. Runs on a blocking thread.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::output::{FrameSink, SendOutcome};
use crate::server::AppState;
use crate::snapshot::encode_jpeg;
use crate::source::FrameSource;

/// Encode a preview every this many frames
const PREVIEW_EVERY: u64 = 10;
const PREVIEW_JPEG_QUALITY: u8 = 70;
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Target frame rate; 0 renders as fast as possible
    pub fps: u32,
    /// Bytes reserved for the transport header in each frame
    pub header_offset: usize,
    /// Stop after this many rendered frames
    pub max_frames: Option<u64>,
    /// Publish JPEG previews for the web API
    pub preview: bool,
}

/// Counters shared between the render loop and the API
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_rendered: AtomicU64,
    frames_dropped: AtomicU64,
    render_errors: AtomicU64,
    last_source_us: AtomicU64,
    last_render_us: AtomicU64,
    last_send_us: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_rendered: u64,
    pub frames_dropped: u64,
    pub render_errors: u64,
    pub last_source_us: u64,
    pub last_render_us: u64,
    pub last_send_us: u64,
}

impl PipelineStats {
    pub fn record_frame(&self, source_us: u64, render_us: u64, send_us: u64, outcome: SendOutcome) {
        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
        if outcome == SendOutcome::Dropped {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.last_source_us.store(source_us, Ordering::Relaxed);
        self.last_render_us.store(render_us, Ordering::Relaxed);
        self.last_send_us.store(send_us, Ordering::Relaxed);
    }

    pub fn record_error(&self) -> u64 {
        self.render_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            render_errors: self.render_errors.load(Ordering::Relaxed),
            last_source_us: self.last_source_us.load(Ordering::Relaxed),
            last_render_us: self.last_render_us.load(Ordering::Relaxed),
            last_send_us: self.last_send_us.load(Ordering::Relaxed),
        }
    }
}

/// Run the render loop until a stop is requested or the frame limit is hit
pub fn run_pipeline(
    state: Arc<AppState>,
    mut source: Box<dyn FrameSource>,
    sink: Arc<dyn FrameSink>,
    options: PipelineOptions,
) -> Result<()> {
    info!("=== FisheyeCast Render Pipeline ===");
    info!("Source: {}", source.name());
    match options.fps {
        0 => info!("Frame pacing: unlimited"),
        fps => info!("Frame pacing: {} fps", fps),
    }

    let frame_interval = (options.fps > 0).then(|| Duration::from_secs_f64(1.0 / options.fps as f64));
    let mut next_deadline = Instant::now();

    // Performance tracking
    let mut total_frames = 0u64;
    let mut frame_count = 0u64;
    let mut dropped_at_last_stats = 0u64;
    let mut last_stats_time = Instant::now();

    while !state.is_stop_requested() {
        if options.max_frames.is_some_and(|max| total_frames >= max) {
            info!("Rendered {} frames, stopping", total_frames);
            break;
        }

        // Follow the published geometry; panels must match the output width
        let (geometry, _) = state.engine.configuration();
        if source.panel_size() != geometry.image_width() {
            source
                .resize(geometry.image_width())
                .context("Failed to resize source panels")?;
        }

        let source_start = Instant::now();
        let panels = source.next_frame().context("Failed to fetch source panels")?;
        let source_us = source_start.elapsed().as_micros() as u64;

        let render_start = Instant::now();
        let frame = match state.engine.render(&panels.as_frame(), options.header_offset) {
            Ok(frame) => frame,
            Err(e) => {
                // Usually a reconfiguration raced the resize above
                let errors = state.stats.record_error();
                if errors % 100 == 1 {
                    warn!("Failed to render frame: {} ({} errors so far)", e, errors);
                }
                // A failed frame still uses up its slot
                total_frames += 1;
                if let Some(interval) = frame_interval {
                    wait_for_next_frame(&mut next_deadline, interval);
                }
                continue;
            }
        };
        let render_us = render_start.elapsed().as_micros() as u64;

        if options.preview && total_frames % PREVIEW_EVERY == 0 {
            match encode_jpeg(frame.pixels(), frame.width(), frame.height(), PREVIEW_JPEG_QUALITY) {
                Ok(jpeg) => state.publish_preview(jpeg),
                Err(e) => debug!("Failed to encode preview: {}", e),
            }
        }

        let send_start = Instant::now();
        let outcome = sink.send(frame);
        let send_us = send_start.elapsed().as_micros() as u64;

        state.stats.record_frame(source_us, render_us, send_us, outcome);
        total_frames += 1;
        frame_count += 1;

        // Log performance stats periodically
        if last_stats_time.elapsed() >= STATS_INTERVAL {
            let elapsed = last_stats_time.elapsed().as_secs_f64();
            let fps_actual = frame_count as f64 / elapsed;
            let dropped = sink.dropped_count() - dropped_at_last_stats;
            if dropped > 0 {
                info!(
                    "Performance: {:.1} fps ({} frames in {:.1}s, {} dropped, render {} us)",
                    fps_actual, frame_count, elapsed, dropped, render_us
                );
            } else {
                info!(
                    "Performance: {:.1} fps ({} frames in {:.1}s, render {} us)",
                    fps_actual, frame_count, elapsed, render_us
                );
            }
            dropped_at_last_stats = sink.dropped_count();
            frame_count = 0;
            last_stats_time = Instant::now();
        }

        if let Some(interval) = frame_interval {
            wait_for_next_frame(&mut next_deadline, interval);
        }
    }

    info!(
        "Pipeline stopped after {} frames ({} sent, {} dropped)",
        total_frames,
        sink.frame_count(),
        sink.dropped_count()
    );
    Ok(())
}

/// Sleep until the next frame slot
fn wait_for_next_frame(next_deadline: &mut Instant, interval: Duration) {
    *next_deadline += interval;
    let now = Instant::now();
    if *next_deadline > now {
        std::thread::sleep(*next_deadline - now);
    } else {
        // Running behind; don't try to catch up with a burst
        *next_deadline = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::FisheyeEngine;
    use crate::output::{ChannelSink, DiscardSink, FrameHeader};
    use crate::projection::ProjectionModel;
    use crate::source::{PanelImage, PanelSet, TestPatternSource};
    use parking_lot::RwLock;
    use std::path::PathBuf;

    fn state(width: u32) -> Arc<AppState> {
        let engine = FisheyeEngine::new(width, 1, ProjectionModel::Perspective).unwrap();
        Arc::new(AppState::new(
            Arc::new(RwLock::new(Config::default())),
            PathBuf::from("unused.toml"),
            Arc::new(engine),
        ))
    }

    fn options(max_frames: u64) -> PipelineOptions {
        PipelineOptions {
            fps: 0,
            header_offset: 32,
            max_frames: Some(max_frames),
            preview: true,
        }
    }

    #[test]
    fn test_renders_requested_frames() {
        let state = state(16);
        let (sink, mut rx) = ChannelSink::new(8);
        // Panels start at the wrong size and are resized to the output width
        let source = Box::new(TestPatternSource::new(4, 8));

        run_pipeline(state.clone(), source, Arc::new(sink), options(5)).unwrap();

        let stats = state.stats.snapshot();
        assert_eq!(stats.frames_rendered, 5);
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(stats.render_errors, 0);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 5);
        let last = FrameHeader::decode(&frames[4]).unwrap();
        assert_eq!((last.frame, last.width), (4, 16));
        assert_eq!(frames[4].len(), 32 + 16 * 16 * 4);

        assert!(state.preview().is_some());
    }

    #[test]
    fn test_full_sink_counts_drops() {
        let state = state(8);
        let (sink, _rx) = ChannelSink::new(1);
        run_pipeline(state.clone(), Box::new(TestPatternSource::new(8, 0)), Arc::new(sink), options(4))
            .unwrap();

        let stats = state.stats.snapshot();
        assert_eq!(stats.frames_rendered, 4);
        assert_eq!(stats.frames_dropped, 3);
    }

    /// Reports the output size but always yields undersized panels
    struct BrokenSource {
        side: u32,
        panels: PanelSet,
    }

    impl FrameSource for BrokenSource {
        fn name(&self) -> &str {
            "broken"
        }

        fn panel_size(&self) -> u32 {
            self.side
        }

        fn resize(&mut self, side: u32) -> Result<()> {
            self.side = side;
            Ok(())
        }

        fn next_frame(&mut self) -> Result<&PanelSet> {
            Ok(&self.panels)
        }
    }

    #[test]
    fn test_render_errors_are_paced_and_counted() {
        let state = state(8);
        let source = Box::new(BrokenSource {
            side: 8,
            panels: PanelSet::new(std::array::from_fn(|_| PanelImage::blank(4, 0))),
        });
        let sink = Arc::new(DiscardSink::default());
        let options = PipelineOptions {
            fps: 100,
            ..options(3)
        };

        let start = Instant::now();
        run_pipeline(state.clone(), source, sink.clone(), options).unwrap();

        // Three slots of 10 ms each, even though nothing rendered
        assert!(start.elapsed() >= Duration::from_millis(25), "{:?}", start.elapsed());
        let stats = state.stats.snapshot();
        assert_eq!(stats.render_errors, 3);
        assert_eq!(stats.frames_rendered, 0);
        assert_eq!(sink.frame_count(), 0);
    }

    #[test]
    fn test_stop_request_ends_loop() {
        let state = state(8);
        state.request_stop();
        let sink = Arc::new(DiscardSink::default());
        run_pipeline(state.clone(), Box::new(TestPatternSource::new(8, 0)), sink.clone(), options(100))
            .unwrap();
        assert_eq!(sink.frame_count(), 0);
    }
}
