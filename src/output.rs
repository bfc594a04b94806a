// Frame transport
//
// Rendered frames leave the render loop through a `FrameSink`. The sink must
// never block the loop: when the consumer side is behind, the frame is
// dropped and counted instead.
//
// The streaming sink stamps a small header into the reserved bytes at the
// front of each frame and hands it to an async task, which fans it out to
// every connected TCP consumer as `u32 length (LE)` + frame bytes.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::panel::PANEL_FOV_DEGREES;
use crate::resample::OutputFrame;

/// Per-consumer queue length; a consumer this far behind is disconnected
const CLIENT_QUEUE_DEPTH: usize = 2;

/// Minimum time between two dropped-frame warnings
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed little-endian frame header
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub frame: u64,
    pub width: u32,
    pub height: u32,
    /// Field of view of each source panel, degrees
    pub fov: f32,
    /// Projection model index (0..=4)
    pub projection: u32,
}

impl FrameHeader {
    pub const MAGIC: [u8; 4] = *b"FEYE";
    pub const SIZE: usize = 28;

    pub fn for_frame(frame: u64, output: &OutputFrame) -> Self {
        Self {
            frame,
            width: output.width(),
            height: output.height(),
            fov: PANEL_FOV_DEGREES,
            projection: output.projection().index(),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&Self::MAGIC);
        buf[4..12].copy_from_slice(&self.frame.to_le_bytes());
        buf[12..16].copy_from_slice(&self.width.to_le_bytes());
        buf[16..20].copy_from_slice(&self.height.to_le_bytes());
        buf[20..24].copy_from_slice(&self.fov.to_le_bytes());
        buf[24..28].copy_from_slice(&self.projection.to_le_bytes());
        buf
    }

    #[cfg(test)]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let buf = buf.get(..Self::SIZE)?;
        if buf[0..4] != Self::MAGIC {
            return None;
        }
        Some(Self {
            frame: u64::from_le_bytes(buf[4..12].try_into().ok()?),
            width: u32::from_le_bytes(buf[12..16].try_into().ok()?),
            height: u32::from_le_bytes(buf[16..20].try_into().ok()?),
            fov: f32::from_le_bytes(buf[20..24].try_into().ok()?),
            projection: u32::from_le_bytes(buf[24..28].try_into().ok()?),
        })
    }

    /// Write the header at the start of `reserved`.
    ///
    /// Returns `false` and leaves the bytes alone when fewer than
    /// [`Self::SIZE`] bytes are reserved.
    pub fn write_into(&self, reserved: &mut [u8]) -> bool {
        match reserved.get_mut(..Self::SIZE) {
            Some(dst) => {
                dst.copy_from_slice(&self.encode());
                true
            }
            None => false,
        }
    }
}

/// What happened to a frame handed to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
}

/// Receiver of finished frames. `send` must not block.
pub trait FrameSink: Send + Sync {
    fn send(&self, frame: OutputFrame) -> SendOutcome;

    /// Frames accepted so far
    fn frame_count(&self) -> u64;

    /// Frames dropped so far
    fn dropped_count(&self) -> u64;
}

/// Sink that accepts and discards every frame
#[derive(Debug, Default)]
pub struct DiscardSink {
    frame_count: AtomicU64,
}

impl FrameSink for DiscardSink {
    fn send(&self, _frame: OutputFrame) -> SendOutcome {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
        SendOutcome::Sent
    }

    fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    fn dropped_count(&self) -> u64 {
        0
    }
}

/// Sink feeding a bounded channel, dropping frames when it is full
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<u8>>,
    frame_count: AtomicU64,
    dropped_count: AtomicU64,
    /// Track when we last logged a warning about dropped frames
    last_drop_warn: Mutex<Option<Instant>>,
}

impl ChannelSink {
    /// Sink and the receiving end of its queue of `depth` frames
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let sink = Self {
            tx,
            frame_count: AtomicU64::new(0),
            dropped_count: AtomicU64::new(0),
            last_drop_warn: Mutex::new(None),
        };
        (sink, rx)
    }

    /// Record a dropped frame and log periodically
    fn record_dropped_frame(&self, reason: &str) {
        let dropped = self.dropped_count.fetch_add(1, Ordering::Relaxed) + 1;

        let mut last = self.last_drop_warn.lock();
        let should_warn = match *last {
            None => true,
            Some(t) => t.elapsed() >= DROP_WARN_INTERVAL,
        };
        if should_warn {
            warn!(
                "Dropped frame ({}; total dropped: {}, sent: {})",
                reason,
                dropped,
                self.frame_count()
            );
            *last = Some(Instant::now());
        }
    }
}

impl FrameSink for ChannelSink {
    fn send(&self, mut frame: OutputFrame) -> SendOutcome {
        let sequence = self.frame_count.load(Ordering::Relaxed);
        let header = FrameHeader::for_frame(sequence, &frame);
        header.write_into(frame.header_mut());

        match self.tx.try_send(frame.into_bytes()) {
            Ok(()) => {
                let count = self.frame_count.fetch_add(1, Ordering::Relaxed);
                if count % 100 == 0 {
                    debug!("Queued {} frames for streaming", count + 1);
                }
                SendOutcome::Sent
            }
            Err(TrySendError::Full(_)) => {
                self.record_dropped_frame("stream queue full");
                SendOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                self.record_dropped_frame("streamer stopped");
                SendOutcome::Dropped
            }
        }
    }

    fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }
}

/// Bind `addr` and stream frames from `rx` to every TCP consumer.
pub async fn run_streamer(addr: &str, rx: mpsc::Receiver<Vec<u8>>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind frame stream on {}", addr))?;
    info!("Frame stream listening on tcp://{}", addr);
    serve_frames(listener, rx).await
}

/// Fan frames out to connected consumers until the frame queue closes.
pub async fn serve_frames(listener: TcpListener, mut rx: mpsc::Receiver<Vec<u8>>) -> Result<()> {
    let mut clients: Vec<mpsc::Sender<Arc<Vec<u8>>>> = Vec::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("Failed to accept stream consumer")?;
                info!("Stream consumer connected: {}", peer);
                let (tx, client_rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
                clients.push(tx);
                tokio::spawn(async move {
                    if let Err(e) = write_frames(stream, client_rx).await {
                        debug!("Stream consumer {} write failed: {}", peer, e);
                    }
                    info!("Stream consumer disconnected: {}", peer);
                });
            }
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    info!("Frame queue closed, stopping stream");
                    return Ok(());
                };
                let frame = Arc::new(frame);
                let before = clients.len();
                // A consumer that cannot keep up is cut off rather than waited for
                clients.retain(|client| client.try_send(frame.clone()).is_ok());
                if clients.len() < before {
                    warn!("Dropped {} slow stream consumer(s)", before - clients.len());
                }
            }
        }
    }
}

async fn write_frames(mut stream: TcpStream, mut rx: mpsc::Receiver<Arc<Vec<u8>>>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    while let Some(frame) = rx.recv().await {
        stream.write_u32_le(frame.len() as u32).await?;
        stream.write_all(&frame).await?;
    }
    Ok(())
}
