//! Live latent previews
//!
//! A [`LatentPreviewer`] observes the sampling loop. On each step it asks
//! the rate limiter how many images may go out, picks enough latent frames
//! from a rolling cursor to produce them and hands them to a worker thread
//! over a bounded channel. The budget counts decoded images, so a decoder
//! that upsamples in time does not multiply the rate. The worker decodes, downscales, encodes and transmits;
//! the sampling thread never waits for it. When the channel is full the
//! new job is dropped.
//!
//! ```text
//! IDLE --first grant--> ARMED --first handoff--> STREAMING --finish--> IDLE
//! ```

pub mod decoder;
pub mod limiter;
pub mod wire;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use burn::config::Config;
use burn::prelude::*;
use crossbeam::channel::{bounded, Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::PreviewError;
use crate::guider::{StepEvent, StepObserver};
use crate::imageops;

pub use decoder::{preview_length, LatentRgb, PreviewDecoder};
pub use limiter::{Clock, RateLimiter, SystemClock};

/// Preview stream settings
#[derive(Config, Debug)]
pub struct PreviewConfig {
    /// Frames per second of wall time
    #[config(default = 8)]
    pub rate: usize,

    /// Longest side of emitted images
    #[config(default = 256)]
    pub resolution: usize,

    /// JPEG quality
    #[config(default = 90)]
    pub quality: u8,

    /// Minimum spacing between probes in seconds
    #[config(default = 1.0)]
    pub probe_interval: f64,

    /// Jobs that may wait for the worker
    #[config(default = 2)]
    pub queue_capacity: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Events sent to the preview listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewEvent {
    /// Announces a stream of `length` frames played at `rate`
    Start { length: usize, rate: usize },
    /// One encoded frame (see [`wire`])
    Image(Vec<u8>),
}

impl PreviewEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PreviewEvent::Start { .. } => "latent_preview",
            PreviewEvent::Image(_) => "preview_image",
        }
    }
}

/// Fire-and-forget sink for preview events
pub trait PreviewTransport: Send {
    fn send(&mut self, event: PreviewEvent) -> Result<(), PreviewError>;
}

impl PreviewTransport for Sender<PreviewEvent> {
    fn send(&mut self, event: PreviewEvent) -> Result<(), PreviewError> {
        Sender::send(self, event).map_err(|e| PreviewError::Transport(e.to_string()))
    }
}

/// Stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewPhase {
    Idle,
    Armed,
    Streaming,
}

/// Counters of one preview run
#[derive(Debug, Default)]
pub struct PreviewStats {
    /// Jobs handed to the worker
    pub queued: AtomicUsize,
    /// Jobs dropped because the worker was busy
    pub dropped: AtomicUsize,
    /// Frames delivered to the transport
    pub sent: AtomicUsize,
    /// Jobs or frames lost to decode, encode or transport errors
    pub failed: AtomicUsize,
}

impl PreviewStats {
    pub fn snapshot(&self) -> PreviewCounts {
        PreviewCounts {
            queued: self.queued.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            sent: self.sent.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Plain copy of [`PreviewStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreviewCounts {
    pub queued: usize,
    pub dropped: usize,
    pub sent: usize,
    pub failed: usize,
}

struct PreviewJob<B: Backend> {
    latents: Tensor<B, 5>,
    /// Index of the first emitted image
    start_index: usize,
    /// Images granted by the rate limiter
    max_images: usize,
    /// Length of the wrapped preview sequence
    length: usize,
    /// Stream announcement to send before the frames
    announce: Option<PreviewEvent>,
}

/// Rate-limited preview observer with a background worker
pub struct LatentPreviewer<B: Backend> {
    config: PreviewConfig,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    phase: PreviewPhase,
    cursor: usize,
    temporal_upscale: usize,
    sender: Option<Sender<PreviewJob<B>>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<PreviewStats>,
}

impl<B: Backend> LatentPreviewer<B> {
    pub fn new(config: PreviewConfig, decoder: Arc<dyn PreviewDecoder<B>>, transport: Box<dyn PreviewTransport>) -> Self {
        Self::with_clock(config, decoder, transport, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(
        config: PreviewConfig,
        decoder: Arc<dyn PreviewDecoder<B>>,
        transport: Box<dyn PreviewTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (sender, receiver) = bounded::<PreviewJob<B>>(config.queue_capacity.max(1));
        let stats = Arc::new(PreviewStats::default());
        let temporal_upscale = decoder.temporal_upscale().max(1);

        let worker_stats = stats.clone();
        let resolution = config.resolution;
        let quality = config.quality;
        let worker = std::thread::Builder::new()
            .name("latent-preview".into())
            .spawn(move || {
                let mut transport = transport;
                for job in receiver {
                    process_job(job, decoder.as_ref(), transport.as_mut(), resolution, quality, temporal_upscale, &worker_stats);
                }
            });
        let (sender, worker) = match worker {
            Ok(handle) => (Some(sender), Some(handle)),
            Err(err) => {
                warn!("Preview worker could not start, previews disabled: {}", err);
                (None, None)
            }
        };

        Self {
            limiter: RateLimiter::new(config.rate, config.probe_interval),
            config,
            clock,
            phase: PreviewPhase::Idle,
            cursor: 0,
            temporal_upscale,
            sender,
            worker,
            stats,
        }
    }

    pub fn phase(&self) -> PreviewPhase {
        self.phase
    }

    pub fn stats(&self) -> PreviewCounts {
        self.stats.snapshot()
    }

    /// Start a new stream (a new sampling pass) on the same worker
    pub fn reset(&mut self) {
        self.phase = PreviewPhase::Idle;
        self.cursor = 0;
        self.limiter.reset();
    }

    /// Offer a denoised latent `[B, C, T, h, w]` to the stream
    pub fn observe(&mut self, latent: &Tensor<B, 5>) {
        let Some(sender) = &self.sender else {
            return;
        };
        let [_, channels, frames, h, w] = latent.dims();
        if frames == 0 {
            return;
        }

        let length = preview_length(frames, self.temporal_upscale);
        let granted = self.limiter.probe(self.clock.now(), length);
        if granted == 0 {
            return;
        }
        let count = granted.div_ceil(self.temporal_upscale).min(frames);
        if self.phase == PreviewPhase::Idle {
            self.limiter.arm(self.clock.now());
            self.phase = PreviewPhase::Armed;
        }

        let batch0 = latent.clone().slice([0..1, 0..channels, 0..frames, 0..h, 0..w]);
        let start = self.cursor;
        let latents = if start + count > frames {
            let head = batch0.clone().slice([0..1, 0..channels, start..frames, 0..h, 0..w]);
            let tail = batch0.slice([0..1, 0..channels, 0..start + count - frames, 0..h, 0..w]);
            Tensor::cat(vec![head, tail], 2)
        } else {
            batch0.slice([0..1, 0..channels, start..start + count, 0..h, 0..w])
        };

        let announce = (self.phase == PreviewPhase::Armed).then(|| PreviewEvent::Start {
            length,
            rate: self.config.rate,
        });
        let job = PreviewJob {
            latents,
            start_index: (start * self.temporal_upscale) % length,
            max_images: granted,
            length,
            announce,
        };

        match sender.try_send(job) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::SeqCst);
                self.phase = PreviewPhase::Streaming;
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::SeqCst);
                debug!("Preview worker busy, dropped {} frames", granted);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!("Preview worker stopped, previews disabled");
                self.sender = None;
            }
        }
        self.cursor = (start + count) % frames;
    }

    /// Stop the worker after it drains queued jobs
    pub fn finish(mut self) -> PreviewCounts {
        self.shutdown();
        self.stats.snapshot()
    }

    fn shutdown(&mut self) {
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Preview worker panicked");
            }
        }
        self.phase = PreviewPhase::Idle;
    }
}

impl<B: Backend> Drop for LatentPreviewer<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<B: Backend> StepObserver<B> for LatentPreviewer<B> {
    fn on_step(&mut self, event: &StepEvent<'_, B>) -> Result<(), PreviewError> {
        self.observe(event.denoised);
        Ok(())
    }
}

fn process_job<B: Backend>(
    job: PreviewJob<B>,
    decoder: &dyn PreviewDecoder<B>,
    transport: &mut dyn PreviewTransport,
    resolution: usize,
    quality: u8,
    temporal_upscale: usize,
    stats: &PreviewStats,
) {
    if let Some(announce) = job.announce {
        if let Err(err) = transport.send(announce) {
            warn!("Preview announcement failed: {}", err);
        }
    }

    let images = match decoder.decode(job.latents) {
        Ok(images) => imageops::limit_resolution(images.clamp(0.0, 1.0), resolution),
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::SeqCst);
            warn!("Preview decode failed: {}", err);
            return;
        }
    };

    let [decoded, height, width, _] = images.dims();
    let count = decoded.min(job.max_images);
    let values = match images.into_data().convert::<f32>().to_vec::<f32>() {
        Ok(values) => values,
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::SeqCst);
            warn!("Preview readback failed: {:?}", err);
            return;
        }
    };

    let frame_len = height * width * 3;
    let mut index = job.start_index;
    for frame in values.chunks_exact(frame_len).take(count) {
        let rgb = imageops::to_rgb8(frame);
        let sent = wire::encode_frame(&rgb, width, height, index as u32, quality)
            .and_then(|message| transport.send(PreviewEvent::Image(message)));
        match sent {
            Ok(()) => {
                stats.sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                stats.failed.fetch_add(1, Ordering::SeqCst);
                warn!("Preview frame {} dropped: {}", index, err);
            }
        }
        index = (index + 1) % job.length;
    }
    debug!("Sent {} preview frames ({} per latent frame)", count, temporal_upscale);
}
