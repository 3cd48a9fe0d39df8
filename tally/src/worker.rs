//! Per-camera stream worker.
//!
//! One native thread per camera: pull a frame, detect, track, register
//! confirmed tracks with the global registry, annotate, JPEG-encode, and
//! publish into the camera's latest-frame slot. Every transient failure is
//! absorbed here; only the stop signal ends the loop.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use tracing::{debug, info, warn};

use cam_track::{CamTracker, ObservedDetection};
use person_detect::{AppearanceEncoder, Detector};
use reid_core::{GlobalRegistry, MatchOutcome, TrackObservation};
use tally_types::{CamName, TrackerParams};

use crate::annotate::{id_color, Annotation, Renderer};
use crate::capture::{CaptureError, CapturedFrame, FrameSource};
use crate::hub::FrameHub;

/// Consecutive read/open failures before a camera is reported disconnected
/// and the capture is re-opened.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
/// Cycle samples in the FPS estimator window.
const FPS_WINDOW: usize = 30;

/// Live worker state shared with the HTTP status endpoint.
#[derive(Default)]
pub struct WorkerStatus {
    connected: AtomicBool,
    /// f32 FPS value stored as raw bits.
    fps_bits: AtomicU32,
    bound_tracks: AtomicUsize,
}

impl WorkerStatus {
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
    pub fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }
    pub fn bound_tracks(&self) -> usize {
        self.bound_tracks.load(Ordering::Relaxed)
    }

    fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Relaxed);
    }
    fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }
    fn set_bound_tracks(&self, n: usize) {
        self.bound_tracks.store(n, Ordering::Relaxed);
    }
}

/// Moving-window FPS estimate: `fps = 30 / (t_now - t_30_ago)`, reporting
/// zero until 30 cycle samples have been collected.
struct FpsEstimator {
    stamps: VecDeque<Instant>,
}

impl FpsEstimator {
    fn new() -> Self {
        Self {
            stamps: VecDeque::with_capacity(FPS_WINDOW + 2),
        }
    }

    fn tick(&mut self, now: Instant) -> f32 {
        self.stamps.push_back(now);
        if self.stamps.len() > FPS_WINDOW + 1 {
            self.stamps.pop_front();
        }
        self.current()
    }

    fn current(&self) -> f32 {
        // need t_now plus the stamp FPS_WINDOW cycles before it
        if self.stamps.len() < FPS_WINDOW + 1 {
            return 0.0;
        }
        let span = self
            .stamps
            .back()
            .unwrap()
            .duration_since(*self.stamps.front().unwrap())
            .as_secs_f32();
        if span <= 0.0 {
            0.0
        } else {
            FPS_WINDOW as f32 / span
        }
    }
}

struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: BACKOFF_BASE,
        }
    }

    fn next(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(BACKOFF_CAP);
        d
    }

    fn reset(&mut self) {
        self.current = BACKOFF_BASE;
    }
}

pub struct WorkerHandle {
    pub cam: CamName,
    pub status: Arc<WorkerStatus>,
    join: std::thread::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn join(self) {
        if self.join.join().is_err() {
            warn!(camera = %self.cam, "worker thread panicked");
        }
    }
}

pub struct WorkerContext {
    pub cam: CamName,
    pub source: Box<dyn FrameSource>,
    pub detector: Arc<dyn Detector>,
    pub encoder: Arc<dyn AppearanceEncoder>,
    pub tracker_params: TrackerParams,
    pub registry: GlobalRegistry,
    pub hub: Arc<FrameHub>,
    pub jpeg_quality: u8,
}

/// Spawn the worker thread for one camera.
pub fn spawn_worker(ctx: WorkerContext, stop: Arc<AtomicBool>) -> WorkerHandle {
    let cam = ctx.cam.clone();
    let status = Arc::new(WorkerStatus::default());
    let status2 = status.clone();
    let join = std::thread::Builder::new()
        .name(format!("worker-{cam}"))
        .spawn(move || run_worker(ctx, status2, stop))
        .expect("spawn worker thread");
    WorkerHandle { cam, status, join }
}

fn run_worker(mut ctx: WorkerContext, status: Arc<WorkerStatus>, stop: Arc<AtomicBool>) {
    let cam = ctx.cam.clone();
    info!(camera = %cam, "stream worker starting");

    let renderer = Renderer::new();
    let mut tracker = CamTracker::new(cam.clone(), ctx.tracker_params.clone());
    let mut fps = FpsEstimator::new();
    let mut backoff = Backoff::new();
    let mut consecutive_errors: u32 = 0;
    let mut open = false;
    // last registry count observed; reused when the registry is contended
    let mut last_count: usize = 0;

    while !stop.load(Ordering::Relaxed) {
        if !open {
            match ctx.source.open() {
                Ok(()) => {
                    open = true;
                    consecutive_errors = 0;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        status.set_connected(false);
                    }
                    let wait = backoff.next();
                    warn!(camera = %cam, error = %e, retry_in_ms = wait.as_millis() as u64,
                        "capture open failed");
                    interruptible_sleep(wait, &stop);
                    continue;
                }
            }
        }

        let frame = match ctx.source.read() {
            Ok(frame) => frame,
            Err(e) => {
                consecutive_errors += 1;
                warn!(camera = %cam, error = %e, consecutive = consecutive_errors, "frame read failed");
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS || matches!(e, CaptureError::Eos) {
                    status.set_connected(false);
                    ctx.source.close();
                    open = false;
                    interruptible_sleep(backoff.next(), &stop);
                }
                continue;
            }
        };

        // first good frame flips the camera back to connected
        consecutive_errors = 0;
        backoff.reset();
        status.set_connected(true);

        process_frame(&mut ctx, &mut tracker, &renderer, &frame, &mut last_count, &status);

        status.set_fps(fps.tick(Instant::now()));
    }

    ctx.source.close();
    info!(camera = %cam, "stream worker stopped");
}

fn process_frame(
    ctx: &mut WorkerContext,
    tracker: &mut CamTracker,
    renderer: &Renderer,
    frame: &CapturedFrame,
    last_count: &mut usize,
    status: &WorkerStatus,
) {
    let cam = &ctx.cam;

    // detection failure on a single frame is an empty update, never fatal
    let detections = match ctx.detector.detect(&frame.image, frame.ts) {
        Ok(d) => d,
        Err(e) => {
            warn!(camera = %cam, error = %e, "detector failed on frame");
            vec![]
        }
    };

    let observed: Vec<ObservedDetection> = detections
        .iter()
        .map(|d| ObservedDetection {
            bbox: d.bbox,
            score: d.score,
            embedding: ctx.encoder.encode(&frame.image, &d.bbox),
        })
        .collect();

    let update = tracker.update(&observed);

    for local_id in &update.removed {
        ctx.registry.release(cam, *local_id);
    }

    let mut annotations = Vec::with_capacity(update.confirmed.len());
    let mut bound = 0usize;
    for track in &update.confirmed {
        // tracks without appearance information yet simply retry next frame
        let outcome = track.embedding.as_ref().map(|embedding| {
            ctx.registry.observe(
                cam,
                &TrackObservation {
                    local_id: track.id,
                    bbox: track.bbox,
                    embedding: embedding.clone(),
                    ts: frame.ts,
                },
            )
        });

        let (label, color) = match outcome {
            Some(MatchOutcome::Bound(gid)) => {
                bound += 1;
                (format!("G:{gid}"), id_color(gid.0))
            }
            Some(MatchOutcome::AwaitPrimary) | Some(MatchOutcome::Contended) | None => {
                (format!("L:{}?", track.id), image::Rgb([200, 200, 200]))
            }
        };
        annotations.push(Annotation {
            bbox: track.bbox,
            label,
            color,
        });
    }
    status.set_bound_tracks(bound);

    if let Some(counts) = ctx.registry.counts() {
        *last_count = counts.total_unique;
    }

    let overlay = format!("People: {} | FPS: {:.1}", *last_count, status.fps());
    let mut annotated = frame.image.clone();
    renderer.annotate(&mut annotated, &annotations, &overlay);

    // encode failure drops the frame; the slot keeps the previous one
    match encode_jpeg(&annotated, ctx.jpeg_quality) {
        Ok(bytes) => {
            ctx.hub.publish(cam, bytes, frame.ts);
        }
        Err(e) => {
            warn!(camera = %cam, error = %e, "jpeg encode failed; dropping frame");
        }
    }
    debug!(camera = %cam, tracks = update.confirmed.len(), bound, "cycle complete");
}

fn encode_jpeg(image: &image::RgbImage, quality: u8) -> Result<Bytes, image::ImageError> {
    let mut buf = Cursor::new(Vec::with_capacity(64 * 1024));
    image.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?;
    Ok(Bytes::from(buf.into_inner()))
}

/// Sleep in small slices so a stop request is honored within ~100 ms.
fn interruptible_sleep(total: Duration, stop: &AtomicBool) {
    let slice = Duration::from_millis(100);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
        std::thread::sleep(slice.min(deadline - Instant::now()));
    }
}
