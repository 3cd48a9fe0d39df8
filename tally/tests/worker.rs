//! End-to-end worker pipeline against the synthetic source: capture ->
//! detect -> track -> register -> annotate -> encode -> publish, plus the
//! stop deadline and single-person count convergence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use image::RgbImage;

use person_detect::{AppearanceEncoder, Detector, HsvHistogramEncoder};
use reid_core::GlobalRegistry;
use tally::capture::SyntheticSource;
use tally::hub::FrameHub;
use tally::worker::{spawn_worker, WorkerContext};
use tally_types::{
    BoundingBox, CamName, Detection, OverlapGraph, ReidParams, TrackerParams,
};

/// Finds the synthetic red person by scanning pixel colors; deterministic
/// and model-free.
struct ScanDetector;

impl Detector for ScanDetector {
    fn detect(
        &self,
        frame: &RgbImage,
        ts: DateTime<Utc>,
    ) -> person_detect::Result<Vec<Detection>> {
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0u32, 0u32);
        let mut found = false;
        for (x, y, p) in frame.enumerate_pixels() {
            if p[0] > 150 && p[1] < 100 && p[2] < 100 {
                found = true;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
        if !found {
            return Ok(vec![]);
        }
        Ok(vec![Detection {
            bbox: BoundingBox::new(min_x as f32, min_y as f32, max_x as f32 + 1.0, max_y as f32 + 1.0),
            score: 0.9,
            ts,
        }])
    }
}

#[test]
fn worker_publishes_annotated_frames_and_counts_one_person() {
    let cam = CamName::new("cam-a");
    let hub = Arc::new(FrameHub::new([cam.clone()]));
    let registry = GlobalRegistry::new(ReidParams::default(), OverlapGraph::default());
    let stop = Arc::new(AtomicBool::new(false));

    let encoder: Arc<dyn AppearanceEncoder> = Arc::new(HsvHistogramEncoder::default());
    let ctx = WorkerContext {
        cam: cam.clone(),
        source: Box::new(SyntheticSource::new(640, 480, 120.0)),
        detector: Arc::new(ScanDetector),
        encoder,
        tracker_params: TrackerParams::default(),
        registry: registry.clone(),
        hub: hub.clone(),
        jpeg_quality: 78,
    };
    let handle = spawn_worker(ctx, stop.clone());

    // wait for the pipeline to publish several frames and converge on one
    // global identity
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut seen_seq = 0;
    let mut counted_one = false;
    while Instant::now() < deadline {
        if let Some(frame) = hub.latest(&cam) {
            seen_seq = frame.seq;
            // every published frame is a decodable JPEG of the source size
            let decoded = image::load_from_memory(&frame.bytes).unwrap();
            assert_eq!(decoded.width(), 640);
            assert_eq!(decoded.height(), 480);
        }
        if let Some(counts) = registry.counts() {
            if counts.total_unique == 1 {
                counted_one = true;
            }
        }
        if counted_one && seen_seq >= 10 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(counted_one, "person was never globally counted");
    assert!(seen_seq >= 10, "worker published too few frames");
    assert!(handle.status.connected());
    assert!(handle.status.bound_tracks() <= 1);

    // stop must complete promptly
    stop.store(true, Ordering::Relaxed);
    let t = Instant::now();
    handle.join();
    assert!(t.elapsed() < Duration::from_secs(2), "worker stop exceeded deadline");
}

#[test]
fn worker_reconnects_after_stream_outage() {
    use tally::capture::{CaptureError, CapturedFrame, FrameSource};

    /// Source whose reads fail until `restored` flips, simulating an RTSP
    /// outage followed by recovery.
    struct FlakySource {
        restored: Arc<AtomicBool>,
        inner: SyntheticSource,
    }

    impl FrameSource for FlakySource {
        fn open(&mut self) -> Result<(), CaptureError> {
            self.inner.open()
        }
        fn read(&mut self) -> Result<CapturedFrame, CaptureError> {
            if !self.restored.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(5));
                return Err(CaptureError::Timeout);
            }
            self.inner.read()
        }
        fn close(&mut self) {
            self.inner.close()
        }
    }

    let cam = CamName::new("cam-a");
    let hub = Arc::new(FrameHub::new([cam.clone()]));
    let registry = GlobalRegistry::new(ReidParams::default(), OverlapGraph::default());
    let stop = Arc::new(AtomicBool::new(false));
    let restored = Arc::new(AtomicBool::new(true));

    let ctx = WorkerContext {
        cam: cam.clone(),
        source: Box::new(FlakySource {
            restored: restored.clone(),
            inner: SyntheticSource::new(320, 240, 120.0),
        }),
        detector: Arc::new(ScanDetector),
        encoder: Arc::new(HsvHistogramEncoder::default()),
        tracker_params: TrackerParams::default(),
        registry,
        hub: hub.clone(),
        jpeg_quality: 78,
    };
    let handle = spawn_worker(ctx, stop.clone());

    // healthy stream: the worker connects and publishes
    let connect_deadline = Instant::now() + Duration::from_secs(5);
    while !(handle.status.connected() && hub.latest(&cam).is_some())
        && Instant::now() < connect_deadline
    {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(handle.status.connected(), "worker never connected");

    // outage: after three consecutive read failures the camera must report
    // disconnected
    restored.store(false, Ordering::Relaxed);
    let disconnect_deadline = Instant::now() + Duration::from_secs(5);
    while handle.status.connected() && Instant::now() < disconnect_deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!handle.status.connected(), "camera never reported disconnected");

    // restore the stream: fresh frames must appear within a few seconds
    let seq_before = hub.latest(&cam).map(|f| f.seq).unwrap_or(0);
    restored.store(true, Ordering::Relaxed);
    // worst case the worker is mid-backoff (capped at 5 s) when the stream
    // comes back
    let recover_deadline = Instant::now() + Duration::from_secs(10);
    let mut recovered = false;
    while Instant::now() < recover_deadline {
        let published_new = hub.latest(&cam).map(|f| f.seq > seq_before).unwrap_or(false);
        if published_new && handle.status.connected() {
            recovered = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(recovered, "worker did not recover after stream restore");

    stop.store(true, Ordering::Relaxed);
    handle.join();
}

#[test]
fn worker_survives_failing_detector() {
    struct FailingDetector;
    impl Detector for FailingDetector {
        fn detect(
            &self,
            _frame: &RgbImage,
            _ts: DateTime<Utc>,
        ) -> person_detect::Result<Vec<Detection>> {
            Err(person_detect::DetectError::BadOutputSize(1))
        }
    }

    let cam = CamName::new("cam-a");
    let hub = Arc::new(FrameHub::new([cam.clone()]));
    let registry = GlobalRegistry::new(ReidParams::default(), OverlapGraph::default());
    let stop = Arc::new(AtomicBool::new(false));

    let ctx = WorkerContext {
        cam: cam.clone(),
        source: Box::new(SyntheticSource::new(320, 240, 120.0)),
        detector: Arc::new(FailingDetector),
        encoder: Arc::new(HsvHistogramEncoder::default()),
        tracker_params: TrackerParams::default(),
        registry: registry.clone(),
        hub: hub.clone(),
        jpeg_quality: 78,
    };
    let handle = spawn_worker(ctx, stop.clone());

    // detector failure is per-frame recoverable: frames still publish, with
    // zero detections
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut published = false;
    while Instant::now() < deadline {
        if hub.latest(&cam).map(|f| f.seq >= 3).unwrap_or(false) {
            published = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(published, "no frames published despite recoverable errors");
    assert_eq!(registry.counts().unwrap().total_unique, 0);

    stop.store(true, Ordering::Relaxed);
    handle.join();
}
