//! Frame sources.
//!
//! [`RtspSource`] pulls decoded RGB frames from a live RTSP stream through a
//! gstreamer pipeline with newest-only buffering (`max-buffers=1 drop=true`),
//! so a slow consumer always sees the most recent frame. [`SyntheticSource`]
//! renders a moving person-shaped rectangle and backs `test://` camera URLs.

use chrono::{DateTime, Utc};
use image::RgbImage;

use tally_types::CameraConfig;

#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("gstreamer error: {source}")]
    Glib {
        #[from]
        source: gstreamer::glib::Error,
    },
    #[error("gstreamer bool error: {source}")]
    GlibBool {
        #[from]
        source: gstreamer::glib::BoolError,
    },
    #[error("gstreamer state change failed: {source}")]
    StateChange {
        #[from]
        source: gstreamer::StateChangeError,
    },
    #[error("pipeline has no appsink element")]
    MissingSink,
    #[error("capture is not open")]
    NotOpen,
    #[error("timed out waiting for a frame")]
    Timeout,
    #[error("stream ended")]
    Eos,
    #[error("failed to map sample buffer")]
    BufferMap,
    #[error("unsupported video caps")]
    BadCaps,
}

/// One decoded frame plus its capture timestamp.
pub struct CapturedFrame {
    pub image: RgbImage,
    pub ts: DateTime<Utc>,
}

/// A camera stream the worker can open, read, and close. `read` blocks for
/// at most about one second so stop signals are honored promptly.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), CaptureError>;
    fn read(&mut self) -> Result<CapturedFrame, CaptureError>;
    fn close(&mut self);
}

/// Build the frame source for a camera definition.
pub fn make_source(cfg: &CameraConfig) -> Box<dyn FrameSource> {
    if cfg.url.starts_with("test://") {
        Box::new(SyntheticSource::new(640, 480, cfg.fps))
    } else {
        Box::new(RtspSource::new(cfg.url.clone()))
    }
}

// RtspSource ------------------------------------------------------------------

pub struct RtspSource {
    url: String,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
}

impl RtspSource {
    pub fn new(url: String) -> Self {
        Self {
            url,
            pipeline: None,
            appsink: None,
        }
    }
}

impl FrameSource for RtspSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        use gstreamer::prelude::*;

        gstreamer::init()?;

        // latency=0 and a single dropping appsink buffer give newest-only
        // semantics end to end
        let desc = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=sink max-buffers=1 drop=true sync=false",
            self.url
        );
        let pipeline = gstreamer::parse::launch(&desc)?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| CaptureError::MissingSink)?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<gstreamer_app::AppSink>().ok())
            .ok_or(CaptureError::MissingSink)?;

        pipeline.set_state(gstreamer::State::Playing)?;

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn read(&mut self) -> Result<CapturedFrame, CaptureError> {
        let appsink = self.appsink.as_ref().ok_or(CaptureError::NotOpen)?;

        let sample = match appsink.try_pull_sample(gstreamer::ClockTime::from_seconds(1)) {
            Some(sample) => sample,
            None => {
                if appsink.is_eos() {
                    return Err(CaptureError::Eos);
                }
                return Err(CaptureError::Timeout);
            }
        };
        let ts = Utc::now();

        let caps = sample.caps().ok_or(CaptureError::BadCaps)?;
        let info =
            gstreamer_video::VideoInfo::from_caps(caps).map_err(|_| CaptureError::BadCaps)?;
        let (width, height) = (info.width(), info.height());
        let stride = info.stride()[0] as usize;

        let buffer = sample.buffer().ok_or(CaptureError::BufferMap)?;
        let map = buffer.map_readable().map_err(|_| CaptureError::BufferMap)?;
        let data = map.as_slice();

        // rows may carry stride padding; copy row by row
        let row_bytes = width as usize * 3;
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            if start + row_bytes > data.len() {
                return Err(CaptureError::BufferMap);
            }
            pixels.extend_from_slice(&data[start..start + row_bytes]);
        }
        let image = RgbImage::from_raw(width, height, pixels).ok_or(CaptureError::BufferMap)?;

        Ok(CapturedFrame { image, ts })
    }

    fn close(&mut self) {
        use gstreamer::prelude::*;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gstreamer::State::Null);
        }
        self.appsink = None;
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

// SyntheticSource -------------------------------------------------------------

/// Scene generator: a person-sized rectangle walking right to left across a
/// gray background, paced at the configured frame rate.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_interval: std::time::Duration,
    frame_count: u64,
    open: bool,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: f32) -> Self {
        let fps = if fps > 0.0 { fps } else { 30.0 };
        Self {
            width,
            height,
            frame_interval: std::time::Duration::from_secs_f32(1.0 / fps),
            frame_count: 0,
            open: false,
        }
    }

    /// Current position of the synthetic person, walking right to left at
    /// 5 px/frame and wrapping around.
    fn person_box(&self) -> (u32, u32, u32, u32) {
        let w = 80u32.min(self.width);
        let h = 200u32.min(self.height);
        let travel = self.width.saturating_sub(w).max(1);
        let offset = (self.frame_count * 5 % travel as u64) as u32;
        let x = travel - offset;
        let y = (self.height / 2).saturating_sub(h / 2);
        (x, y, w, h)
    }
}

impl FrameSource for SyntheticSource {
    fn open(&mut self) -> Result<(), CaptureError> {
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<CapturedFrame, CaptureError> {
        if !self.open {
            return Err(CaptureError::NotOpen);
        }
        std::thread::sleep(self.frame_interval);
        self.frame_count += 1;

        let mut image = RgbImage::from_pixel(self.width, self.height, image::Rgb([96, 96, 96]));
        let (x0, y0, w, h) = self.person_box();
        for y in y0..(y0 + h).min(self.height) {
            for x in x0..(x0 + w).min(self.width) {
                image.put_pixel(x, y, image::Rgb([180, 40, 40]));
            }
        }

        Ok(CapturedFrame {
            image,
            ts: Utc::now(),
        })
    }

    fn close(&mut self) {
        self.open = false;
    }
}
