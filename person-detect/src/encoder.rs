//! Appearance embedding extraction.
//!
//! The tracker and the global registry compare people by cosine similarity
//! of unit-norm embeddings. When a ReID model is configured it is run on the
//! detection crop; otherwise a coarse hue/saturation histogram of the crop
//! serves as the appearance signature.

use image::RgbImage;
use nalgebra::DVector;
use ort::session::Session;
use ort::value::{Tensor, Value};
use parking_lot::Mutex;
use tracing::{info, warn};

use tally_types::{BoundingBox, Embedding};

use crate::errors::Result;
use crate::{AppearanceEncoder, Device};

/// Hue x saturation histogram of the detection crop, L2-normalized.
///
/// Deterministic and model-free; the default appearance signature when no
/// ReID model is configured.
pub struct HsvHistogramEncoder {
    hue_bins: usize,
    sat_bins: usize,
}

impl Default for HsvHistogramEncoder {
    fn default() -> Self {
        Self {
            hue_bins: 16,
            sat_bins: 16,
        }
    }
}

impl HsvHistogramEncoder {
    pub fn new(hue_bins: usize, sat_bins: usize) -> Self {
        Self {
            hue_bins: hue_bins.max(1),
            sat_bins: sat_bins.max(1),
        }
    }
}

impl AppearanceEncoder for HsvHistogramEncoder {
    fn dim(&self) -> usize {
        self.hue_bins * self.sat_bins
    }

    fn encode(&self, frame: &RgbImage, bbox: &BoundingBox) -> Option<Embedding> {
        let (w, h) = frame.dimensions();
        let b = bbox.clamp_to(w, h);
        let (x1, y1) = (b.x1 as u32, b.y1 as u32);
        let (x2, y2) = (b.x2 as u32, b.y2 as u32);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        let mut hist = DVector::<f32>::zeros(self.dim());
        for y in y1..y2 {
            for x in x1..x2 {
                let p = frame.get_pixel(x, y);
                let (hue, sat, _val) = rgb_to_hsv(p[0], p[1], p[2]);
                let hb = ((hue / 360.0 * self.hue_bins as f32) as usize).min(self.hue_bins - 1);
                let sb = ((sat * self.sat_bins as f32) as usize).min(self.sat_bins - 1);
                hist[hb * self.sat_bins + sb] += 1.0;
            }
        }
        Embedding::unit_from(hist)
    }
}

/// `(hue degrees [0, 360), saturation [0, 1], value [0, 1])`
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let sat = if max == 0.0 { 0.0 } else { delta / max };
    (hue, sat, max)
}

/// ReID model (OSNet-style) run on the detection crop via ONNX Runtime.
pub struct OnnxAppearanceEncoder {
    session: Mutex<Session>,
    output_name: String,
    input_w: u32,
    input_h: u32,
    /// Embedding dimensionality, observed on the first inference.
    dim: std::sync::atomic::AtomicUsize,
}

impl OnnxAppearanceEncoder {
    /// Load the ReID model. The conventional input is a 128x256 (w x h)
    /// person crop.
    pub fn new(model: &std::path::Path, device: Device) -> Result<Self> {
        let session = crate::onnx::build_session(model, device)?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "output".to_string());

        info!(model = %model.display(), "appearance encoder initialized");
        Ok(Self {
            session: Mutex::new(session),
            output_name,
            input_w: 128,
            input_h: 256,
            dim: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    fn run(&self, crop: &RgbImage) -> Result<DVector<f32>> {
        let resized = image::imageops::resize(
            crop,
            self.input_w,
            self.input_h,
            image::imageops::FilterType::Triangle,
        );

        let (w, h) = (self.input_w as usize, self.input_h as usize);
        let mut chw_data: Vec<f32> = Vec::with_capacity(3 * h * w);
        for c in 0..3 {
            for y in 0..h {
                for x in 0..w {
                    chw_data.push(resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0);
                }
            }
        }

        let shape = vec![1usize, 3, h, w];
        let input = Tensor::from_array((shape, chw_data.into_boxed_slice())).map(Value::from)?;

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![input])?;
        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| crate::DetectError::MissingOutput(self.output_name.clone()))?;
        let tensor = output.try_extract_tensor::<f32>()?;
        Ok(DVector::from_row_slice(tensor.1))
    }
}

impl AppearanceEncoder for OnnxAppearanceEncoder {
    fn dim(&self) -> usize {
        self.dim.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn encode(&self, frame: &RgbImage, bbox: &BoundingBox) -> Option<Embedding> {
        let (w, h) = frame.dimensions();
        let b = bbox.clamp_to(w, h);
        let (cw, ch) = (b.width() as u32, b.height() as u32);
        if cw == 0 || ch == 0 {
            return None;
        }
        let crop = image::imageops::crop_imm(frame, b.x1 as u32, b.y1 as u32, cw, ch).to_image();

        match self.run(&crop) {
            Ok(v) => {
                self.dim
                    .store(v.len(), std::sync::atomic::Ordering::Relaxed);
                Embedding::unit_from(v)
            }
            Err(e) => {
                // per-frame inference failure is recoverable; the track just
                // misses one embedding update
                warn!(error = %e, "appearance inference failed");
                None
            }
        }
    }
}
