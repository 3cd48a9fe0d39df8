//! YOLOv8-family ONNX person detector.
//!
//! Output head layout is `[1, 4 + classes, N]`: center-format boxes followed
//! by per-class scores for each of the N candidates. Only the person class
//! (COCO class 0) is kept.

use chrono::{DateTime, Utc};
use image::RgbImage;
use ndarray::Array;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use parking_lot::Mutex;
use tracing::{debug, info};

use tally_types::{BoundingBox, Detection, DetectorConfig};

use crate::errors::{DetectError, Result};
use crate::{Detector, Device};

/// Features per candidate: 4 box coordinates + 80 COCO class scores.
const NUM_FEATURES: usize = 84;
/// Index of the person class score within a candidate.
const PERSON_SCORE: usize = 4;

/// Mapping between original image coordinates and the square, padded model
/// input. Aspect ratio is preserved; the remainder is letterbox padding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    pub(crate) fn fit(orig_w: u32, orig_h: u32, input_size: u32) -> Self {
        let scale = (input_size as f32 / orig_w as f32).min(input_size as f32 / orig_h as f32);
        let pad_x = (input_size as f32 - orig_w as f32 * scale) / 2.0;
        let pad_y = (input_size as f32 - orig_h as f32 * scale) / 2.0;
        Self {
            scale,
            pad_x,
            pad_y,
        }
    }

    /// Map a box in model-input coordinates back to the original image.
    pub(crate) fn to_original(&self, bbox: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            (bbox.x1 - self.pad_x) / self.scale,
            (bbox.y1 - self.pad_y) / self.scale,
            (bbox.x2 - self.pad_x) / self.scale,
            (bbox.y2 - self.pad_y) / self.scale,
        )
    }

    pub(crate) fn scaled_size(&self, orig_w: u32, orig_h: u32) -> (u32, u32) {
        (
            ((orig_w as f32 * self.scale).round() as u32).max(1),
            ((orig_h as f32 * self.scale).round() as u32).max(1),
        )
    }

    pub(crate) fn offset(&self) -> (u32, u32) {
        (self.pad_x as u32, self.pad_y as u32)
    }
}

/// Person detector backed by an ONNX Runtime session.
///
/// The session is shared across all stream workers; inference is serialized
/// by an internal mutex so concurrent callers never race on shared tensors.
pub struct OnnxPersonDetector {
    session: Mutex<Session>,
    output_name: String,
    conf_thresh: f32,
    nms_iou: f32,
    input_size: u32,
}

impl OnnxPersonDetector {
    /// Load the model. Failure here is fatal to startup.
    pub fn new(cfg: &DetectorConfig) -> Result<Self> {
        let device: Device = cfg.device.parse()?;
        let session = build_session(&cfg.model, device)?;

        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "output0".to_string());

        info!(
            model = %cfg.model.display(),
            device = %cfg.device,
            input_size = cfg.input_size,
            "person detector initialized"
        );

        Ok(Self {
            session: Mutex::new(session),
            output_name,
            conf_thresh: cfg.conf_thresh,
            nms_iou: cfg.nms_iou,
            input_size: cfg.input_size,
        })
    }

    fn run_inference(&self, input: Value) -> Result<Vec<f32>> {
        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![input])?;
        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| DetectError::MissingOutput(self.output_name.clone()))?;
        let tensor = output.try_extract_tensor::<f32>()?;
        Ok(tensor.1.to_vec())
    }
}

impl Detector for OnnxPersonDetector {
    fn detect(&self, frame: &RgbImage, ts: DateTime<Utc>) -> Result<Vec<Detection>> {
        let (orig_w, orig_h) = frame.dimensions();
        let letterbox = Letterbox::fit(orig_w, orig_h, self.input_size);

        let input = preprocess(frame, self.input_size, &letterbox)?;
        let output = self.run_inference(input)?;

        let mut detections =
            decode_person_boxes(&output, self.conf_thresh, &letterbox, orig_w, orig_h, ts)?;
        detections = non_maximum_suppression(detections, self.nms_iou);
        debug!(count = detections.len(), "person detection completed");
        Ok(detections)
    }
}

pub(crate) fn build_session(model: &std::path::Path, device: Device) -> Result<Session> {
    if !model.exists() {
        return Err(DetectError::ModelNotFound(model.display().to_string()));
    }

    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let builder = match device {
        Device::Cuda(device_id) => {
            use ort::execution_providers::CUDAExecutionProvider;
            builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build()])?
        }
        Device::Cpu => builder,
    };

    Ok(builder.commit_from_file(model)?)
}

/// Letterbox-resize `frame` into a `[1, 3, S, S]` normalized CHW tensor.
fn preprocess(frame: &RgbImage, input_size: u32, letterbox: &Letterbox) -> Result<Value> {
    let (orig_w, orig_h) = frame.dimensions();
    let (scaled_w, scaled_h) = letterbox.scaled_size(orig_w, orig_h);
    let (off_x, off_y) = letterbox.offset();

    let resized = image::imageops::resize(
        frame,
        scaled_w,
        scaled_h,
        image::imageops::FilterType::Triangle,
    );

    // gray letterbox padding, conventional for this model family
    let mut canvas = RgbImage::from_pixel(input_size, input_size, image::Rgb([114, 114, 114]));
    image::imageops::overlay(&mut canvas, &resized, off_x as i64, off_y as i64);

    let s = input_size as usize;
    let mut chw_data: Vec<f32> = Vec::with_capacity(3 * s * s);
    for c in 0..3 {
        for y in 0..s {
            for x in 0..s {
                let pixel = canvas.get_pixel(x as u32, y as u32);
                chw_data.push(pixel[c] as f32 / 255.0);
            }
        }
    }

    let shape = vec![1usize, 3, s, s];
    Tensor::from_array((shape, chw_data.into_boxed_slice()))
        .map(Value::from)
        .map_err(DetectError::from)
}

/// Decode the flattened `[1, 84, N]` output head into person detections in
/// original-image coordinates.
pub(crate) fn decode_person_boxes(
    output: &[f32],
    conf_thresh: f32,
    letterbox: &Letterbox,
    orig_w: u32,
    orig_h: u32,
    ts: DateTime<Utc>,
) -> Result<Vec<Detection>> {
    if output.is_empty() || output.len() % NUM_FEATURES != 0 {
        return Err(DetectError::BadOutputSize(output.len()));
    }
    let num_boxes = output.len() / NUM_FEATURES;

    // [84, N] -> transposed view [N, 84]
    let array = Array::from_shape_vec((NUM_FEATURES, num_boxes), output.to_vec())
        .map_err(|_| DetectError::BadOutputSize(output.len()))?;
    let transposed = array.t();

    let mut detections = Vec::new();
    for i in 0..num_boxes {
        let score = transposed[[i, PERSON_SCORE]];
        if score < conf_thresh {
            continue;
        }

        let cx = transposed[[i, 0]];
        let cy = transposed[[i, 1]];
        let w = transposed[[i, 2]];
        let h = transposed[[i, 3]];

        let model_box = BoundingBox::from_center(cx, cy, w, h);
        let bbox = letterbox.to_original(&model_box).clamp_to(orig_w, orig_h);
        if bbox.area() <= 0.0 {
            continue;
        }

        detections.push(Detection { bbox, score, ts });
    }
    Ok(detections)
}

/// Greedy non-maximum suppression by descending confidence.
pub(crate) fn non_maximum_suppression(mut detections: Vec<Detection>, iou_thresh: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_thresh) {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            score,
            ts: Utc::now(),
        }
    }

    #[test]
    fn letterbox_round_trips_boxes() {
        // 1920x1080 into a 640 square: scale 1/3, vertical padding
        let lb = Letterbox::fit(1920, 1080, 640);
        assert_relative_eq!(lb.scale, 1.0 / 3.0, epsilon = 1e-6);
        assert_eq!(lb.offset().0, 0);
        assert_eq!(lb.offset().1, 140);

        let original = BoundingBox::new(300.0, 300.0, 600.0, 900.0);
        let in_model = BoundingBox::new(
            original.x1 * lb.scale + lb.pad_x,
            original.y1 * lb.scale + lb.pad_y,
            original.x2 * lb.scale + lb.pad_x,
            original.y2 * lb.scale + lb.pad_y,
        );
        let back = lb.to_original(&in_model);
        assert_relative_eq!(back.x1, original.x1, epsilon = 1e-3);
        assert_relative_eq!(back.y2, original.y2, epsilon = 1e-3);
    }

    #[test]
    fn nms_suppresses_overlapping_boxes() {
        let dets = vec![
            det(0.0, 0.0, 100.0, 200.0, 0.9),
            det(5.0, 0.0, 105.0, 200.0, 0.8), // heavy overlap with the first
            det(400.0, 0.0, 500.0, 200.0, 0.7),
        ];
        let kept = non_maximum_suppression(dets, 0.7);
        assert_eq!(kept.len(), 2);
        assert_relative_eq!(kept[0].score, 0.9);
        assert_relative_eq!(kept[1].score, 0.7);
    }

    #[test]
    fn nms_keeps_highest_confidence_first() {
        let dets = vec![
            det(0.0, 0.0, 100.0, 200.0, 0.6),
            det(0.0, 0.0, 100.0, 200.0, 0.95),
        ];
        let kept = non_maximum_suppression(dets, 0.7);
        assert_eq!(kept.len(), 1);
        assert_relative_eq!(kept[0].score, 0.95);
    }

    #[test]
    fn decode_keeps_person_class_only() {
        // two candidates; candidate 0 is a confident person, candidate 1 is
        // a confident non-person (class 1)
        let num_boxes = 2;
        let mut output = vec![0.0f32; NUM_FEATURES * num_boxes];
        let set = |out: &mut Vec<f32>, feature: usize, boxi: usize, v: f32| {
            out[feature * num_boxes + boxi] = v;
        };
        // person at model center
        set(&mut output, 0, 0, 320.0);
        set(&mut output, 1, 0, 320.0);
        set(&mut output, 2, 0, 80.0);
        set(&mut output, 3, 0, 200.0);
        set(&mut output, PERSON_SCORE, 0, 0.9);
        // bicycle elsewhere
        set(&mut output, 0, 1, 100.0);
        set(&mut output, 1, 1, 100.0);
        set(&mut output, 2, 1, 50.0);
        set(&mut output, 3, 1, 50.0);
        set(&mut output, PERSON_SCORE + 1, 1, 0.95);

        let lb = Letterbox::fit(640, 640, 640);
        let dets = decode_person_boxes(&output, 0.5, &lb, 640, 640, Utc::now()).unwrap();
        assert_eq!(dets.len(), 1);
        assert_relative_eq!(dets[0].score, 0.9);
        let (cx, cy) = dets[0].bbox.center();
        assert_relative_eq!(cx, 320.0, epsilon = 1e-3);
        assert_relative_eq!(cy, 320.0, epsilon = 1e-3);
    }

    #[test]
    fn decode_rejects_malformed_output() {
        let lb = Letterbox::fit(640, 640, 640);
        assert!(decode_person_boxes(&[0.0; 83], 0.5, &lb, 640, 640, Utc::now()).is_err());
        assert!(decode_person_boxes(&[], 0.5, &lb, 640, 640, Utc::now()).is_err());
    }

    #[test]
    fn decode_applies_confidence_threshold() {
        let num_boxes = 1;
        let mut output = vec![0.0f32; NUM_FEATURES * num_boxes];
        output[0] = 320.0;
        output[num_boxes] = 320.0;
        output[2 * num_boxes] = 80.0;
        output[3 * num_boxes] = 200.0;
        output[PERSON_SCORE * num_boxes] = 0.3;

        let lb = Letterbox::fit(640, 640, 640);
        let dets = decode_person_boxes(&output, 0.5, &lb, 640, 640, Utc::now()).unwrap();
        assert!(dets.is_empty());
    }
}
