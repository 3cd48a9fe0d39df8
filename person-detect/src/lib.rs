//! Person detection and appearance encoding.
//!
//! [`OnnxPersonDetector`] runs a YOLOv8-family ONNX model and keeps only the
//! person class. [`AppearanceEncoder`] implementations turn a detection crop
//! into a unit-norm embedding for re-identification: an optional ONNX ReID
//! model, or a histogram encoder when no model is configured.

use chrono::{DateTime, Utc};
use image::RgbImage;

use tally_types::{BoundingBox, Detection, Embedding};

mod encoder;
mod errors;
mod onnx;

pub use encoder::{HsvHistogramEncoder, OnnxAppearanceEncoder};
pub use errors::{DetectError, Result};
pub use onnx::OnnxPersonDetector;

/// Compute device for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(i32),
}

impl std::str::FromStr for Device {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            _ => match s.strip_prefix("cuda:").and_then(|n| n.parse().ok()) {
                Some(n) => Ok(Device::Cuda(n)),
                None => Err(DetectError::BadDevice(s.to_string())),
            },
        }
    }
}

/// One-frame person detection.
///
/// Implementations must be safe to share across stream workers; inference on
/// shared state is serialized internally.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &RgbImage, ts: DateTime<Utc>) -> Result<Vec<Detection>>;
}

/// Appearance embedding extraction from a detection crop.
pub trait AppearanceEncoder: Send + Sync {
    /// Dimensionality of emitted embeddings (0 when only known after the
    /// first inference).
    fn dim(&self) -> usize;

    /// Unit-norm embedding of the person inside `bbox`, or `None` when the
    /// crop is degenerate or inference failed for this frame.
    fn encode(&self, frame: &RgbImage, bbox: &BoundingBox) -> Option<Embedding>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn device_parsing() {
        assert_eq!(Device::from_str("cpu").unwrap(), Device::Cpu);
        assert_eq!(Device::from_str("cuda").unwrap(), Device::Cuda(0));
        assert_eq!(Device::from_str("cuda:1").unwrap(), Device::Cuda(1));
        assert!(Device::from_str("tpu").is_err());
        assert!(Device::from_str("cuda:x").is_err());
    }
}
