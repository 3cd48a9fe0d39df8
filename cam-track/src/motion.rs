use nalgebra::Vector2;

use tally_types::BoundingBox;

/// Constant-velocity motion model over box centers.
///
/// The state per track is the box center and a per-frame center velocity;
/// box width and height are held. Velocity estimates are exponentially
/// smoothed so a single noisy detection does not dominate the prediction.
#[derive(Debug, Clone)]
pub struct ConstantVelocityModel {
    /// Fraction of the newest velocity observation blended into the
    /// estimate, in `(0, 1]`.
    smoothing: f32,
}

impl Default for ConstantVelocityModel {
    fn default() -> Self {
        Self { smoothing: 0.6 }
    }
}

impl ConstantVelocityModel {
    pub fn new(smoothing: f32) -> Self {
        Self {
            smoothing: smoothing.clamp(f32::EPSILON, 1.0),
        }
    }

    /// Predict the box `steps` frames ahead of its last observed position.
    ///
    /// A track that has missed `k` frames is predicted `k + 1` steps ahead,
    /// since its stored box was never advanced while unmatched.
    pub fn predict(&self, bbox: &BoundingBox, velocity: &Vector2<f32>, steps: u32) -> BoundingBox {
        let (cx, cy) = bbox.center();
        let s = steps as f32;
        BoundingBox::from_center(
            cx + velocity.x * s,
            cy + velocity.y * s,
            bbox.width(),
            bbox.height(),
        )
    }

    /// Update the velocity estimate from two consecutive matched boxes.
    pub fn update_velocity(
        &self,
        previous: &BoundingBox,
        current: &BoundingBox,
        velocity: &Vector2<f32>,
    ) -> Vector2<f32> {
        let (px, py) = previous.center();
        let (cx, cy) = current.center();
        let observed = Vector2::new(cx - px, cy - py);
        velocity * (1.0 - self.smoothing) + observed * self.smoothing
    }
}
