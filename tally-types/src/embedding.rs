use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::CamName;

/// Fixed-dimension unit-norm appearance vector.
///
/// The dimensionality is whatever the configured encoder emits; it is not
/// fixed here. Cosine similarity between unit-norm vectors is the plain dot
/// product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding(DVector<f32>);

impl Embedding {
    /// Normalize `v` to unit L2 norm. Returns `None` for a zero (or
    /// non-finite) vector, which carries no appearance information.
    pub fn unit_from(v: DVector<f32>) -> Option<Self> {
        let norm = v.norm();
        if !norm.is_finite() || norm <= f32::EPSILON {
            return None;
        }
        Some(Embedding(v / norm))
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    /// Cosine similarity in `[-1, 1]`. Vectors of mismatched dimensionality
    /// never match.
    pub fn cosine(&self, other: &Embedding) -> f32 {
        if self.0.len() != other.0.len() {
            return -1.0;
        }
        self.0.dot(&other.0)
    }
}

/// Bounded FIFO ring of recent appearance embeddings, each tagged with the
/// camera that contributed it.
#[derive(Debug, Clone)]
pub struct EmbeddingRing {
    entries: std::collections::VecDeque<(CamName, Embedding)>,
    capacity: usize,
}

impl EmbeddingRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: std::collections::VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, cam: CamName, embedding: Embedding) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((cam, embedding));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum cosine similarity of `query` against every stored embedding.
    ///
    /// Max rather than mean, so that recently observed appearances dominate.
    /// Returns `-1.0` for an empty ring.
    pub fn max_similarity(&self, query: &Embedding) -> f32 {
        self.entries
            .iter()
            .map(|(_, e)| e.cosine(query))
            .fold(-1.0, f32::max)
    }

    /// Whether any stored embedding was contributed by `cam`.
    pub fn has_contribution_from(&self, cam: &CamName) -> bool {
        self.entries.iter().any(|(c, _)| c == cam)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn unit(values: &[f32]) -> Embedding {
        Embedding::unit_from(DVector::from_row_slice(values)).unwrap()
    }

    #[test]
    fn unit_from_normalizes() {
        let e = unit(&[3.0, 4.0]);
        assert_relative_eq!(e.cosine(&e), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn unit_from_rejects_zero_vector() {
        assert!(Embedding::unit_from(DVector::zeros(4)).is_none());
    }

    #[test]
    fn cosine_of_mismatched_dims_never_matches() {
        let a = unit(&[1.0, 0.0]);
        let b = unit(&[1.0, 0.0, 0.0]);
        assert_eq!(a.cosine(&b), -1.0);
    }

    #[test]
    fn ring_evicts_oldest() {
        let cam = CamName::new("a");
        let mut ring = EmbeddingRing::new(2);
        ring.push(cam.clone(), unit(&[1.0, 0.0]));
        ring.push(cam.clone(), unit(&[0.0, 1.0]));
        ring.push(cam.clone(), unit(&[0.0, -1.0]));
        assert_eq!(ring.len(), 2);
        // the [1, 0] entry was evicted, so an identical query only matches
        // via the orthogonal survivors
        assert!(ring.max_similarity(&unit(&[1.0, 0.0])) < 0.5);
    }

    #[test]
    fn ring_max_similarity_takes_best_entry() {
        let cam = CamName::new("a");
        let mut ring = EmbeddingRing::new(4);
        ring.push(cam.clone(), unit(&[1.0, 0.0]));
        ring.push(cam.clone(), unit(&[0.0, 1.0]));
        assert_relative_eq!(ring.max_similarity(&unit(&[1.0, 0.0])), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn ring_tracks_camera_contributions() {
        let mut ring = EmbeddingRing::new(4);
        ring.push(CamName::new("a"), unit(&[1.0, 0.0]));
        assert!(ring.has_contribution_from(&CamName::new("a")));
        assert!(!ring.has_contribution_from(&CamName::new("b")));
    }
}
