//! Shared data model for the tally multi-camera people counting core.

use serde::{Deserialize, Serialize};

mod config;
mod embedding;
mod geometry;

pub use config::{
    parse_config_file, CameraConfig, ConfigError, DetectorConfig, OverlapConfig, OverlapGraph,
    ReidParams, ServerConfig, TallyConfig, TrackerParams,
};
pub use embedding::{Embedding, EmbeddingRing};
pub use geometry::BoundingBox;

/// Name of one camera, unique within a deployment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CamName(String);

impl CamName {
    pub fn new<S: Into<String>>(s: S) -> Self {
        CamName(s.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CamName {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a track scoped to one camera worker.
///
/// Allocated strictly monotonically for the lifetime of the worker and never
/// reused, even after the track is removed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LocalTrackId(pub u64);

impl std::fmt::Display for LocalTrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one physical person in the cross-camera namespace.
///
/// Allocated strictly monotonically for the lifetime of the process and never
/// reused after the identity expires.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct GlobalId(pub u64);

impl std::fmt::Display for GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One person instance observed in one frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Detector confidence in `[0, 1]`.
    pub score: f32,
    /// Timestamp of the source frame.
    pub ts: chrono::DateTime<chrono::Utc>,
}
