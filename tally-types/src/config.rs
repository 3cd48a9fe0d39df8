//! Typed configuration loading.
//!
//! Configuration is a TOML file parsed into the structs below. Unknown keys
//! are rejected at load and all cross-references (overlap edges, primary
//! camera) are validated against the declared camera set.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::CamName;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDe {
        #[from]
        source: toml::de::Error,
    },
    #[error("lookup error on variable: {source}")]
    ShellExpand {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("no cameras configured")]
    NoCameras,
    #[error("duplicate camera name \"{0}\"")]
    DuplicateCamera(String),
    #[error("overlap edge references unknown camera \"{0}\"")]
    UnknownOverlapCamera(String),
    #[error("overlap edge connects camera \"{0}\" to itself")]
    SelfOverlap(String),
    #[error("primary camera \"{0}\" is not a configured camera")]
    UnknownPrimaryCamera(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

fn default_listen_addr() -> String {
    "127.0.0.1:3600".to_string()
}

fn default_freshness_bound_ms() -> u64 {
    50
}

fn default_status_ttl_ms() -> u64 {
    500
}

fn default_status_lock_timeout_ms() -> u64 {
    100
}

fn default_jpeg_quality() -> u8 {
    78
}

/// HTTP surface and frame delivery parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Maximum age of a published frame at delivery time, in milliseconds.
    /// Older frames are withheld and the client receives a stale-frame
    /// status instead.
    #[serde(default = "default_freshness_bound_ms")]
    pub freshness_bound_ms: u64,
    /// TTL of the status / people-count response cache.
    #[serde(default = "default_status_ttl_ms")]
    pub status_ttl_ms: u64,
    /// Bounded wait on the status cache refresh lock; on timeout the
    /// previous payload is served.
    #[serde(default = "default_status_lock_timeout_ms")]
    pub status_lock_timeout_ms: u64,
    /// JPEG quality for the annotated preview stream.
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            freshness_bound_ms: default_freshness_bound_ms(),
            status_ttl_ms: default_status_ttl_ms(),
            status_lock_timeout_ms: default_status_lock_timeout_ms(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl ServerConfig {
    pub fn freshness_bound(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.freshness_bound_ms)
    }
    pub fn status_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.status_ttl_ms)
    }
    pub fn status_lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.status_lock_timeout_ms)
    }
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_conf_thresh() -> f32 {
    0.5
}

fn default_nms_iou() -> f32 {
    0.7
}

fn default_input_size() -> u32 {
    640
}

/// Person detector parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    /// Path to the detection model weights (ONNX). Can contain shell
    /// variables such as `~`, `$A`, or `${B}`.
    pub model: std::path::PathBuf,
    /// Compute device: `"cpu"` or `"cuda:N"`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Detections below this confidence are dropped.
    #[serde(default = "default_conf_thresh")]
    pub conf_thresh: f32,
    /// Non-maximum suppression IoU threshold.
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,
    /// Square input resolution of the detection model.
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    /// Optional appearance (ReID) model. When absent, a histogram encoder
    /// is used for appearance embeddings.
    pub reid_model: Option<std::path::PathBuf>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: std::path::PathBuf::from("/path/to/yolov8n.onnx"),
            device: default_device(),
            conf_thresh: default_conf_thresh(),
            nms_iou: default_nms_iou(),
            input_size: default_input_size(),
            reid_model: None,
        }
    }
}

fn default_high_conf() -> f32 {
    0.5
}

fn default_low_conf() -> f32 {
    0.1
}

fn default_match_iou() -> f32 {
    0.8
}

fn default_second_match_iou() -> f32 {
    0.5
}

fn default_w_iou() -> f32 {
    0.7
}

fn default_w_app() -> f32 {
    0.3
}

fn default_app_thresh() -> f32 {
    0.25
}

fn default_track_buffer() -> u32 {
    30
}

fn default_confirm_hits() -> u32 {
    // suppress one-frame noise but confirm fast enough for live counting
    3
}

fn default_embed_ring() -> usize {
    10
}

/// Local (per-camera) tracker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerParams {
    /// Detections at or above this score participate in first-pass matching.
    #[serde(default = "default_high_conf")]
    pub high_conf: f32,
    /// Detections below `high_conf` but at or above this score participate
    /// in the second, recovery pass.
    #[serde(default = "default_low_conf")]
    pub low_conf: f32,
    /// Minimum IoU to accept a first-pass pairing.
    #[serde(default = "default_match_iou")]
    pub match_iou: f32,
    /// Minimum motion IoU to accept a second-pass (lost-track) pairing.
    #[serde(default = "default_second_match_iou")]
    pub second_match_iou: f32,
    /// Weight of the IoU distance term in the association cost.
    #[serde(default = "default_w_iou")]
    pub w_iou: f32,
    /// Weight of the appearance distance term (confirmed tracks only).
    #[serde(default = "default_w_app")]
    pub w_app: f32,
    /// Maximum appearance cosine distance to accept a pairing.
    #[serde(default = "default_app_thresh")]
    pub app_thresh: f32,
    /// Frames a lost track is kept before removal.
    #[serde(default = "default_track_buffer")]
    pub track_buffer: u32,
    /// Consecutive hits before a new track is confirmed.
    #[serde(default = "default_confirm_hits")]
    pub confirm_hits: u32,
    /// Capacity of the per-track appearance embedding ring.
    #[serde(default = "default_embed_ring")]
    pub embed_ring: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            high_conf: default_high_conf(),
            low_conf: default_low_conf(),
            match_iou: default_match_iou(),
            second_match_iou: default_second_match_iou(),
            w_iou: default_w_iou(),
            w_app: default_w_app(),
            app_thresh: default_app_thresh(),
            track_buffer: default_track_buffer(),
            confirm_hits: default_confirm_hits(),
            embed_ring: default_embed_ring(),
        }
    }
}

fn default_reid_threshold() -> f32 {
    0.75
}

fn default_spatial_window_s() -> f64 {
    2.0
}

fn default_spatial_iou() -> f32 {
    0.30
}

fn default_track_timeout_s() -> f64 {
    3.0
}

fn default_lock_timeout_ms() -> u64 {
    100
}

/// Cross-camera re-identification parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReidParams {
    /// Minimum cosine similarity (not distance) to adopt an existing global
    /// identity by appearance.
    #[serde(default = "default_reid_threshold")]
    pub reid_threshold: f32,
    /// Maximum age of a spatial record used by the same-view fallback.
    #[serde(default = "default_spatial_window_s")]
    pub spatial_window_s: f64,
    /// Minimum IoU for the spatial fallback.
    #[serde(default = "default_spatial_iou")]
    pub spatial_iou: f32,
    /// Global identities unseen for longer than this are removed.
    #[serde(default = "default_track_timeout_s")]
    pub track_timeout_s: f64,
    /// Bounded wait on the registry mutex; on timeout the caller skips the
    /// update for this frame and retries on the next.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// When set, only this camera may create new global identities; other
    /// cameras only match identities the primary has already seen.
    pub primary_camera: Option<String>,
    /// Capacity of the per-identity appearance embedding ring.
    #[serde(default = "default_embed_ring")]
    pub embed_ring: usize,
}

impl Default for ReidParams {
    fn default() -> Self {
        Self {
            reid_threshold: default_reid_threshold(),
            spatial_window_s: default_spatial_window_s(),
            spatial_iou: default_spatial_iou(),
            track_timeout_s: default_track_timeout_s(),
            lock_timeout_ms: default_lock_timeout_ms(),
            primary_camera: None,
            embed_ring: default_embed_ring(),
        }
    }
}

impl ReidParams {
    pub fn track_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.track_timeout_s * 1000.0) as i64)
    }
    pub fn spatial_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.spatial_window_s * 1000.0) as i64)
    }
    pub fn lock_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_timeout_ms)
    }
}

fn default_fps() -> f32 {
    30.0
}

/// One camera definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    /// Camera name, unique within the configuration.
    pub name: String,
    /// Stream URL. `rtsp://...` opens a live RTSP capture; `test://...`
    /// opens a synthetic moving-person source.
    pub url: String,
    /// Nominal frame rate of the source.
    #[serde(default = "default_fps")]
    pub fps: f32,
}

/// Static declaration of which cameras can view the same physical space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverlapConfig {
    /// Undirected edges as camera-name pairs.
    #[serde(default)]
    pub edges: Vec<[String; 2]>,
}

/// Undirected camera adjacency built from [`OverlapConfig`].
#[derive(Debug, Clone, Default)]
pub struct OverlapGraph {
    adj: BTreeMap<CamName, BTreeSet<CamName>>,
}

impl OverlapGraph {
    pub fn connected(&self, a: &CamName, b: &CamName) -> bool {
        self.adj.get(a).map(|s| s.contains(b)).unwrap_or(false)
    }

    fn insert_edge(&mut self, a: CamName, b: CamName) {
        self.adj.entry(a.clone()).or_default().insert(b.clone());
        self.adj.entry(b).or_default().insert(a);
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TallyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub tracker: TrackerParams,
    #[serde(default)]
    pub reid: ReidParams,
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub overlap: OverlapConfig,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            detector: DetectorConfig::default(),
            tracker: TrackerParams::default(),
            reid: ReidParams::default(),
            cameras: vec![
                CameraConfig {
                    name: "test-camera-1".to_string(),
                    url: "test://moving-person".to_string(),
                    fps: default_fps(),
                },
                CameraConfig {
                    name: "test-camera-2".to_string(),
                    url: "test://moving-person".to_string(),
                    fps: default_fps(),
                },
            ],
            overlap: OverlapConfig {
                edges: vec![["test-camera-1".to_string(), "test-camera-2".to_string()]],
            },
        }
    }
}

impl TallyConfig {
    pub fn camera_names(&self) -> Vec<CamName> {
        self.cameras.iter().map(|c| CamName::new(&c.name)).collect()
    }

    pub fn primary_camera(&self) -> Option<CamName> {
        self.reid.primary_camera.as_deref().map(CamName::new)
    }

    /// Build the overlap graph, validating that every edge endpoint is a
    /// declared camera.
    pub fn overlap_graph(&self) -> Result<OverlapGraph> {
        let names: BTreeSet<&str> = self.cameras.iter().map(|c| c.name.as_str()).collect();
        let mut graph = OverlapGraph::default();
        for [a, b] in &self.overlap.edges {
            for end in [a, b] {
                if !names.contains(end.as_str()) {
                    return Err(ConfigError::UnknownOverlapCamera(end.clone()));
                }
            }
            if a == b {
                return Err(ConfigError::SelfOverlap(a.clone()));
            }
            graph.insert_edge(CamName::new(a), CamName::new(b));
        }
        Ok(graph)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        let mut seen = BTreeSet::new();
        for cam in &self.cameras {
            if !seen.insert(cam.name.as_str()) {
                return Err(ConfigError::DuplicateCamera(cam.name.clone()));
            }
        }
        self.overlap_graph()?;
        if let Some(primary) = &self.reid.primary_camera {
            if !seen.contains(primary.as_str()) {
                return Err(ConfigError::UnknownPrimaryCamera(primary.clone()));
            }
        }
        Ok(())
    }

    /// Expand shell variables in model paths and make relative paths
    /// relative to the config file's directory.
    fn fixup_relative_paths(&mut self, dirname: &std::path::Path) -> Result<()> {
        fixup_relative_path(&mut self.detector.model, dirname)?;
        if let Some(reid_model) = self.detector.reid_model.as_mut() {
            fixup_relative_path(reid_model, dirname)?;
        }
        Ok(())
    }
}

fn fixup_relative_path(path: &mut std::path::PathBuf, dirname: &std::path::Path) -> Result<()> {
    let pathstr = path.to_string_lossy();
    let expanded = shellexpand::full(&pathstr)?;
    *path = std::path::PathBuf::from(expanded.to_string());
    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

/// Parse and validate a configuration file.
pub fn parse_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<TallyConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let mut cfg: TallyConfig = toml::from_str(&contents)?;
    let dirname = fname
        .as_ref()
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    cfg.fixup_relative_paths(&dirname)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [detector]
        model = "/models/person.onnx"

        [[cameras]]
        name = "cam-a"
        url = "rtsp://10.0.0.2/stream1"

        [[cameras]]
        name = "cam-b"
        url = "rtsp://10.0.0.3/stream1"

        [overlap]
        edges = [["cam-a", "cam-b"]]
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: TallyConfig = toml::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.cameras.len(), 2);
        assert_eq!(cfg.server.freshness_bound_ms, 50);
        assert_eq!(cfg.tracker.match_iou, 0.8);
        assert_eq!(cfg.reid.reid_threshold, 0.75);
        let graph = cfg.overlap_graph().unwrap();
        assert!(graph.connected(&CamName::new("cam-a"), &CamName::new("cam-b")));
        assert!(graph.connected(&CamName::new("cam-b"), &CamName::new("cam-a")));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let bad = format!("{MINIMAL}\n[server]\nfreshness_bound_msec = 50\n");
        assert!(toml::from_str::<TallyConfig>(&bad).is_err());
    }

    #[test]
    fn overlap_edge_to_unknown_camera_is_rejected() {
        let cfg: TallyConfig = toml::from_str(
            r#"
            [detector]
            model = "/m.onnx"
            [[cameras]]
            name = "cam-a"
            url = "rtsp://x/1"
            [overlap]
            edges = [["cam-a", "cam-z"]]
            "#,
        )
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownOverlapCamera(_))
        ));
    }

    #[test]
    fn duplicate_camera_names_are_rejected() {
        let cfg: TallyConfig = toml::from_str(
            r#"
            [detector]
            model = "/m.onnx"
            [[cameras]]
            name = "cam-a"
            url = "rtsp://x/1"
            [[cameras]]
            name = "cam-a"
            url = "rtsp://x/2"
            "#,
        )
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateCamera(_))
        ));
    }

    #[test]
    fn unknown_primary_camera_is_rejected() {
        let cfg: TallyConfig = toml::from_str(
            r#"
            [detector]
            model = "/m.onnx"
            [reid]
            primary_camera = "cam-z"
            [[cameras]]
            name = "cam-a"
            url = "rtsp://x/1"
            "#,
        )
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownPrimaryCamera(_))
        ));
    }

    #[test]
    fn default_config_is_valid_and_round_trips() {
        let cfg = TallyConfig::default();
        cfg.validate().unwrap();
        let serialized = toml::to_string_pretty(&cfg).unwrap();
        let reparsed: TallyConfig = toml::from_str(&serialized).unwrap();
        reparsed.validate().unwrap();
    }
}
