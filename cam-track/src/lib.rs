//! Per-camera local tracker.
//!
//! Turns an unordered set of person detections plus their appearance
//! embeddings into a stable set of local tracks. Association is two-stage:
//! high-confidence detections are matched against all live tracks on a
//! combined IoU/appearance cost with an optimal assignment, then
//! low-confidence detections rescue lost tracks on motion IoU alone.

use nalgebra::Vector2;
use tracing::{debug, trace};

use tally_types::{BoundingBox, CamName, Embedding, EmbeddingRing, LocalTrackId, TrackerParams};

mod assignment;
mod motion;

pub use motion::ConstantVelocityModel;

use assignment::{min_cost_assignment, INFEASIBLE};

/// Lifecycle state of a local track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    /// Seen, but not yet enough consecutive hits to be trusted.
    New,
    /// Established track; eligible for global registration.
    Confirmed,
    /// Confirmed track that missed its detection; kept for recovery.
    Lost,
    /// Aged out; the id is retired and never reused.
    Removed,
}

/// A detection paired with its appearance embedding, as fed to the tracker.
#[derive(Debug, Clone)]
pub struct ObservedDetection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub embedding: Option<Embedding>,
}

/// A person identity scoped to one camera.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: LocalTrackId,
    pub bbox: BoundingBox,
    pub state: TrackState,
    /// Consecutive matched frames.
    pub hit_streak: u32,
    /// Frames since the last match.
    pub age: u32,
    pub last_update_frame: u64,
    /// Most recent appearance embedding, if any detection carried one.
    pub embedding: Option<Embedding>,
    velocity: Vector2<f32>,
    ring: EmbeddingRing,
}

/// Confirmed-track view handed to the worker each frame.
#[derive(Debug, Clone)]
pub struct TrackSnapshot {
    pub id: LocalTrackId,
    pub bbox: BoundingBox,
    pub embedding: Option<Embedding>,
}

/// Per-frame tracker output.
#[derive(Debug, Clone, Default)]
pub struct FrameUpdate {
    /// Tracks in the `Confirmed` state after this frame.
    pub confirmed: Vec<TrackSnapshot>,
    /// Local ids retired this frame. The caller releases any global
    /// bindings held by these.
    pub removed: Vec<LocalTrackId>,
}

/// Multi-object tracker for a single camera.
pub struct CamTracker {
    cam: CamName,
    params: TrackerParams,
    motion: ConstantVelocityModel,
    tracks: Vec<LocalTrack>,
    next_id: u64,
    frame_index: u64,
}

impl CamTracker {
    pub fn new(cam: CamName, params: TrackerParams) -> Self {
        Self {
            cam,
            params,
            motion: ConstantVelocityModel::default(),
            tracks: Vec::new(),
            next_id: 1,
            frame_index: 0,
        }
    }

    pub fn camera(&self) -> &CamName {
        &self.cam
    }

    /// Ingest one frame's detections and advance all track state.
    pub fn update(&mut self, detections: &[ObservedDetection]) -> FrameUpdate {
        self.frame_index += 1;

        // predicted box of every live track for this frame
        let predicted: Vec<BoundingBox> = self
            .tracks
            .iter()
            .map(|t| self.motion.predict(&t.bbox, &t.velocity, t.age + 1))
            .collect();

        let high: Vec<usize> = (0..detections.len())
            .filter(|&i| detections[i].score >= self.params.high_conf)
            .collect();
        let low: Vec<usize> = (0..detections.len())
            .filter(|&i| {
                detections[i].score < self.params.high_conf
                    && detections[i].score >= self.params.low_conf
            })
            .collect();

        let mut det_matched = vec![false; detections.len()];
        let mut trk_matched = vec![false; self.tracks.len()];

        // first pass: all live tracks x high-confidence detections
        for (ti, di) in self.first_pass(&predicted, detections, &high) {
            self.apply_match(ti, &detections[di]);
            trk_matched[ti] = true;
            det_matched[di] = true;
        }

        // second pass: unmatched lost tracks x unmatched low-confidence
        // detections, motion IoU only
        for (ti, di) in self.second_pass(&predicted, detections, &low, &trk_matched, &det_matched) {
            self.apply_match(ti, &detections[di]);
            trk_matched[ti] = true;
            det_matched[di] = true;
        }

        // unmatched tracks age; removal happens below
        for (ti, matched) in trk_matched.iter().enumerate() {
            if !matched {
                self.apply_miss(ti);
            }
        }

        // unmatched high-confidence detections spawn new tracks
        for &di in &high {
            if !det_matched[di] {
                self.spawn_track(&detections[di]);
            }
        }

        let removed: Vec<LocalTrackId> = self
            .tracks
            .iter()
            .filter(|t| t.state == TrackState::Removed)
            .map(|t| t.id)
            .collect();
        if !removed.is_empty() {
            debug!(camera = %self.cam, count = removed.len(), "retiring aged-out tracks");
        }
        self.tracks.retain(|t| t.state != TrackState::Removed);

        let confirmed = self
            .tracks
            .iter()
            .filter(|t| t.state == TrackState::Confirmed)
            .map(|t| TrackSnapshot {
                id: t.id,
                bbox: t.bbox,
                embedding: t.embedding.clone(),
            })
            .collect();

        FrameUpdate { confirmed, removed }
    }

    /// Number of live (non-removed) tracks, all states.
    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn first_pass(
        &self,
        predicted: &[BoundingBox],
        detections: &[ObservedDetection],
        high: &[usize],
    ) -> Vec<(usize, usize)> {
        if self.tracks.is_empty() || high.is_empty() {
            return vec![];
        }

        let cost: Vec<Vec<f64>> = self
            .tracks
            .iter()
            .enumerate()
            .map(|(ti, track)| {
                high.iter()
                    .map(|&di| self.pair_cost(track, &predicted[ti], &detections[di]))
                    .collect()
            })
            .collect();

        min_cost_assignment(&cost)
            .into_iter()
            .map(|(ti, hi)| (ti, high[hi]))
            .collect()
    }

    /// Association cost of one (track, detection) pair, or [`INFEASIBLE`]
    /// when the pairing fails the IoU / appearance gates.
    fn pair_cost(
        &self,
        track: &LocalTrack,
        predicted: &BoundingBox,
        det: &ObservedDetection,
    ) -> f64 {
        let iou = predicted.iou(&det.bbox);
        if iou < self.params.match_iou {
            return INFEASIBLE;
        }
        let iou_dist = (1.0 - iou) as f64;

        // appearance gate whenever embeddings exist on both sides; the
        // appearance weight applies to confirmed tracks only
        let app_dist = match (&track.embedding, &det.embedding) {
            (Some(_), Some(de)) => {
                let d = (1.0 - track.ring.max_similarity(de)) as f64;
                if d > self.params.app_thresh as f64 {
                    return INFEASIBLE;
                }
                Some(d)
            }
            _ => None,
        };

        match app_dist {
            Some(d) if track.state == TrackState::Confirmed => {
                self.params.w_iou as f64 * iou_dist + self.params.w_app as f64 * d
            }
            _ => iou_dist,
        }
    }

    fn second_pass(
        &self,
        predicted: &[BoundingBox],
        detections: &[ObservedDetection],
        low: &[usize],
        trk_matched: &[bool],
        det_matched: &[bool],
    ) -> Vec<(usize, usize)> {
        let lost: Vec<usize> = (0..self.tracks.len())
            .filter(|&ti| !trk_matched[ti] && self.tracks[ti].state == TrackState::Lost)
            .collect();
        let candidates: Vec<usize> = low.iter().copied().filter(|&di| !det_matched[di]).collect();
        if lost.is_empty() || candidates.is_empty() {
            return vec![];
        }

        let cost: Vec<Vec<f64>> = lost
            .iter()
            .map(|&ti| {
                candidates
                    .iter()
                    .map(|&di| {
                        let iou = predicted[ti].iou(&detections[di].bbox);
                        if iou < self.params.second_match_iou {
                            INFEASIBLE
                        } else {
                            (1.0 - iou) as f64
                        }
                    })
                    .collect()
            })
            .collect();

        min_cost_assignment(&cost)
            .into_iter()
            .map(|(li, ci)| (lost[li], candidates[ci]))
            .collect()
    }

    fn apply_match(&mut self, ti: usize, det: &ObservedDetection) {
        let confirm_hits = self.params.confirm_hits;
        let track = &mut self.tracks[ti];

        track.velocity = self
            .motion
            .update_velocity(&track.bbox, &det.bbox, &track.velocity);
        track.bbox = det.bbox;
        track.hit_streak += 1;
        track.age = 0;
        track.last_update_frame = self.frame_index;

        track.state = match track.state {
            TrackState::New if track.hit_streak >= confirm_hits => TrackState::Confirmed,
            TrackState::New => TrackState::New,
            // a lost track re-matched within the buffer is confirmed again
            TrackState::Lost | TrackState::Confirmed => TrackState::Confirmed,
            TrackState::Removed => TrackState::Removed,
        };

        if let Some(embedding) = &det.embedding {
            track.ring.push(self.cam.clone(), embedding.clone());
            track.embedding = Some(embedding.clone());
        }
        trace!(camera = %self.cam, id = %track.id, state = ?track.state, "track matched");
    }

    fn apply_miss(&mut self, ti: usize) {
        let track_buffer = self.params.track_buffer;
        let track = &mut self.tracks[ti];
        track.hit_streak = 0;
        track.age += 1;
        track.state = match track.state {
            // one-frame noise: a track that never reached a second hit dies
            TrackState::New => TrackState::Removed,
            TrackState::Confirmed | TrackState::Lost => {
                if track.age > track_buffer {
                    TrackState::Removed
                } else {
                    TrackState::Lost
                }
            }
            TrackState::Removed => TrackState::Removed,
        };
    }

    fn spawn_track(&mut self, det: &ObservedDetection) {
        let id = LocalTrackId(self.next_id);
        self.next_id += 1;

        let mut ring = EmbeddingRing::new(self.params.embed_ring);
        if let Some(embedding) = &det.embedding {
            ring.push(self.cam.clone(), embedding.clone());
        }

        self.tracks.push(LocalTrack {
            id,
            bbox: det.bbox,
            state: TrackState::New,
            hit_streak: 1,
            age: 0,
            last_update_frame: self.frame_index,
            embedding: det.embedding.clone(),
            velocity: Vector2::zeros(),
            ring,
        });
        trace!(camera = %self.cam, id = %id, "spawned track");
    }
}
