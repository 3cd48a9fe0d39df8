//! Cross-camera global identity registry.
//!
//! Merges confirmed local tracks from every camera into a single global
//! identity namespace. One physical person maps to at most one live global
//! id: a global identity holds at most one local track per camera, and a
//! local track is bound to at most one global identity.
//!
//! The registry is a value owned by the process supervisor; stream workers
//! hold cheap clones that share the inner state behind one mutex. Every
//! acquisition from the hot path is bounded: when the lock cannot be taken
//! in time the caller gets [`MatchOutcome::Contended`] and simply retries on
//! its next frame.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use tally_types::{
    BoundingBox, CamName, Embedding, EmbeddingRing, GlobalId, LocalTrackId, OverlapGraph,
    ReidParams,
};

/// One confirmed local track observation, as submitted by a stream worker.
#[derive(Debug, Clone)]
pub struct TrackObservation {
    pub local_id: LocalTrackId,
    pub bbox: BoundingBox,
    pub embedding: Embedding,
    pub ts: DateTime<Utc>,
}

/// Result of submitting one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The observation is bound to this global identity.
    Bound(GlobalId),
    /// A primary camera is configured and has not seen this person yet; no
    /// identity was created. The local track stays intact and retries next
    /// frame.
    AwaitPrimary,
    /// The registry mutex could not be acquired within the bounded timeout.
    /// Nothing was created or destroyed; next frame retries.
    Contended,
}

#[derive(Debug, Clone)]
struct SpatialRecord {
    bbox: BoundingBox,
    last_seen: DateTime<Utc>,
}

/// A person across all cameras.
#[derive(Debug)]
struct GlobalIdentity {
    id: GlobalId,
    ring: EmbeddingRing,
    /// Currently bound local track per camera.
    bindings: BTreeMap<CamName, LocalTrackId>,
    /// Last box and time this identity was seen per camera.
    spatial: BTreeMap<CamName, SpatialRecord>,
    created_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

struct RegistryInner {
    globals: BTreeMap<GlobalId, GlobalIdentity>,
    by_local: HashMap<(CamName, LocalTrackId), GlobalId>,
    next_global_id: u64,
    created_total: u64,
}

impl RegistryInner {
    fn next_global_id(&mut self) -> GlobalId {
        let id = GlobalId(self.next_global_id);
        self.next_global_id += 1;
        self.created_total += 1;
        id
    }

    fn adopt(&mut self, gid: GlobalId, cam: &CamName, obs: &TrackObservation) {
        self.by_local.insert((cam.clone(), obs.local_id), gid);
        let g = self.globals.get_mut(&gid).expect("live global identity");
        g.bindings.insert(cam.clone(), obs.local_id);
        g.spatial.insert(
            cam.clone(),
            SpatialRecord {
                bbox: obs.bbox,
                last_seen: obs.ts,
            },
        );
        g.ring.push(cam.clone(), obs.embedding.clone());
        if obs.ts > g.last_seen {
            g.last_seen = obs.ts;
        }
    }

    fn drop_binding(&mut self, cam: &CamName, local_id: LocalTrackId) {
        if let Some(gid) = self.by_local.remove(&(cam.clone(), local_id)) {
            if let Some(g) = self.globals.get_mut(&gid) {
                if g.bindings.get(cam) == Some(&local_id) {
                    g.bindings.remove(cam);
                }
            }
        }
    }
}

/// Aggregate counts for the statistics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryCounts {
    /// Number of live global identities.
    pub total_unique: usize,
    /// Number of globals holding an active binding, per camera.
    pub per_camera: BTreeMap<CamName, usize>,
    /// Global ids ever issued over the process lifetime.
    pub created_total: u64,
}

/// Shared handle to the registry.
///
/// `clone()` copies the outer wrapper; all clones share the inner state.
#[derive(Clone)]
pub struct GlobalRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    params: Arc<ReidParams>,
    graph: Arc<OverlapGraph>,
    primary: Option<CamName>,
}

impl GlobalRegistry {
    pub fn new(params: ReidParams, graph: OverlapGraph) -> Self {
        let primary = params.primary_camera.as_deref().map(CamName::new);
        if let Some(p) = &primary {
            info!(primary = %p, "primary-camera rule enabled");
        }
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                globals: BTreeMap::new(),
                by_local: HashMap::new(),
                next_global_id: 1,
                created_total: 0,
            })),
            params: Arc::new(params),
            graph: Arc::new(graph),
            primary,
        }
    }

    /// Submit one confirmed local track and resolve its global identity.
    ///
    /// Decision order: existing binding, primary-camera gate, appearance
    /// match over candidate embedding rings, spatial fallback for
    /// overlapping views, then creation of a fresh identity.
    pub fn observe(&self, cam: &CamName, obs: &TrackObservation) -> MatchOutcome {
        let mut inner = match self.inner.try_lock_for(self.params.lock_timeout()) {
            Some(guard) => guard,
            None => {
                warn!(camera = %cam, "registry lock timed out; skipping update this frame");
                return MatchOutcome::Contended;
            }
        };

        // 1. already bound
        if let Some(&gid) = inner.by_local.get(&(cam.clone(), obs.local_id)) {
            if inner.globals.contains_key(&gid) {
                inner.adopt(gid, cam, obs);
                return MatchOutcome::Bound(gid);
            }
            // binding to an expired identity is stale; fall through
            inner.by_local.remove(&(cam.clone(), obs.local_id));
        }

        let restrict_to_primary = match &self.primary {
            Some(primary) => primary != cam,
            None => false,
        };

        // candidates respect binding exclusivity: a global already bound to
        // another local track on this camera is not considered
        let candidates: Vec<GlobalId> = inner
            .globals
            .values()
            .filter(|g| !g.bindings.contains_key(cam))
            .filter(|g| {
                !restrict_to_primary
                    || self
                        .primary
                        .as_ref()
                        .map(|p| g.ring.has_contribution_from(p))
                        .unwrap_or(false)
            })
            .map(|g| g.id)
            .collect();

        if restrict_to_primary && candidates.is_empty() {
            trace!(camera = %cam, local_id = %obs.local_id, "no primary-seen candidates; waiting");
            return MatchOutcome::AwaitPrimary;
        }

        // 3. appearance match: max similarity over each candidate's ring,
        // gated by the overlap graph
        if let Some(gid) = self.best_appearance_match(&inner, cam, obs, &candidates) {
            debug!(camera = %cam, local_id = %obs.local_id, global = %gid, "appearance match");
            inner.adopt(gid, cam, obs);
            return MatchOutcome::Bound(gid);
        }

        // 4. spatial fallback: same physical spot recently seen by an
        // overlapping camera
        if let Some(gid) = self.best_spatial_match(&inner, cam, obs, &candidates) {
            debug!(camera = %cam, local_id = %obs.local_id, global = %gid, "spatial match");
            inner.adopt(gid, cam, obs);
            return MatchOutcome::Bound(gid);
        }

        // 5. create. Only the primary camera (when configured) may mint new
        // identities.
        if restrict_to_primary {
            return MatchOutcome::AwaitPrimary;
        }

        let gid = inner.next_global_id();
        inner.globals.insert(
            gid,
            GlobalIdentity {
                id: gid,
                ring: EmbeddingRing::new(self.params.embed_ring),
                bindings: BTreeMap::new(),
                spatial: BTreeMap::new(),
                created_at: obs.ts,
                last_seen: obs.ts,
            },
        );
        inner.adopt(gid, cam, obs);
        debug!(camera = %cam, local_id = %obs.local_id, global = %gid, "created global identity");
        MatchOutcome::Bound(gid)
    }

    fn best_appearance_match(
        &self,
        inner: &RegistryInner,
        cam: &CamName,
        obs: &TrackObservation,
        candidates: &[GlobalId],
    ) -> Option<GlobalId> {
        let mut best: Option<(f32, DateTime<Utc>, GlobalId)> = None;
        for gid in candidates {
            let g = &inner.globals[gid];

            // camera compatibility: unbound anywhere, or bound on a camera
            // overlapping this one
            let compatible = g.bindings.is_empty()
                || g.bindings.keys().any(|c| self.graph.connected(c, cam));
            if !compatible {
                continue;
            }

            let similarity = g.ring.max_similarity(&obs.embedding);
            if similarity < self.params.reid_threshold {
                continue;
            }
            let better = match &best {
                None => true,
                Some((s, seen, _)) => {
                    similarity > *s || (similarity == *s && g.last_seen > *seen)
                }
            };
            if better {
                best = Some((similarity, g.last_seen, g.id));
            }
        }
        best.map(|(_, _, gid)| gid)
    }

    fn best_spatial_match(
        &self,
        inner: &RegistryInner,
        cam: &CamName,
        obs: &TrackObservation,
        candidates: &[GlobalId],
    ) -> Option<GlobalId> {
        let window = self.params.spatial_window();
        let mut best: Option<(f32, DateTime<Utc>, GlobalId)> = None;
        for gid in candidates {
            let g = &inner.globals[gid];
            for (other_cam, record) in &g.spatial {
                // same-camera continuity is the local tracker's job
                if other_cam == cam || !self.graph.connected(other_cam, cam) {
                    continue;
                }
                if obs.ts.signed_duration_since(record.last_seen) > window {
                    continue;
                }
                let iou = record.bbox.iou(&obs.bbox);
                if iou < self.params.spatial_iou {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((i, seen, _)) => iou > *i || (iou == *i && record.last_seen > *seen),
                };
                if better {
                    best = Some((iou, record.last_seen, g.id));
                }
            }
        }
        best.map(|(_, _, gid)| gid)
    }

    /// Drop the binding for a retired local track, freeing the slot so a
    /// reappearing person on the same camera can re-bind before the global
    /// identity itself expires.
    pub fn release(&self, cam: &CamName, local_id: LocalTrackId) {
        if let Some(mut inner) = self.inner.try_lock_for(self.params.lock_timeout()) {
            inner.drop_binding(cam, local_id);
        }
        // on timeout the decay sweep prunes the binding instead
    }

    /// Remove identities unseen for longer than the track timeout, and prune
    /// per-camera bindings that were not refreshed within the same window.
    /// Returns the number of identities removed. Runs at 1 Hz on the decay
    /// thread.
    pub fn remove_expired(&self, now: DateTime<Utc>) -> usize {
        let timeout = self.params.track_timeout();
        let mut inner = self.inner.lock();

        let expired: Vec<GlobalId> = inner
            .globals
            .values()
            .filter(|g| now.signed_duration_since(g.last_seen) > timeout)
            .map(|g| g.id)
            .collect();

        for gid in &expired {
            if let Some(g) = inner.globals.remove(gid) {
                let lifetime = g.last_seen.signed_duration_since(g.created_at);
                debug!(global = %g.id, lifetime_ms = lifetime.num_milliseconds(), "global identity expired");
                for (cam, local_id) in g.bindings {
                    inner.by_local.remove(&(cam, local_id));
                }
            }
        }

        // stale bindings on surviving identities (e.g. a release() call that
        // hit lock contention)
        let mut stale: Vec<(CamName, LocalTrackId)> = vec![];
        for g in inner.globals.values() {
            for (cam, local_id) in &g.bindings {
                let fresh = g
                    .spatial
                    .get(cam)
                    .map(|r| now.signed_duration_since(r.last_seen) <= timeout)
                    .unwrap_or(false);
                if !fresh {
                    stale.push((cam.clone(), *local_id));
                }
            }
        }
        for (cam, local_id) in stale {
            inner.drop_binding(&cam, local_id);
        }

        expired.len()
    }

    /// Current counts, with a bounded wait. `None` when the registry is
    /// contended; callers fall back to their previous snapshot.
    pub fn counts(&self) -> Option<RegistryCounts> {
        let inner = self.inner.try_lock_for(self.params.lock_timeout())?;
        let mut per_camera: BTreeMap<CamName, usize> = BTreeMap::new();
        for g in inner.globals.values() {
            for cam in g.bindings.keys() {
                *per_camera.entry(cam.clone()).or_insert(0) += 1;
            }
        }
        Some(RegistryCounts {
            total_unique: inner.globals.len(),
            per_camera,
            created_total: inner.created_total,
        })
    }

    /// Global identity currently bound to `(cam, local_id)`, if any.
    pub fn lookup(&self, cam: &CamName, local_id: LocalTrackId) -> Option<GlobalId> {
        self.inner
            .lock()
            .by_local
            .get(&(cam.clone(), local_id))
            .copied()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    fn some_obs() -> TrackObservation {
        TrackObservation {
            local_id: LocalTrackId(1),
            bbox: BoundingBox::new(0.0, 0.0, 50.0, 150.0),
            embedding: Embedding::unit_from(DVector::from_element(8, 1.0)).unwrap(),
            ts: Utc::now(),
        }
    }

    #[test]
    fn contended_lock_yields_soft_outcome() {
        let params = ReidParams {
            lock_timeout_ms: 10,
            ..ReidParams::default()
        };
        let reg = GlobalRegistry::new(params, OverlapGraph::default());
        let cam = CamName::new("cam-a");

        // hold the inner mutex so the bounded acquisition must time out
        let guard = reg.inner.lock();
        assert_eq!(reg.observe(&cam, &some_obs()), MatchOutcome::Contended);
        assert!(reg.counts().is_none());
        drop(guard);

        // nothing was created or destroyed by the contended calls
        assert_eq!(reg.counts().unwrap().created_total, 0);
        assert!(matches!(
            reg.observe(&cam, &some_obs()),
            MatchOutcome::Bound(_)
        ));
    }
}
