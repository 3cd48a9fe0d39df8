//! Frame delivery and statistics endpoints.
//!
//! `/frame/{camera}` serves the newest annotated JPEG only while it is
//! fresh; a stale slot yields a 404 with `X-Reason: stale` so the client
//! immediately retries instead of rendering an old frame. The statistics
//! endpoints are served through a short-TTL cache whose refresh lock is
//! acquired with a bounded timeout; on contention the previous payload is
//! returned rather than blocking the handler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use reid_core::GlobalRegistry;
use tally_types::{CamName, ServerConfig};

use crate::hub::FrameHub;
use crate::worker::WorkerStatus;

/// Short-TTL cache with bounded-wait refresh.
///
/// Reads are a brief rwlock clone. A stale entry is refreshed by whichever
/// caller first takes the refresh mutex; callers that cannot take it within
/// the timeout serve the previous payload instead of blocking.
pub struct TtlCache<T> {
    ttl: Duration,
    lock_timeout: Duration,
    latest: RwLock<Option<(Instant, Arc<T>)>>,
    refresh: Mutex<()>,
}

impl<T> TtlCache<T> {
    pub fn new(ttl: Duration, lock_timeout: Duration) -> Self {
        Self {
            ttl,
            lock_timeout,
            latest: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Get the cached value, refreshing via `compute` when stale. `compute`
    /// may itself fail softly (`None`), in which case the previous payload
    /// is served.
    pub fn get_with<F: FnOnce() -> Option<T>>(&self, compute: F) -> Option<Arc<T>> {
        if let Some((at, value)) = self.latest.read().clone() {
            if at.elapsed() <= self.ttl {
                return Some(value);
            }
        }

        match self.refresh.try_lock_for(self.lock_timeout) {
            Some(_guard) => {
                // another caller may have refreshed while we waited
                if let Some((at, value)) = self.latest.read().clone() {
                    if at.elapsed() <= self.ttl {
                        return Some(value);
                    }
                }
                match compute() {
                    Some(value) => {
                        let value = Arc::new(value);
                        *self.latest.write() = Some((Instant::now(), value.clone()));
                        Some(value)
                    }
                    None => self.latest.read().clone().map(|(_, v)| v),
                }
            }
            None => self.latest.read().clone().map(|(_, v)| v),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<FrameHub>,
    pub registry: GlobalRegistry,
    pub statuses: Arc<BTreeMap<CamName, Arc<WorkerStatus>>>,
    pub server: Arc<ServerConfig>,
    status_cache: Arc<TtlCache<StatusPayload>>,
    count_cache: Arc<TtlCache<PeopleCountPayload>>,
}

impl AppState {
    pub fn new(
        hub: Arc<FrameHub>,
        registry: GlobalRegistry,
        statuses: Arc<BTreeMap<CamName, Arc<WorkerStatus>>>,
        server: ServerConfig,
    ) -> Self {
        let ttl = server.status_ttl();
        let lock_timeout = server.status_lock_timeout();
        Self {
            hub,
            registry,
            statuses,
            server: Arc::new(server),
            status_cache: Arc::new(TtlCache::new(ttl, lock_timeout)),
            count_cache: Arc::new(TtlCache::new(ttl, lock_timeout)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/frame/{camera}", get(frame_handler))
        .route("/status", get(status_handler))
        .route("/people-count", get(people_count_handler))
        .route("/tracking/stats", get(tracking_stats_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct FrameQuery {
    /// Advisory only: a single pre-encoded variant is maintained.
    #[allow(dead_code)]
    quality: Option<u8>,
}

fn no_cache_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

async fn frame_handler(
    State(state): State<AppState>,
    Path(camera): Path<String>,
    Query(_q): Query<FrameQuery>,
) -> Response {
    let cam = CamName::new(camera);
    if !state.hub.contains(&cam) {
        return (StatusCode::BAD_REQUEST, "unknown camera").into_response();
    }

    // clone the bytes handle out of the slot lock; network I/O happens
    // entirely outside it
    let frame = match state.hub.latest(&cam) {
        Some(frame) => frame,
        None => {
            let mut response =
                (StatusCode::SERVICE_UNAVAILABLE, "no frames published yet").into_response();
            no_cache_headers(&mut response);
            return response;
        }
    };

    if frame.age() > state.server.freshness_bound() {
        let mut response = (StatusCode::NOT_FOUND, "no fresh frame").into_response();
        response
            .headers_mut()
            .insert("x-reason", HeaderValue::from_static("stale"));
        no_cache_headers(&mut response);
        return response;
    }

    let mut response = frame.bytes.clone().into_response();
    {
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
        if let Ok(ts) = HeaderValue::from_str(&frame.ts.to_rfc3339()) {
            headers.insert("x-frame-timestamp", ts);
        }
        if let Ok(seq) = HeaderValue::from_str(&frame.seq.to_string()) {
            headers.insert("x-frame-seq", seq);
        }
    }
    no_cache_headers(&mut response);
    response
}

#[derive(Debug, Clone, Serialize)]
struct CamStatus {
    connected: bool,
    fps: f32,
    bound_tracks: usize,
}

type StatusPayload = BTreeMap<String, CamStatus>;

fn build_status(state: &AppState) -> Option<StatusPayload> {
    Some(
        state
            .statuses
            .iter()
            .map(|(cam, status)| {
                (
                    cam.as_str().to_string(),
                    CamStatus {
                        connected: status.connected(),
                        fps: status.fps(),
                        bound_tracks: status.bound_tracks(),
                    },
                )
            })
            .collect(),
    )
}

async fn status_handler(State(state): State<AppState>) -> Response {
    match state.status_cache.get_with(|| build_status(&state)) {
        Some(payload) => axum::Json(&*payload).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "status unavailable").into_response(),
    }
}

#[derive(Debug, Clone, Serialize)]
struct PeopleCountPayload {
    total_unique: usize,
    per_camera: BTreeMap<String, usize>,
    /// Server timestamp, seconds since the unix epoch.
    ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    global_tracks_ever_created: Option<u64>,
}

fn build_people_count(state: &AppState) -> Option<PeopleCountPayload> {
    // bounded wait inside; a contended registry keeps the previous payload
    let counts = state.registry.counts()?;
    let mut per_camera: BTreeMap<String, usize> = state
        .statuses
        .keys()
        .map(|cam| (cam.as_str().to_string(), 0))
        .collect();
    for (cam, n) in counts.per_camera {
        per_camera.insert(cam.as_str().to_string(), n);
    }
    Some(PeopleCountPayload {
        total_unique: counts.total_unique,
        per_camera,
        ts: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        global_tracks_ever_created: Some(counts.created_total),
    })
}

async fn people_count_handler(State(state): State<AppState>) -> Response {
    let payload = state.count_cache.get_with(|| build_people_count(&state));
    match payload {
        Some(payload) => {
            // the ever-created counter is reserved for /tracking/stats
            let mut payload = (*payload).clone();
            payload.global_tracks_ever_created = None;
            axum::Json(payload).into_response()
        }
        None => (StatusCode::SERVICE_UNAVAILABLE, "count unavailable").into_response(),
    }
}

#[derive(Debug, Serialize)]
struct TrackingStatsPayload {
    cameras: StatusPayload,
    total_unique: usize,
    per_camera: BTreeMap<String, usize>,
    ts: f64,
    global_tracks_ever_created: u64,
    active_globals: usize,
}

async fn tracking_stats_handler(State(state): State<AppState>) -> Response {
    let status = state.status_cache.get_with(|| build_status(&state));
    let counts = state.count_cache.get_with(|| build_people_count(&state));
    match (status, counts) {
        (Some(status), Some(counts)) => axum::Json(TrackingStatsPayload {
            cameras: (*status).clone(),
            total_unique: counts.total_unique,
            per_camera: counts.per_camera.clone(),
            ts: counts.ts,
            global_tracks_ever_created: counts.global_tracks_ever_created.unwrap_or(0),
            active_globals: counts.total_unique,
        })
        .into_response(),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "stats unavailable").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_cache_serves_fresh_value_without_recompute() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), Duration::from_millis(50));
        assert_eq!(*cache.get_with(|| Some(1)).unwrap(), 1);
        // second call must hit the cache, not recompute
        assert_eq!(*cache.get_with(|| Some(2)).unwrap(), 1);
    }

    #[test]
    fn ttl_cache_refreshes_after_expiry() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::ZERO, Duration::from_millis(50));
        assert_eq!(*cache.get_with(|| Some(1)).unwrap(), 1);
        assert_eq!(*cache.get_with(|| Some(2)).unwrap(), 2);
    }

    #[test]
    fn ttl_cache_keeps_previous_payload_when_compute_fails() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::ZERO, Duration::from_millis(50));
        assert_eq!(*cache.get_with(|| Some(7)).unwrap(), 7);
        assert_eq!(*cache.get_with(|| None).unwrap(), 7);
    }

    #[test]
    fn ttl_cache_serves_previous_payload_under_contention() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::ZERO, Duration::from_millis(10));
        assert_eq!(*cache.get_with(|| Some(7)).unwrap(), 7);
        // hold the refresh lock so the bounded acquisition times out
        let _guard = cache.refresh.lock();
        assert_eq!(*cache.get_with(|| Some(9)).unwrap(), 7);
    }

    #[test]
    fn ttl_cache_empty_and_failing_yields_none() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::ZERO, Duration::from_millis(10));
        assert!(cache.get_with(|| None).is_none());
    }
}
