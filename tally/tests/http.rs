//! Endpoint behavior: freshness gating of `/frame/{camera}`, mandatory
//! no-cache headers, and the cached statistics responses.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use nalgebra::DVector;
use tower::ServiceExt;

use reid_core::{GlobalRegistry, TrackObservation};
use tally::http::{router, AppState};
use tally::hub::FrameHub;
use tally::worker::WorkerStatus;
use tally_types::{
    BoundingBox, CamName, Embedding, LocalTrackId, OverlapGraph, ReidParams, ServerConfig,
};

fn make_state(server: ServerConfig) -> AppState {
    let cams = [CamName::new("cam-a"), CamName::new("cam-b")];
    let hub = Arc::new(FrameHub::new(cams.clone()));
    let registry = GlobalRegistry::new(ReidParams::default(), OverlapGraph::default());
    let statuses: Arc<BTreeMap<CamName, Arc<WorkerStatus>>> = Arc::new(
        cams.iter()
            .map(|c| (c.clone(), Arc::new(WorkerStatus::default())))
            .collect(),
    );
    AppState::new(hub, registry, statuses, server)
}

fn fast_expiring_server() -> ServerConfig {
    ServerConfig {
        status_ttl_ms: 0,
        ..ServerConfig::default()
    }
}

async fn get(state: &AppState, uri: &str) -> axum::response::Response {
    router(state.clone())
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn unknown_camera_is_bad_request() {
    let state = make_state(ServerConfig::default());
    let response = get(&state, "/frame/not-a-camera").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn no_published_frame_is_service_unavailable() {
    let state = make_state(ServerConfig::default());
    let response = get(&state, "/frame/cam-a").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn fresh_frame_is_served_with_no_cache_headers() {
    let state = make_state(ServerConfig::default());
    state
        .hub
        .publish(&CamName::new("cam-a"), Bytes::from_static(b"jpegdata"), chrono::Utc::now());

    let response = get(&state, "/frame/cam-a?quality=80").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "image/jpeg");
    assert_eq!(response.headers()["cache-control"], "no-store, no-cache");
    assert_eq!(response.headers()["pragma"], "no-cache");
    assert_eq!(response.headers()["expires"], "0");
    assert_eq!(response.headers()["x-frame-seq"], "1");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"jpegdata");
}

#[tokio::test]
async fn stale_frame_is_withheld() {
    // freshness bound of zero: every published frame is immediately stale
    let server = ServerConfig {
        freshness_bound_ms: 0,
        ..ServerConfig::default()
    };
    let state = make_state(server);
    state
        .hub
        .publish(&CamName::new("cam-a"), Bytes::from_static(b"old"), chrono::Utc::now());
    std::thread::sleep(std::time::Duration::from_millis(5));

    let response = get(&state, "/frame/cam-a").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["x-reason"], "stale");
    assert_eq!(response.headers()["cache-control"], "no-store, no-cache");
}

#[tokio::test]
async fn status_reports_every_camera() {
    let state = make_state(fast_expiring_server());
    let response = get(&state, "/status").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["cam-a"]["connected"], false);
    assert_eq!(json["cam-a"]["fps"], 0.0);
    assert_eq!(json["cam-b"]["bound_tracks"], 0);
}

#[tokio::test]
async fn people_count_follows_registry() {
    let state = make_state(fast_expiring_server());

    let response = get(&state, "/people-count").await;
    let json = body_json(response).await;
    assert_eq!(json["total_unique"], 0);
    assert_eq!(json["per_camera"]["cam-a"], 0);

    let embedding = Embedding::unit_from(DVector::from_element(16, 1.0)).unwrap();
    state.registry.observe(
        &CamName::new("cam-a"),
        &TrackObservation {
            local_id: LocalTrackId(1),
            bbox: BoundingBox::new(10.0, 10.0, 60.0, 160.0),
            embedding,
            ts: chrono::Utc::now(),
        },
    );

    let response = get(&state, "/people-count").await;
    let json = body_json(response).await;
    assert_eq!(json["total_unique"], 1);
    assert_eq!(json["per_camera"]["cam-a"], 1);
    assert_eq!(json["per_camera"]["cam-b"], 0);
    assert!(json["ts"].as_f64().unwrap() > 0.0);
    // the ever-created counter is not part of this payload
    assert!(json.get("global_tracks_ever_created").is_none());
}

#[tokio::test]
async fn tracking_stats_unions_status_and_counts() {
    let state = make_state(fast_expiring_server());
    let embedding = Embedding::unit_from(DVector::from_element(16, 1.0)).unwrap();
    state.registry.observe(
        &CamName::new("cam-b"),
        &TrackObservation {
            local_id: LocalTrackId(4),
            bbox: BoundingBox::new(10.0, 10.0, 60.0, 160.0),
            embedding,
            ts: chrono::Utc::now(),
        },
    );

    let response = get(&state, "/tracking/stats").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total_unique"], 1);
    assert_eq!(json["active_globals"], 1);
    assert_eq!(json["global_tracks_ever_created"], 1);
    assert!(json["cameras"]["cam-a"].is_object());
}

#[tokio::test]
async fn status_cache_holds_payload_within_ttl() {
    // long TTL: registry changes are not visible until the cache expires
    let state = make_state(ServerConfig::default());
    let json = body_json(get(&state, "/people-count").await).await;
    assert_eq!(json["total_unique"], 0);

    let embedding = Embedding::unit_from(DVector::from_element(16, 1.0)).unwrap();
    state.registry.observe(
        &CamName::new("cam-a"),
        &TrackObservation {
            local_id: LocalTrackId(1),
            bbox: BoundingBox::new(10.0, 10.0, 60.0, 160.0),
            embedding,
            ts: chrono::Utc::now(),
        },
    );

    let json = body_json(get(&state, "/people-count").await).await;
    assert_eq!(json["total_unique"], 0, "cached payload expected");
}
