//! Application plumbing for the tally people-counting service: per-camera
//! stream workers, the latest-frame hub, annotation, and the HTTP surface.

pub mod annotate;
pub mod capture;
pub mod http;
pub mod hub;
pub mod worker;

/// Seed environment defaults: load `.env` and provide a default `RUST_LOG`
/// filter when the user has not set one.
pub fn tally_start() {
    dotenv::dotenv().ok();

    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var(
            "RUST_LOG",
            "tally=info,tally_types=info,person_detect=info,cam_track=info,reid_core=info,warn",
        );
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
