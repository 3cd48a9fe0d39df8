use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use person_detect::{
    AppearanceEncoder, Detector, Device, HsvHistogramEncoder, OnnxAppearanceEncoder,
    OnnxPersonDetector,
};
use reid_core::GlobalRegistry;
use tally::capture::make_source;
use tally::http::{router, AppState};
use tally::hub::FrameHub;
use tally::worker::{spawn_worker, WorkerContext, WorkerHandle};
use tally_types::{parse_config_file, CamName, TallyConfig};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(required_unless_present = "print_default_config")]
    config_file: Option<std::path::PathBuf>,

    /// Print a default configuration file and exit
    #[arg(long)]
    print_default_config: bool,
}

fn main() -> anyhow::Result<()> {
    tally::tally_start();

    let args = Cli::parse();
    if args.print_default_config {
        let cfg = TallyConfig::default();
        println!("{}", toml::to_string_pretty(&cfg)?);
        return Ok(());
    }

    let config_file = args.config_file.expect("clap enforces the argument");
    let cfg = parse_config_file(&config_file)
        .with_context(|| format!("loading config file {}", config_file.display()))?;

    // model load failure is fatal at startup (non-zero exit)
    let detector: Arc<dyn Detector> =
        Arc::new(OnnxPersonDetector::new(&cfg.detector).context("loading detection model")?);
    let encoder: Arc<dyn AppearanceEncoder> = match &cfg.detector.reid_model {
        Some(model) => {
            let device: Device = cfg
                .detector
                .device
                .parse()
                .context("parsing detector device")?;
            Arc::new(
                OnnxAppearanceEncoder::new(model, device).context("loading appearance model")?,
            )
        }
        None => {
            info!("no appearance model configured; using histogram encoder");
            Arc::new(HsvHistogramEncoder::default())
        }
    };

    let graph = cfg.overlap_graph().context("building overlap graph")?;
    let registry = GlobalRegistry::new(cfg.reid.clone(), graph);
    let hub = Arc::new(FrameHub::new(cfg.camera_names()));
    let stop = Arc::new(AtomicBool::new(false));

    // one native thread per camera
    let mut handles: Vec<WorkerHandle> = Vec::with_capacity(cfg.cameras.len());
    for camera in &cfg.cameras {
        let ctx = WorkerContext {
            cam: CamName::new(&camera.name),
            source: make_source(camera),
            detector: detector.clone(),
            encoder: encoder.clone(),
            tracker_params: cfg.tracker.clone(),
            registry: registry.clone(),
            hub: hub.clone(),
            jpeg_quality: cfg.server.jpeg_quality,
        };
        handles.push(spawn_worker(ctx, stop.clone()));
    }

    // decay thread: expire identities unseen past the track timeout, at 1 Hz
    let decay_registry = registry.clone();
    let decay_stop = stop.clone();
    let decay_thread = std::thread::Builder::new()
        .name("reid-decay".to_string())
        .spawn(move || {
            while !decay_stop.load(Ordering::Relaxed) {
                let removed = decay_registry.remove_expired(chrono::Utc::now());
                if removed > 0 {
                    info!(removed, "expired global identities");
                }
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
        })
        .expect("spawn decay thread");

    let statuses: Arc<BTreeMap<CamName, Arc<tally::worker::WorkerStatus>>> = Arc::new(
        handles
            .iter()
            .map(|h| (h.cam.clone(), h.status.clone()))
            .collect(),
    );
    let state = AppState::new(hub, registry, statuses, cfg.server.clone());

    // request handlers run on the tokio pool, sized for the camera count
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(cfg.cameras.len() + 4)
        .thread_name("tally-http")
        .build()?;

    let listen_addr = cfg.server.listen_addr.clone();
    let serve_result: anyhow::Result<()> = runtime.block_on(async move {
        // bind failure is fatal at startup (non-zero exit)
        let listener = tokio::net::TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("binding {listen_addr}"))?;
        info!(addr = %listen_addr, "HTTP server listening");

        axum::serve(listener, router(state))
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to wait for shutdown signal");
                }
                info!("shutdown signal received");
            })
            .await
            .context("HTTP server failed")
    });

    info!("stopping workers");
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join();
    }
    if decay_thread.join().is_err() {
        error!("decay thread panicked");
    }

    serve_result?;
    info!("shutdown complete");
    Ok(())
}
