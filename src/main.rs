use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod alert;
mod api;
mod camera;
mod config;
mod display;
mod enroll;
mod pipeline;
mod recognition;
mod storage;

use alert::{spawn_notifier, AlertBus, IncidentLogger};
use api::AppState;
use camera::{scan_devices, OpenCvOpener, SourceOpener};
use config::{CameraSource, Config};
use pipeline::Pipeline;
use recognition::{FaceEngine, OnnxFaceEngine, Registry};
use storage::IncidentStore;

const ALERT_BUS_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "facewatch", version, about = "Multi-camera face watchlist")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the configured cameras for known faces
    Run {
        /// Path to the TOML config (default: ./config.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Camera index or stream URL; repeat to replace the configured list
        #[arg(long = "camera")]
        cameras: Vec<String>,
        /// Run without preview windows
        #[arg(long)]
        headless: bool,
    },
    /// Check which local camera indices deliver frames
    Cameras {
        #[arg(long, default_value_t = 5)]
        max_index: u32,
    },
    /// Capture reference images for one person
    Enroll {
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value_t = 0)]
        camera: u32,
        /// Auto-capture this many images, 0 for interactive
        #[arg(long, default_value_t = 0)]
        count: u32,
        /// Seconds between auto-captures
        #[arg(long, default_value_t = 0.5)]
        delay: f64,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("facewatch=info".parse()?))
        .init();

    match Cli::parse().command {
        Commands::Run {
            config,
            cameras,
            headless,
        } => run(config, cameras, headless),
        Commands::Cameras { max_index } => {
            list_cameras(max_index);
            Ok(())
        }
        Commands::Enroll {
            name,
            camera,
            count,
            delay,
            width,
            config,
        } => {
            let config = Config::load(config.as_deref())?;
            let mut source = OpenCvOpener.open(&CameraSource::LocalIndex(camera), width)?;
            let mut enroller = enroll::Enroller::new(&config.watch.faces_dir, &name)?;
            let opts = enroll::EnrollOptions {
                label: name,
                count,
                delay: Duration::from_secs_f64(delay.max(0.0)),
                preview: true,
            };
            let saved = enroll::run(source.as_mut(), &mut enroller, &opts)?;
            println!("Done. Captured {saved} images to {}", enroller.dir().display());
            Ok(())
        }
    }
}

fn run(config_path: Option<PathBuf>, cameras: Vec<String>, headless: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(config_path.as_deref())?;
    if !cameras.is_empty() {
        config.cameras = cameras;
        config.validate()?;
    }
    if headless {
        config.display.enabled = false;
    }
    let sources = config.camera_sources()?;
    tracing::info!("loaded {} camera(s)", sources.len());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("facewatch-rt")
        .build()?;

    let mut engine = OnnxFaceEngine::load(&config.engine)?;
    let registry = Arc::new(Registry::load(&config.watch.faces_dir, &mut engine));

    let store = IncidentStore::new(config.alerts.history);
    store.scan(&config.watch.incidents_dir);

    let bus = AlertBus::new(ALERT_BUS_CAPACITY);
    let notifier = spawn_notifier(
        runtime.handle(),
        &bus,
        &config.alerts.sink_url,
        Duration::from_millis(config.alerts.timeout_ms),
    );
    let logger = Arc::new(IncidentLogger::new(
        config.watch.incidents_dir.clone(),
        store.clone(),
        bus.clone(),
    ));

    let engine_config = config.engine.clone();
    let pipeline = Arc::new(
        Pipeline::new(
            &config,
            sources,
            Arc::new(OpenCvOpener),
            Box::new(engine),
            registry,
            logger,
        )
        .with_engine_factory(Box::new(move || {
            Ok(Box::new(OnnxFaceEngine::load(&engine_config)?) as Box<dyn FaceEngine>)
        })),
    );

    if config.http.enabled {
        let state = AppState::new(Arc::clone(&pipeline), store.clone(), bus.clone());
        let dir = config.watch.incidents_dir.clone();
        let port = config.http.port;
        runtime.spawn(async move {
            if let Err(e) = api::start_server(state, dir, port).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    pipeline.start()?;

    if config.display.enabled {
        if let Err(e) = display::run(&pipeline, &shutdown) {
            tracing::error!(error = %e, "display failed, continuing headless");
            wait_for(&shutdown);
        }
    } else {
        wait_for(&shutdown);
    }

    pipeline.stop();
    if let Some(handle) = notifier {
        handle.abort();
    }
    runtime.shutdown_timeout(Duration::from_secs(1));

    tracing::info!(incidents = store.len(), "shutdown complete");
    Ok(())
}

fn wait_for(shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }
}

fn list_cameras(max_index: u32) {
    println!("Checking camera indices 0..{}", max_index);
    for device in scan_devices(&OpenCvOpener, max_index, 640) {
        let verdict = match (device.opened, device.delivered_frame) {
            (true, true) => "available",
            (true, false) => "opens but delivers no frames",
            (false, _) => "not available",
        };
        println!("  camera {}: {}", device.index, verdict);
    }
}
