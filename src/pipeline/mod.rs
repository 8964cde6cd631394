mod state;

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

use crate::alert::IncidentLogger;
use crate::camera::{frame_queue, CaptureSettings, CaptureWorker, SourceOpener};
use crate::config::{CameraSource, Config};
use crate::recognition::{EngineError, FaceEngine, Recognizer, RecognizerSettings, Registry};

pub use state::{LatestFrames, PipelineState};

#[derive(Debug, Error)]
pub enum StartError {
    #[error("pipeline already running")]
    AlreadyRunning,
    #[error("no known faces loaded, refusing to start")]
    EmptyRegistry,
    #[error("face engine lost after a recognizer failure, restart facewatch")]
    EngineUnavailable,
    #[error("failed to rebuild face engine: {0}")]
    EngineRebuild(EngineError),
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PipelineStatus {
    pub running: bool,
    pub cameras_configured: usize,
    pub cameras_active: usize,
    pub known_faces: usize,
    pub started_at: Option<String>,
}

/// Builds a replacement engine when a recognizer panic took the old one.
pub type EngineFactory = Box<dyn Fn() -> Result<Box<dyn FaceEngine>, EngineError> + Send + Sync>;

struct Session {
    captures: Vec<(usize, JoinHandle<()>)>,
    recognizer: JoinHandle<Box<dyn FaceEngine>>,
}

struct Control {
    engine: Option<Box<dyn FaceEngine>>,
    session: Option<Session>,
}

/// Starts and stops one watch session at a time over a fixed camera list.
pub struct Pipeline {
    sources: Vec<CameraSource>,
    opener: Arc<dyn SourceOpener>,
    registry: Arc<Registry>,
    logger: Arc<IncidentLogger>,
    state: Arc<PipelineState>,
    capture: CaptureSettings,
    recognizer: RecognizerSettings,
    queue_capacity: usize,
    control: Mutex<Control>,
    engine_factory: Option<EngineFactory>,
    started_at: Mutex<Option<DateTime<Local>>>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        sources: Vec<CameraSource>,
        opener: Arc<dyn SourceOpener>,
        engine: Box<dyn FaceEngine>,
        registry: Arc<Registry>,
        logger: Arc<IncidentLogger>,
    ) -> Self {
        let cooldown = crate::alert::CooldownGate::new(config.cooldown());
        Self {
            sources,
            opener,
            registry,
            logger,
            state: Arc::new(PipelineState::new(cooldown)),
            capture: CaptureSettings::from(config),
            recognizer: RecognizerSettings {
                tolerance: config.watch.tolerance,
                downscale: config.watch.detection_downscale,
                idle_sleep: Duration::from_millis(config.watch.idle_sleep_ms),
            },
            queue_capacity: config.watch.queue_capacity,
            control: Mutex::new(Control {
                engine: Some(engine),
                session: None,
            }),
            engine_factory: None,
            started_at: Mutex::new(None),
        }
    }

    pub fn with_engine_factory(mut self, factory: EngineFactory) -> Self {
        self.engine_factory = Some(factory);
        self
    }

    pub fn state(&self) -> &Arc<PipelineState> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Spawn one capture worker per source and the recognizer.
    ///
    /// Cameras that fail to open drop out of the session on their own;
    /// the session runs as long as it was started.
    pub fn start(&self) -> Result<(), StartError> {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if control.session.is_some() {
            return Err(StartError::AlreadyRunning);
        }
        if self.registry.is_empty() {
            tracing::error!("no known faces loaded, add images to the faces directory");
            return Err(StartError::EmptyRegistry);
        }
        let engine = match control.engine.take() {
            Some(engine) => engine,
            None => self.rebuild_engine()?,
        };

        self.state.latest.clear();
        self.state.set_running(true);

        let mut captures = Vec::with_capacity(self.sources.len());
        let mut queues = Vec::with_capacity(self.sources.len());
        for (camera_id, source) in self.sources.iter().enumerate() {
            let (tx, rx) = frame_queue(self.queue_capacity);
            let worker = CaptureWorker::new(
                camera_id,
                source.clone(),
                Arc::clone(&self.opener),
                tx,
                Arc::clone(&self.state),
                self.capture.clone(),
            );
            match thread::Builder::new()
                .name(format!("capture-{camera_id}"))
                .spawn(move || worker.run())
            {
                Ok(handle) => {
                    captures.push((camera_id, handle));
                    queues.push(rx);
                }
                Err(e) => {
                    tracing::error!(camera = camera_id, error = %e, "failed to spawn capture worker")
                }
            }
        }

        let recognizer = Recognizer::new(
            engine,
            Arc::clone(&self.registry),
            Arc::clone(&self.state),
            Arc::clone(&self.logger),
            self.recognizer.clone(),
        );
        let recognizer = match thread::Builder::new()
            .name("recognizer".into())
            .spawn(move || recognizer.run(queues))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.state.set_running(false);
                join_captures(captures);
                return Err(StartError::Spawn(e));
            }
        };

        control.session = Some(Session {
            captures,
            recognizer,
        });
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Local::now());

        tracing::info!(
            cameras = self.sources.len(),
            known = self.registry.len(),
            "pipeline started"
        );
        Ok(())
    }

    /// Signal every worker and wait for all of them to exit.
    /// Returns false if nothing was running.
    pub fn stop(&self) -> bool {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = control.session.take() else {
            return false;
        };

        tracing::info!("stopping pipeline");
        self.state.set_running(false);
        join_captures(session.captures);

        match session.recognizer.join() {
            Ok(engine) => control.engine = Some(engine),
            Err(_) if self.engine_factory.is_some() => {
                tracing::error!("recognizer panicked, the face engine will be rebuilt on the next start")
            }
            Err(_) => tracing::error!("recognizer panicked and took the face engine with it, restart facewatch"),
        }
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = None;

        tracing::info!("pipeline stopped");
        true
    }

    #[cfg(test)]
    pub(crate) fn discard_engine(&self) {
        self.control.lock().unwrap_or_else(PoisonError::into_inner).engine = None;
    }

    fn rebuild_engine(&self) -> Result<Box<dyn FaceEngine>, StartError> {
        let Some(factory) = &self.engine_factory else {
            tracing::error!("no face engine available, restart facewatch to reload the models");
            return Err(StartError::EngineUnavailable);
        };
        tracing::warn!("rebuilding face engine");
        factory().map_err(|e| {
            tracing::error!(error = %e, "failed to rebuild face engine");
            StartError::EngineRebuild(e)
        })
    }

    pub fn status(&self) -> PipelineStatus {
        let started_at = *self.started_at.lock().unwrap_or_else(PoisonError::into_inner);
        PipelineStatus {
            running: self.state.is_running(),
            cameras_configured: self.sources.len(),
            cameras_active: self.state.active_cameras(),
            known_faces: self.registry.len(),
            started_at: started_at.map(|t| t.to_rfc3339()),
        }
    }
}

fn join_captures(captures: Vec<(usize, JoinHandle<()>)>) {
    for (camera_id, handle) in captures {
        if handle.join().is_err() {
            tracing::error!(camera = camera_id, "capture worker panicked");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
