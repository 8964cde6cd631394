use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use opencv::core::{Mat, Point, Rect, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;

use crate::alert::IncidentLogger;
use crate::camera::QueuedFrame;
use crate::pipeline::PipelineState;

use super::engine::{ChannelOrder, Encoding, FaceEngine};
use super::matcher::{best_match, MatchResult};
use super::registry::Registry;

const MATCH_COLOR: (f64, f64, f64) = (0.0, 0.0, 255.0);
const UNKNOWN_COLOR: (f64, f64, f64) = (255.0, 0.0, 0.0);
const LABEL_BAR_HEIGHT: i32 = 35;

/// Convert a BGR capture into the layout `order` asks for.
/// The result is always an owned, contiguous buffer.
pub fn to_engine_layout(image: &Mat, order: ChannelOrder) -> Result<Mat, opencv::Error> {
    let converted = match order {
        ChannelOrder::Rgb => {
            let mut rgb = Mat::default();
            imgproc::cvt_color_def(image, &mut rgb, imgproc::COLOR_BGR2RGB)?;
            rgb
        }
        ChannelOrder::Bgr => image.try_clone()?,
    };
    if converted.is_continuous() {
        Ok(converted)
    } else {
        converted.try_clone()
    }
}

/// One face found in a processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceResult {
    /// Box in full-frame coordinates.
    pub rect: Rect,
    pub matched: MatchResult,
    /// Whether this sighting fired an incident.
    pub alerted: bool,
}

#[derive(Debug, Clone)]
pub struct RecognizerSettings {
    pub tolerance: f32,
    pub downscale: u32,
    pub idle_sleep: Duration,
}

/// Single consumer of every camera queue. Owns the face engine.
pub struct Recognizer {
    engine: Box<dyn FaceEngine>,
    registry: Arc<Registry>,
    state: Arc<PipelineState>,
    logger: Arc<IncidentLogger>,
    settings: RecognizerSettings,
}

impl Recognizer {
    pub fn new(
        engine: Box<dyn FaceEngine>,
        registry: Arc<Registry>,
        state: Arc<PipelineState>,
        logger: Arc<IncidentLogger>,
        settings: RecognizerSettings,
    ) -> Self {
        Self {
            engine,
            registry,
            state,
            logger,
            settings,
        }
    }

    /// Round-robin over `queues` until the pipeline stops, then hand the
    /// engine back for the next session.
    pub fn run(mut self, queues: Vec<Receiver<QueuedFrame>>) -> Box<dyn FaceEngine> {
        tracing::info!(cameras = queues.len(), known = self.registry.len(), "recognizer started");
        let mut processed: u64 = 0;

        while self.state.is_running() {
            let mut any = false;
            for rx in &queues {
                match rx.try_recv() {
                    Ok(queued) => {
                        any = true;
                        processed += 1;
                        self.process_frame(queued.camera_id, queued.frame, Instant::now(), Local::now());
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
                }
            }
            if !any {
                thread::sleep(self.settings.idle_sleep);
            }
        }

        tracing::info!(frames = processed, "recognizer stopped");
        self.engine
    }

    /// Detect, match, annotate and gate one frame.
    ///
    /// Boxes are drawn before any incident is logged, so every snapshot
    /// shows all faces of the frame. The annotated frame replaces the
    /// camera's entry in the latest-frame map.
    pub fn process_frame(
        &mut self,
        camera_id: usize,
        mut frame: Mat,
        now: Instant,
        wall: DateTime<Local>,
    ) -> Vec<FaceResult> {
        let faces = match self.detect(&frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(camera = camera_id, error = %e, "face detection failed");
                Vec::new()
            }
        };

        let results: Vec<FaceResult> = faces
            .into_iter()
            .map(|(rect, encoding)| {
                let matched = best_match(
                    self.engine.as_ref(),
                    &encoding,
                    self.registry.faces(),
                    self.settings.tolerance,
                );
                tracing::trace!(
                    camera = camera_id,
                    label = matched.display_label(),
                    distance = ?matched.distance,
                    entry = ?matched.index,
                    "face compared"
                );
                let alerted = match matched.label.as_deref() {
                    Some(label) => self.state.cooldown.authorize(label, now),
                    None => false,
                };
                FaceResult {
                    rect,
                    matched,
                    alerted,
                }
            })
            .collect();

        for face in &results {
            if let Err(e) = annotate(&mut frame, face) {
                tracing::debug!(camera = camera_id, error = %e, "annotation failed");
            }
        }

        for face in results.iter().filter(|f| f.alerted) {
            self.logger.log(&frame, face.matched.display_label(), camera_id, wall);
        }

        self.state.latest.store(camera_id, frame);
        results
    }

    /// Boxes and encodings for every face, boxes scaled to `frame`.
    fn detect(&mut self, frame: &Mat) -> Result<Vec<(Rect, Encoding)>, super::engine::EngineError> {
        let scale = self.settings.downscale.max(1) as i32;
        let small = if scale > 1 {
            let mut small = Mat::default();
            let factor = 1.0 / scale as f64;
            imgproc::resize(frame, &mut small, Size::default(), factor, factor, imgproc::INTER_LINEAR)?;
            small
        } else {
            frame.try_clone()?
        };

        let prepared = to_engine_layout(&small, self.engine.channel_order())?;
        let boxes = self.engine.locate(&prepared)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }
        let encodings = self.engine.encode(&prepared, &boxes)?;

        Ok(boxes
            .into_iter()
            .zip(encodings)
            .map(|(r, e)| (Rect::new(r.x * scale, r.y * scale, r.width * scale, r.height * scale), e))
            .collect())
    }
}

fn annotate(frame: &mut Mat, face: &FaceResult) -> Result<(), opencv::Error> {
    let (b, g, r) = if face.matched.is_known() {
        MATCH_COLOR
    } else {
        UNKNOWN_COLOR
    };
    let color = Scalar::new(b, g, r, 0.0);
    let rect = face.rect;

    imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_8, 0)?;

    let bottom = rect.y + rect.height;
    let bar = Rect::new(rect.x, bottom - LABEL_BAR_HEIGHT, rect.width, LABEL_BAR_HEIGHT);
    imgproc::rectangle(frame, bar, color, imgproc::FILLED, imgproc::LINE_8, 0)?;

    imgproc::put_text(
        frame,
        face.matched.display_label(),
        Point::new(rect.x + 6, bottom - 6),
        imgproc::FONT_HERSHEY_DUPLEX,
        0.6,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
        1,
        imgproc::LINE_8,
        false,
    )
}
