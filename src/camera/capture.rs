use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use opencv::core::{Mat, Point, Scalar};
use opencv::imgproc;

use crate::config::{CameraSource, Config};
use crate::pipeline::PipelineState;

use super::source::{FrameSource, SourceOpener};

const FPS_WINDOW: u64 = 30;
const STOP_POLL: Duration = Duration::from_millis(100);

/// A frame handed from a capture worker to the recognizer.
pub struct QueuedFrame {
    pub camera_id: usize,
    pub frame: Mat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Queue full, the new frame was discarded.
    Dropped,
    /// Recognizer is gone.
    Closed,
}

/// Producer end of a bounded per-camera queue. Never blocks.
pub struct FrameSender {
    tx: SyncSender<QueuedFrame>,
    dropped: u64,
}

pub fn frame_queue(capacity: usize) -> (FrameSender, Receiver<QueuedFrame>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (FrameSender { tx, dropped: 0 }, rx)
}

impl FrameSender {
    pub fn offer(&mut self, frame: QueuedFrame) -> Offer {
        match self.tx.try_send(frame) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                Offer::Dropped
            }
            Err(TrySendError::Disconnected(_)) => Offer::Closed,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Frames-per-second estimate refreshed every [`FPS_WINDOW`] frames.
pub struct FpsMeter {
    frames: u64,
    window_start: Instant,
    fps: f64,
}

impl FpsMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
            fps: 0.0,
        }
    }

    pub fn tick(&mut self, now: Instant) -> f64 {
        self.frames += 1;
        if self.frames % FPS_WINDOW == 0 {
            let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();
            if elapsed > 0.0 {
                self.fps = FPS_WINDOW as f64 / elapsed;
            }
            self.window_start = now;
        }
        self.fps
    }
}

fn draw_fps(frame: &mut Mat, fps: f64) -> Result<(), opencv::Error> {
    imgproc::put_text(
        frame,
        &format!("FPS: {fps:.1}"),
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        1.0,
        Scalar::new(0.0, 255.0, 0.0, 0.0),
        2,
        imgproc::LINE_8,
        false,
    )
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub frame_width: u32,
    pub process_every: u32,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl From<&Config> for CaptureSettings {
    fn from(config: &Config) -> Self {
        Self {
            frame_width: config.watch.frame_width,
            process_every: config.watch.process_every_n_frames.max(1),
            reconnect_attempts: config.capture.reconnect_attempts,
            reconnect_delay: Duration::from_secs(config.capture.reconnect_delay_secs),
        }
    }
}

/// Reads one source and forwards every Nth frame to the recognizer.
pub struct CaptureWorker {
    camera_id: usize,
    source: CameraSource,
    opener: Arc<dyn SourceOpener>,
    queue: FrameSender,
    state: Arc<PipelineState>,
    settings: CaptureSettings,
}

impl CaptureWorker {
    pub fn new(
        camera_id: usize,
        source: CameraSource,
        opener: Arc<dyn SourceOpener>,
        queue: FrameSender,
        state: Arc<PipelineState>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            camera_id,
            source,
            opener,
            queue,
            state,
            settings,
        }
    }

    pub fn run(mut self) {
        let state = Arc::clone(&self.state);
        let mut handle = match self.opener.open(&self.source, self.settings.frame_width) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(camera = self.camera_id, source = %self.source, error = %e, "failed to open camera");
                return;
            }
        };
        let _active = state.camera_active();
        tracing::info!(camera = self.camera_id, source = %self.source, "capture started");

        self.capture_loop(&mut handle);
        handle.release();

        tracing::info!(
            camera = self.camera_id,
            dropped = self.queue.dropped(),
            "capture stopped"
        );
    }

    fn capture_loop(&mut self, handle: &mut Box<dyn FrameSource>) {
        let mut fps = FpsMeter::new(Instant::now());
        let mut frame_count: u64 = 0;
        let process_every = u64::from(self.settings.process_every.max(1));

        while self.state.is_running() {
            let mut frame = match handle.read() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(camera = self.camera_id, error = %e, "failed to read frame");
                    handle.release();
                    match self.reconnect() {
                        Some(fresh) => {
                            *handle = fresh;
                            continue;
                        }
                        None => return,
                    }
                }
            };

            frame_count += 1;
            let current = fps.tick(Instant::now());
            if let Err(e) = draw_fps(&mut frame, current) {
                tracing::trace!(camera = self.camera_id, error = %e, "fps overlay failed");
            }

            if frame_count % process_every != 0 {
                continue;
            }
            let offer = self.queue.offer(QueuedFrame {
                camera_id: self.camera_id,
                frame,
            });
            match offer {
                Offer::Queued => {}
                Offer::Dropped => tracing::trace!(camera = self.camera_id, "queue full, frame dropped"),
                Offer::Closed => return,
            }
        }
    }

    /// Reopen the source, up to the configured number of attempts.
    fn reconnect(&self) -> Option<Box<dyn FrameSource>> {
        for attempt in 1..=self.settings.reconnect_attempts {
            if !self.sleep_while_running(self.settings.reconnect_delay) {
                return None;
            }
            tracing::info!(camera = self.camera_id, attempt, "reconnecting");
            match self.opener.open(&self.source, self.settings.frame_width) {
                Ok(handle) => return Some(handle),
                Err(e) => {
                    tracing::warn!(camera = self.camera_id, attempt, error = %e, "reconnect failed")
                }
            }
        }
        if self.settings.reconnect_attempts > 0 {
            tracing::error!(camera = self.camera_id, "giving up on camera");
        }
        None
    }

    /// False if the pipeline stopped during the wait. A delay past the
    /// clock's range waits for the stop signal only.
    fn sleep_while_running(&self, total: Duration) -> bool {
        let deadline = Instant::now().checked_add(total);
        while self.state.is_running() {
            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if now >= deadline => return true,
                Some(deadline) => deadline - now,
                None => STOP_POLL,
            };
            thread::sleep(STOP_POLL.min(remaining));
        }
        false
    }
}
