use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opencv::core::Mat;

use crate::config::CameraSource;
use crate::recognition::testing::solid_frame;

use super::source::{CaptureError, FrameSource, SourceOpener};

/// Channel value of every fake frame; the scripted engine sees one face.
const FRAME_PIXEL: f64 = 100.0;

/// Opener serving synthetic uniform frames for the sources it knows.
/// Unknown sources fail to open.
pub struct FakeOpener {
    sources: Vec<(CameraSource, usize)>,
    frame_delay: Duration,
    open_limit: usize,
    opened: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            frame_delay: Duration::ZERO,
            open_limit: usize::MAX,
            opened: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Each open of `source` yields `frames` frames, then reads fail.
    pub fn with_frames(mut self, source: CameraSource, frames: usize) -> Self {
        self.sources.push((source, frames));
        self
    }

    pub fn with_endless(self, source: CameraSource) -> Self {
        self.with_frames(source, usize::MAX)
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Total successful opens allowed across all sources.
    pub fn with_open_limit(mut self, limit: usize) -> Self {
        self.open_limit = limit;
        self
    }

    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl SourceOpener for FakeOpener {
    fn open(&self, source: &CameraSource, _frame_width: u32) -> Result<Box<dyn FrameSource>, CaptureError> {
        let Some((_, frames)) = self.sources.iter().find(|(s, _)| s == source) else {
            return Err(CaptureError::OpenFailed(source.to_string()));
        };
        if self.opened.fetch_add(1, Ordering::SeqCst) >= self.open_limit {
            self.opened.fetch_sub(1, Ordering::SeqCst);
            return Err(CaptureError::OpenFailed(source.to_string()));
        }
        Ok(Box::new(FakeSource {
            remaining: *frames,
            frame_delay: self.frame_delay,
            released: false,
            release_count: Arc::clone(&self.released),
        }))
    }
}

struct FakeSource {
    remaining: usize,
    frame_delay: Duration,
    released: bool,
    release_count: Arc<AtomicUsize>,
}

impl FrameSource for FakeSource {
    fn read(&mut self) -> Result<Mat, CaptureError> {
        if self.released || self.remaining == 0 {
            return Err(CaptureError::ReadFailed);
        }
        self.remaining -= 1;
        if !self.frame_delay.is_zero() {
            std::thread::sleep(self.frame_delay);
        }
        Ok(solid_frame(64, 48, FRAME_PIXEL))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.release_count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
