use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use opencv::core::Mat;
use opencv::prelude::*;

use crate::alert::CooldownGate;

/// Flags shared by every worker of one watch session.
pub struct PipelineState {
    running: AtomicBool,
    active_cameras: AtomicUsize,
    pub latest: LatestFrames,
    pub cooldown: CooldownGate,
}

impl PipelineState {
    pub fn new(cooldown: CooldownGate) -> Self {
        Self {
            running: AtomicBool::new(false),
            active_cameras: AtomicUsize::new(0),
            latest: LatestFrames::default(),
            cooldown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn active_cameras(&self) -> usize {
        self.active_cameras.load(Ordering::Relaxed)
    }

    /// Count a camera as delivering frames until the guard drops.
    pub fn camera_active(&self) -> ActiveCamera<'_> {
        self.active_cameras.fetch_add(1, Ordering::Relaxed);
        ActiveCamera { state: self }
    }
}

pub struct ActiveCamera<'a> {
    state: &'a PipelineState,
}

impl Drop for ActiveCamera<'_> {
    fn drop(&mut self) {
        self.state.active_cameras.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Most recent annotated frame per camera.
#[derive(Default)]
pub struct LatestFrames {
    frames: Mutex<BTreeMap<usize, Mat>>,
}

impl LatestFrames {
    pub fn store(&self, camera_id: usize, frame: Mat) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(camera_id, frame);
    }

    /// Deep copy of one camera's frame.
    pub fn get(&self, camera_id: usize) -> Option<Mat> {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.get(&camera_id).and_then(|f| f.try_clone().ok())
    }

    /// Deep copies of every frame, ordered by camera id.
    pub fn snapshot(&self) -> Vec<(usize, Mat)> {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames
            .iter()
            .filter_map(|(id, f)| Some((*id, f.try_clone().ok()?)))
            .collect()
    }

    #[cfg(test)]
    pub fn camera_ids(&self) -> Vec<usize> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
