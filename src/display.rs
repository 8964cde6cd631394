use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use opencv::highgui;

use crate::enroll::is_key;
use crate::pipeline::Pipeline;

const IDLE: Duration = Duration::from_millis(20);

/// Show the latest annotated frame of every camera until `q` is pressed
/// or `shutdown` is set. Nothing is drawn while the pipeline is stopped.
pub fn run(pipeline: &Pipeline, shutdown: &AtomicBool) -> Result<(), opencv::Error> {
    tracing::info!("display started, press 'q' to quit");

    while !shutdown.load(Ordering::Relaxed) {
        let frames = if pipeline.is_running() {
            pipeline.state().latest.snapshot()
        } else {
            Vec::new()
        };
        if frames.is_empty() {
            thread::sleep(IDLE);
        }
        for (camera_id, frame) in &frames {
            highgui::imshow(&format!("Camera {camera_id}"), frame)?;
        }
        if is_key(highgui::wait_key(1)?, 'q') {
            tracing::info!("quit requested from display");
            break;
        }
    }

    highgui::destroy_all_windows()
}
