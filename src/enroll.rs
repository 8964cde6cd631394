use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local};
use opencv::core::{Mat, Point, Scalar, Vector};
use opencv::prelude::*;
use opencv::{highgui, imgcodecs, imgproc};
use thiserror::Error;

use crate::alert::sanitize_label;
use crate::camera::{CaptureError, FrameSource};

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("capture: {0}")]
    Capture(#[from] CaptureError),
    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write {0}")]
    NotWritten(String),
    #[error("interactive enrollment needs a display, pass --count")]
    NeedsDisplay,
}

#[derive(Debug, Clone)]
pub struct EnrollOptions {
    pub label: String,
    /// Auto-capture this many images; 0 means interactive.
    pub count: u32,
    pub delay: Duration,
    pub preview: bool,
}

/// Writes reference images into `<faces_dir>/<label>/`.
pub struct Enroller {
    dir: PathBuf,
    saved: u32,
}

impl Enroller {
    pub fn new(faces_dir: &Path, label: &str) -> Result<Self, EnrollError> {
        let dir = faces_dir.join(sanitize_label(label));
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, saved: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn saved(&self) -> u32 {
        self.saved
    }

    pub fn save(&mut self, frame: &Mat, at: DateTime<Local>) -> Result<PathBuf, EnrollError> {
        let name = format!("{}_{}.jpg", at.format("%Y%m%d_%H%M%S_%6f"), self.saved + 1);
        let path = self.dir.join(name);
        let path_str = path.to_string_lossy().into_owned();
        if !imgcodecs::imwrite(&path_str, frame, &Vector::<i32>::new())? {
            return Err(EnrollError::NotWritten(path_str));
        }
        self.saved += 1;
        tracing::info!(path = %path.display(), "saved reference image");
        Ok(path)
    }
}

fn draw_overlay(frame: &Mat, opts: &EnrollOptions, saved: u32) -> Result<Mat, opencv::Error> {
    let mut overlay = frame.try_clone()?;
    imgproc::put_text(
        &mut overlay,
        &format!("Name: {}", opts.label),
        Point::new(10, 25),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.8,
        Scalar::new(0.0, 255.0, 0.0, 0.0),
        2,
        imgproc::LINE_8,
        false,
    )?;
    if opts.count > 0 {
        imgproc::put_text(
            &mut overlay,
            &format!("Auto: {saved}/{}", opts.count),
            Point::new(10, 60),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.7,
            Scalar::new(0.0, 255.0, 255.0, 0.0),
            2,
            imgproc::LINE_8,
            false,
        )?;
    }
    Ok(overlay)
}

/// Capture reference images from `source` until done or `q` is pressed.
/// Returns the number of images saved.
pub fn run(source: &mut dyn FrameSource, enroller: &mut Enroller, opts: &EnrollOptions) -> Result<u32, EnrollError> {
    if opts.count == 0 && !opts.preview {
        return Err(EnrollError::NeedsDisplay);
    }
    let window = format!("Capture -> {}", opts.label);
    let result = capture_loop(source, enroller, opts, &window);

    source.release();
    if opts.preview {
        let _ = highgui::destroy_all_windows();
    }
    tracing::info!(saved = enroller.saved(), dir = %enroller.dir().display(), "enrollment finished");
    result.map(|()| enroller.saved())
}

fn capture_loop(
    source: &mut dyn FrameSource,
    enroller: &mut Enroller,
    opts: &EnrollOptions,
    window: &str,
) -> Result<(), EnrollError> {
    loop {
        let frame = match source.read() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, "failed to read frame from camera");
                return Ok(());
            }
        };

        if opts.preview {
            highgui::imshow(window, &draw_overlay(&frame, opts, enroller.saved())?)?;
        }

        if opts.count > 0 {
            enroller.save(&frame, Local::now())?;
            if enroller.saved() >= opts.count {
                return Ok(());
            }
            thread::sleep(opts.delay);
            if opts.preview && is_key(highgui::wait_key(1)?, 'q') {
                return Ok(());
            }
            continue;
        }

        let key = highgui::wait_key(1)?;
        if is_key(key, 'c') {
            enroller.save(&frame, Local::now())?;
        } else if is_key(key, 'q') {
            return Ok(());
        }
    }
}

pub(crate) fn is_key(code: i32, key: char) -> bool {
    code >= 0 && (code & 0xFF) == key as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::testing::FakeOpener;
    use crate::camera::SourceOpener;
    use crate::config::CameraSource;

    fn auto(count: u32) -> EnrollOptions {
        EnrollOptions {
            label: "john doe".into(),
            count,
            delay: Duration::ZERO,
            preview: false,
        }
    }

    #[test]
    fn test_auto_capture_saves_count_images() {
        let root = crate::recognition::testing::temp_dir("enroll-auto");
        let source = CameraSource::LocalIndex(0);
        let opener = FakeOpener::new().with_frames(source.clone(), 10);
        let mut handle = opener.open(&source, 640).unwrap();

        let mut enroller = Enroller::new(&root, "john doe").unwrap();
        assert_eq!(run(handle.as_mut(), &mut enroller, &auto(3)).unwrap(), 3);

        let files = std::fs::read_dir(root.join("john_doe")).unwrap().count();
        assert_eq!(files, 3);
        assert_eq!(opener.released_count(), 1);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_stops_early_when_camera_fails() {
        let root = crate::recognition::testing::temp_dir("enroll-short");
        let source = CameraSource::LocalIndex(0);
        let opener = FakeOpener::new().with_frames(source.clone(), 2);
        let mut handle = opener.open(&source, 640).unwrap();

        let mut enroller = Enroller::new(&root, "amy").unwrap();
        assert_eq!(run(handle.as_mut(), &mut enroller, &auto(5)).unwrap(), 2);

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_interactive_requires_preview() {
        let root = crate::recognition::testing::temp_dir("enroll-headless");
        let source = CameraSource::LocalIndex(0);
        let opener = FakeOpener::new().with_frames(source.clone(), 1);
        let mut handle = opener.open(&source, 640).unwrap();

        let mut enroller = Enroller::new(&root, "amy").unwrap();
        assert!(matches!(
            run(handle.as_mut(), &mut enroller, &auto(0)),
            Err(EnrollError::NeedsDisplay)
        ));

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn test_key_matching() {
        assert!(is_key('q' as i32, 'q'));
        assert!(is_key(0x100 | 'c' as i32, 'c'));
        assert!(!is_key(-1, 'q'));
    }
}
