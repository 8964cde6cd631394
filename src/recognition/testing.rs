use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use opencv::core::{Mat, Rect, Scalar, Vec3b, Vector, CV_8UC3};
use opencv::imgcodecs;
use opencv::prelude::*;

use super::engine::{EngineError, Encoding, FaceEngine};

static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Fresh empty directory under the system temp dir.
pub fn temp_dir(name: &str) -> PathBuf {
    let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("facewatch-{name}-{}-{n}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn solid_frame(width: i32, height: i32, value: f64) -> Mat {
    Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::all(value)).unwrap()
}

/// Write a uniform 8x8 PNG regardless of the extension in `path`.
pub fn write_image(path: &Path, value: u8) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let image = solid_frame(8, 8, value as f64);
    let mut buf = Vector::<u8>::new();
    imgcodecs::imencode(".png", &image, &mut buf, &Vector::<i32>::new()).unwrap();
    std::fs::write(path, buf.to_vec()).unwrap();
}

/// Engine keyed on the first channel of the bottom-right pixel, which the
/// FPS overlay never reaches.
///
/// A non-black image holds one face covering the whole image, encoded as
/// `[value, 0.0]`. A white image fails to encode.
#[derive(Default)]
pub struct ScriptedEngine {
    pub located: usize,
}

fn sample(image: &Mat) -> Result<f32, EngineError> {
    let px = image.at_2d::<Vec3b>(image.rows() - 1, image.cols() - 1)?;
    Ok(f32::from(px[0]))
}

impl FaceEngine for ScriptedEngine {
    fn locate(&mut self, image: &Mat) -> Result<Vec<Rect>, EngineError> {
        self.located += 1;
        if sample(image)? < 1.0 {
            return Ok(Vec::new());
        }
        Ok(vec![Rect::new(0, 0, image.cols(), image.rows())])
    }

    fn encode(&mut self, image: &Mat, faces: &[Rect]) -> Result<Vec<Encoding>, EngineError> {
        let value = sample(image)?;
        if value >= 255.0 {
            return Err(EngineError::InferenceFailed("saturated input".into()));
        }
        Ok(faces.iter().map(|_| Encoding::new(vec![value, 0.0])).collect())
    }
}
