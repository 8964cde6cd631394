//! Default face engine: YuNet detection through OpenCV's DNN module and an
//! ArcFace-style embedding network through ONNX Runtime.

use std::path::Path;

use ndarray::Array4;
use opencv::core::{Mat, Ptr, Rect, Size};
use opencv::imgproc;
use opencv::objdetect::FaceDetectorYN;
use opencv::prelude::*;
use ort::session::Session;
use ort::value::TensorRef;

use crate::config::EngineConfig;

use super::engine::{ChannelOrder, EngineError, Encoding, FaceEngine};

const ENCODER_INPUT_SIZE: usize = 112;
const ENCODER_MEAN: f32 = 127.5;
const ENCODER_STD: f32 = 127.5;
const YUNET_NMS_THRESHOLD: f32 = 0.3;
const YUNET_TOP_K: i32 = 50;
const YUNET_OUTPUT_COLS: i32 = 15;

pub struct OnnxFaceEngine {
    detector: Ptr<FaceDetectorYN>,
    encoder: Session,
    input_size: Size,
}

impl OnnxFaceEngine {
    pub fn load(config: &EngineConfig) -> Result<Self, EngineError> {
        let detector_path = model_path(&config.detector_model)?;
        let encoder_path = model_path(&config.encoder_model)?;

        let input_size = Size::new(320, 320);
        let detector = FaceDetectorYN::create(
            &detector_path,
            "",
            input_size,
            config.score_threshold,
            YUNET_NMS_THRESHOLD,
            YUNET_TOP_K,
            opencv::dnn::DNN_BACKEND_DEFAULT,
            opencv::dnn::DNN_TARGET_CPU,
        )?;
        tracing::info!(path = %detector_path, "loaded YuNet face detector");

        let encoder = Session::builder()
            .map_err(session_error)?
            .with_intra_threads(config.intra_threads)
            .map_err(session_error)?
            .commit_from_file(&encoder_path)
            .map_err(session_error)?;

        tracing::info!(path = %encoder_path, "loaded face encoder");

        Ok(Self {
            detector,
            encoder,
            input_size,
        })
    }

    /// Crop, resize and normalise one face into a NCHW tensor.
    fn preprocess(image: &Mat, face: Rect) -> Result<Array4<f32>, EngineError> {
        let crop = Mat::roi(image, face)?.try_clone()?;

        let mut resized = Mat::default();
        imgproc::resize(
            &crop,
            &mut resized,
            Size::new(ENCODER_INPUT_SIZE as i32, ENCODER_INPUT_SIZE as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let mut rgb = Mat::default();
        imgproc::cvt_color_def(&resized, &mut rgb, imgproc::COLOR_BGR2RGB)?;

        let data = rgb.data_bytes()?;
        Ok(rgb_to_tensor(data, ENCODER_INPUT_SIZE))
    }
}

impl FaceEngine for OnnxFaceEngine {
    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Bgr
    }

    fn locate(&mut self, image: &Mat) -> Result<Vec<Rect>, EngineError> {
        let size = image.size()?;
        if size.width == 0 || size.height == 0 {
            return Ok(Vec::new());
        }
        if size != self.input_size {
            self.detector.set_input_size(size)?;
            self.input_size = size;
        }

        let mut faces = Mat::default();
        self.detector.detect(image, &mut faces)?;

        if faces.rows() <= 0 {
            return Ok(Vec::new());
        }
        if faces.cols() < YUNET_OUTPUT_COLS {
            return Err(EngineError::InferenceFailed(format!(
                "unexpected detector output: {} columns",
                faces.cols()
            )));
        }

        let mut boxes = Vec::with_capacity(faces.rows() as usize);
        for i in 0..faces.rows() {
            let x = *faces.at_2d::<f32>(i, 0)?;
            let y = *faces.at_2d::<f32>(i, 1)?;
            let w = *faces.at_2d::<f32>(i, 2)?;
            let h = *faces.at_2d::<f32>(i, 3)?;
            if let Some(rect) = clamp_rect(x, y, w, h, size) {
                boxes.push(rect);
            }
        }

        Ok(boxes)
    }

    fn encode(&mut self, image: &Mat, faces: &[Rect]) -> Result<Vec<Encoding>, EngineError> {
        let mut encodings = Vec::with_capacity(faces.len());

        for &face in faces {
            let input = Self::preprocess(image, face)?;
            let tensor_ref = TensorRef::from_array_view(input.view())?.into_dyn();
            let outputs = self.encoder.run(ort::inputs![tensor_ref])?;

            let (_, raw) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| EngineError::InferenceFailed(format!("embedding: {e}")))?;

            if raw.is_empty() {
                return Err(EngineError::InferenceFailed("empty embedding".into()));
            }
            encodings.push(Encoding::new(l2_normalize(raw)));
        }

        Ok(encodings)
    }

    fn distance(&self, known: &Encoding, candidate: &Encoding) -> f32 {
        embedding_distance(known, candidate)
    }
}

/// ArcFace embeddings are compared by angle, so the tolerance reads as
/// `1 - cos`: 0.6 accepts a cosine similarity of 0.4 or better.
fn embedding_distance(known: &Encoding, candidate: &Encoding) -> f32 {
    known.cosine_distance(candidate)
}

fn session_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::InferenceFailed(format!("encoder session: {e}"))
}

fn model_path(path: &Path) -> Result<String, EngineError> {
    if !path.exists() {
        return Err(EngineError::ModelNotFound(path.display().to_string()));
    }
    Ok(path.to_string_lossy().into_owned())
}

fn clamp_rect(x: f32, y: f32, w: f32, h: f32, bounds: Size) -> Option<Rect> {
    let x0 = x.max(0.0).floor() as i32;
    let y0 = y.max(0.0).floor() as i32;
    let x1 = ((x + w).ceil() as i32).min(bounds.width);
    let y1 = ((y + h).ceil() as i32).min(bounds.height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
}

fn rgb_to_tensor(data: &[u8], size: usize) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let idx = (y * size + x) * 3;
            for c in 0..3 {
                let pixel = data.get(idx + c).copied().unwrap_or(0) as f32;
                tensor[[0, c, y, x]] = (pixel - ENCODER_MEAN) / ENCODER_STD;
            }
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::recognition::matcher::best_match;
    use crate::recognition::registry::KnownFace;

    /// Stands in for the ONNX engine where only the metric matters.
    struct EmbeddingMetric;

    impl FaceEngine for EmbeddingMetric {
        fn locate(&mut self, _: &Mat) -> Result<Vec<Rect>, EngineError> {
            Ok(Vec::new())
        }

        fn encode(&mut self, _: &Mat, _: &[Rect]) -> Result<Vec<Encoding>, EngineError> {
            Ok(Vec::new())
        }

        fn distance(&self, known: &Encoding, candidate: &Encoding) -> f32 {
            embedding_distance(known, candidate)
        }
    }

    fn at_cosine(cos: f32) -> Encoding {
        Encoding::new(l2_normalize(&[cos, (1.0 - cos * cos).sqrt()]))
    }

    #[test]
    fn test_default_tolerance_accepts_typical_same_person_similarity() {
        let tolerance = WatchConfig::default().tolerance;
        let known = vec![KnownFace {
            label: "alice".into(),
            encoding: Encoding::new(vec![1.0, 0.0]),
        }];

        let same = best_match(&EmbeddingMetric, &at_cosine(0.6), &known, tolerance);
        assert_eq!(same.label.as_deref(), Some("alice"));
        assert!((same.distance.unwrap() - 0.4).abs() < 1e-5);

        let borderline = best_match(&EmbeddingMetric, &at_cosine(0.41), &known, tolerance);
        assert!(borderline.is_known());

        let stranger = best_match(&EmbeddingMetric, &at_cosine(0.2), &known, tolerance);
        assert!(!stranger.is_known());

        // plain euclidean on unit vectors would have rejected the same-person pair
        assert!(known[0].encoding.euclidean_distance(&at_cosine(0.6)) > tolerance);
    }

    #[test]
    fn test_clamp_rect_inside() {
        let rect = clamp_rect(10.0, 20.0, 30.0, 40.0, Size::new(100, 100)).unwrap();
        assert_eq!(rect, Rect::new(10, 20, 30, 40));
    }

    #[test]
    fn test_clamp_rect_overhanging_edges() {
        let rect = clamp_rect(-5.0, 90.0, 20.0, 20.0, Size::new(100, 100)).unwrap();
        assert_eq!(rect, Rect::new(0, 90, 15, 10));
    }

    #[test]
    fn test_clamp_rect_outside() {
        assert!(clamp_rect(120.0, 0.0, 10.0, 10.0, Size::new(100, 100)).is_none());
    }

    #[test]
    fn test_rgb_to_tensor_layout() {
        let size = 2;
        let data: Vec<u8> = vec![255, 0, 128, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let tensor = rgb_to_tensor(&data, size);
        assert_eq!(tensor.shape(), &[1, 3, 2, 2]);
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - (128.0 - 127.5) / 127.5).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
