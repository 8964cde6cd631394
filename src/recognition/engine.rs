use opencv::core::{Mat, Rect};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unreadable or corrupt image: {0}")]
    Unreadable(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Channel order an engine expects its input images in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

/// Fixed-length face descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoding {
    pub values: Vec<f32>,
}

impl Encoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn euclidean_distance(&self, other: &Encoding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// `1 - cos(a, b)`, in `[0, 2]`. A zero vector is treated as orthogonal.
    pub fn cosine_distance(&self, other: &Encoding) -> f32 {
        let dot: f32 = self.values.iter().zip(other.values.iter()).map(|(a, b)| a * b).sum();
        let norms = norm(&self.values) * norm(&other.values);
        if norms <= f32::EPSILON {
            return 1.0;
        }
        1.0 - (dot / norms).clamp(-1.0, 1.0)
    }
}

fn norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Face detection and embedding backend.
///
/// Images handed to `locate`/`encode` are contiguous, in the order
/// reported by [`FaceEngine::channel_order`].
pub trait FaceEngine: Send {
    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    /// Bounding boxes of every face found in `image`.
    fn locate(&mut self, image: &Mat) -> Result<Vec<Rect>, EngineError>;

    /// One encoding per entry of `faces`, in the same order.
    fn encode(&mut self, image: &Mat, faces: &[Rect]) -> Result<Vec<Encoding>, EngineError>;

    /// Dissimilarity between two encodings; lower means more alike.
    fn distance(&self, known: &Encoding, candidate: &Encoding) -> f32 {
        known.euclidean_distance(candidate)
    }

    /// Encoding of the first face found in `image`, if any.
    fn encode_first(&mut self, image: &Mat) -> Result<Option<Encoding>, EngineError> {
        let faces = self.locate(image)?;
        let Some(first) = faces.first() else {
            return Ok(None);
        };
        Ok(self.encode(image, std::slice::from_ref(first))?.into_iter().next())
    }
}
