mod engine;
mod matcher;
mod onnx;
mod registry;
mod worker;

#[cfg(test)]
pub mod testing;

pub use engine::{Encoding, EngineError, FaceEngine};
pub use onnx::OnnxFaceEngine;
pub use registry::{KnownFace, Registry};
pub use worker::{Recognizer, RecognizerSettings};
