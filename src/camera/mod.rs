mod capture;
mod source;

#[cfg(test)]
pub mod testing;

pub use capture::{frame_queue, CaptureSettings, CaptureWorker, QueuedFrame};
pub use source::{scan_devices, CaptureError, FrameSource, OpenCvOpener, SourceOpener};
