use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use thiserror::Error;

use crate::config::CameraSource;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open {0}")]
    OpenFailed(String),
    #[error("failed to read frame")]
    ReadFailed,
    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// An opened camera or stream.
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn read(&mut self) -> Result<Mat, CaptureError>;

    /// Give the device back. Further reads fail.
    fn release(&mut self);
}

/// Opens configured sources. Held by the pipeline so workers can reopen.
pub trait SourceOpener: Send + Sync {
    fn open(
        &self,
        source: &CameraSource,
        frame_width: u32,
    ) -> Result<Box<dyn FrameSource>, CaptureError>;
}

/// OpenCV reads a negative index as "any camera", so out-of-range indices
/// must fail instead of wrapping.
fn device_index(index: u32) -> Result<i32, CaptureError> {
    i32::try_from(index).map_err(|_| CaptureError::OpenFailed(format!("camera index {index} out of range")))
}

pub struct OpenCvCapture {
    capture: VideoCapture,
    released: bool,
}

impl OpenCvCapture {
    pub fn open(source: &CameraSource, frame_width: u32) -> Result<Self, CaptureError> {
        let mut capture = match source {
            CameraSource::LocalIndex(index) => VideoCapture::new(device_index(*index)?, videoio::CAP_ANY)?,
            CameraSource::StreamUrl(url) => VideoCapture::from_file(url, videoio::CAP_ANY)?,
        };

        if !capture.is_opened()? {
            return Err(CaptureError::OpenFailed(source.to_string()));
        }

        if source.is_network_stream() {
            // keep the driver-side backlog short so reads stay fresh
            let _ = capture.set(videoio::CAP_PROP_BUFFERSIZE, 2.0);
        }

        match capture.set(videoio::CAP_PROP_FRAME_WIDTH, frame_width as f64) {
            Ok(true) => {}
            _ => tracing::debug!(source = %source, frame_width, "capture width request ignored"),
        }

        Ok(Self {
            capture,
            released: false,
        })
    }
}

impl FrameSource for OpenCvCapture {
    fn read(&mut self) -> Result<Mat, CaptureError> {
        if self.released {
            return Err(CaptureError::ReadFailed);
        }
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Err(CaptureError::ReadFailed);
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if !self.released {
            if let Err(e) = self.capture.release() {
                tracing::warn!(error = %e, "failed to release capture");
            }
            self.released = true;
        }
    }
}

impl Drop for OpenCvCapture {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct OpenCvOpener;

impl SourceOpener for OpenCvOpener {
    fn open(
        &self,
        source: &CameraSource,
        frame_width: u32,
    ) -> Result<Box<dyn FrameSource>, CaptureError> {
        Ok(Box::new(OpenCvCapture::open(source, frame_width)?))
    }
}

/// Result of probing one local device index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCheck {
    pub index: u32,
    pub opened: bool,
    pub delivered_frame: bool,
}

/// Try local device indices `0..max_index`, reading one frame from each.
pub fn scan_devices(opener: &dyn SourceOpener, max_index: u32, frame_width: u32) -> Vec<DeviceCheck> {
    (0..max_index)
        .map(|index| {
            let source = CameraSource::LocalIndex(index);
            match opener.open(&source, frame_width) {
                Ok(mut handle) => {
                    let delivered_frame = handle.read().is_ok();
                    handle.release();
                    DeviceCheck {
                        index,
                        opened: true,
                        delivered_frame,
                    }
                }
                Err(e) => {
                    tracing::debug!(index, error = %e, "device check failed");
                    DeviceCheck {
                        index,
                        opened: false,
                        delivered_frame: false,
                    }
                }
            }
        })
        .collect()
}
