//! Capture device capability and the scoped camera guard.

use crate::types::Frame;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture device busy")]
    DeviceBusy,
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("capture stream already stopped")]
    Stopped,
}

/// A source of live video, e.g. a V4L2 camera.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Start streaming. The returned stream holds the device until stopped.
    async fn start(&self) -> Result<Box<dyn CaptureStream>, CaptureError>;

    /// Human-readable device description for diagnostics.
    fn describe(&self) -> String;
}

/// An active video stream.
#[async_trait]
pub trait CaptureStream: Send {
    /// Grab the next frame from the stream.
    async fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Stop all tracks and release the device. Must be idempotent.
    fn stop(&mut self);
}

/// Scoped ownership of an active stream.
///
/// The stream is stopped when the guard is dropped, so every exit path
/// (success, error, cancellation, or the owning future being dropped)
/// releases the camera.
pub struct CaptureGuard {
    stream: Box<dyn CaptureStream>,
}

impl CaptureGuard {
    /// Start `device` and wrap the resulting stream.
    pub async fn acquire(device: &dyn CaptureDevice) -> Result<Self, CaptureError> {
        let stream = device.start().await?;
        tracing::debug!(device = %device.describe(), "capture stream started");
        Ok(Self { stream })
    }

    pub async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        self.stream.next_frame().await
    }

    /// Grab up to `attempts` frames and return the first one that is not dark.
    ///
    /// Falls back to the last frame grabbed when every frame is dark; the
    /// extractor then decides whether a face is visible.
    pub async fn best_frame(&mut self, attempts: usize) -> Result<Frame, CaptureError> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            let frame = self.next_frame().await?;
            if !frame.is_dark {
                return Ok(frame);
            }
            tracing::debug!(seq = frame.sequence, "skipping dark frame");
            last = Some(frame);
        }
        last.ok_or(CaptureError::Stopped)
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.stream.stop();
        tracing::debug!("capture stream released");
    }
}
