//! V4L2 camera capture via the `v4l` crate.
//!
//! The device is opened when a stream starts and closed when the stream is
//! stopped, so the camera light is only on during a verification attempt.
//!
//! Reads block on a worker thread in short poll slices. Stopping a stream
//! raises a flag the worker checks between slices, so the device is closed
//! within one slice even while a read is in flight. A per-camera lease makes
//! the next `start` wait for that close instead of failing with `EBUSY`.

use crate::frame;
use async_trait::async_trait;
use presence_core::capture::{CaptureDevice, CaptureError, CaptureStream};
use presence_core::Frame;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream as _;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const MMAP_BUFFERS: u32 = 4;
const DARK_FRAME_THRESHOLD: f32 = 0.95;
const EBUSY: i32 = 16;

/// Longest single blocking dequeue; bounds how long `stop` takes to close the device.
const POLL_SLICE: Duration = Duration::from_millis(200);
/// A frame that has not arrived by now is a capture failure.
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `start` waits for a previous stream to close the device.
const LEASE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

impl From<CameraError> for CaptureError {
    fn from(e: CameraError) -> Self {
        match e {
            CameraError::DeviceNotFound(path) => CaptureError::DeviceNotFound(path),
            CameraError::PermissionDenied(msg) => CaptureError::PermissionDenied(msg),
            CameraError::DeviceBusy => CaptureError::DeviceBusy,
            other => CaptureError::CaptureFailed(other.to_string()),
        }
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

/// A V4L2 camera, opened lazily per capture stream.
pub struct V4lCamera {
    device_path: String,
    warmup_frames: usize,
    lease: Arc<Semaphore>,
}

impl V4lCamera {
    /// `warmup_frames` are discarded after opening to let auto-exposure settle.
    pub fn new(device_path: impl Into<String>, warmup_frames: usize) -> Self {
        Self {
            device_path: device_path.into(),
            warmup_frames,
            lease: Arc::new(Semaphore::new(1)),
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

#[async_trait]
impl CaptureDevice for V4lCamera {
    async fn start(&self) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let permit = tokio::time::timeout(LEASE_TIMEOUT, self.lease.clone().acquire_owned())
            .await
            .map_err(|_| {
                tracing::warn!(device = %self.device_path, "previous stream still holds the camera");
                CaptureError::DeviceBusy
            })?
            .map_err(|_| CaptureError::CaptureFailed("camera lease closed".into()))?;

        let device_path = self.device_path.clone();
        let warmup_frames = self.warmup_frames;

        // The permit travels with the open device, so an abandoned start
        // still holds the lease until the worker closes it.
        let (camera, permit) = tokio::task::spawn_blocking(move || {
            let mut camera = OpenCamera::open(&device_path)?;
            warm_up(&mut camera, warmup_frames)?;
            Ok::<_, CaptureError>((camera, permit))
        })
        .await
        .map_err(|e| CaptureError::CaptureFailed(format!("camera task: {e}")))??;

        Ok(Box::new(V4lStream::new(camera, permit)))
    }

    fn describe(&self) -> String {
        format!("v4l2:{}", self.device_path)
    }
}

/// Blocking producer of frames behind a [`V4lStream`].
trait FrameSource: Send + 'static {
    /// Wait at most `wait` for one frame. `Ok(None)` means none arrived in time.
    fn read_frame(&mut self, sequence: u32, wait: Duration) -> Result<Option<Frame>, CameraError>;
}

/// Read one frame in `POLL_SLICE` steps, giving up once `stopped` is raised
/// or `timeout` elapses.
fn read_until_stopped<S: FrameSource>(
    source: &mut S,
    sequence: u32,
    stopped: &AtomicBool,
    timeout: Duration,
) -> Result<Frame, CaptureError> {
    let deadline = Instant::now() + timeout;
    loop {
        if stopped.load(Ordering::Acquire) {
            return Err(CaptureError::Stopped);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CaptureError::CaptureFailed(format!(
                "no frame within {timeout:?}"
            )));
        }
        if let Some(frame) = source.read_frame(sequence, remaining.min(POLL_SLICE))? {
            return Ok(frame);
        }
    }
}

/// Discard `frames` frames so auto-exposure settles.
///
/// Single failures are tolerated; a device that delivers none of them is not
/// usable and fails the start.
fn warm_up<S: FrameSource>(source: &mut S, frames: usize) -> Result<(), CaptureError> {
    let never_stopped = AtomicBool::new(false);
    let mut delivered = 0;
    let mut last_error = None;

    for _ in 0..frames {
        match read_until_stopped(source, 0, &never_stopped, FRAME_TIMEOUT) {
            Ok(_) => delivered += 1,
            Err(e) => {
                tracing::debug!(error = %e, "warm-up frame failed");
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) if delivered == 0 => {
            tracing::warn!(frames, error = %e, "camera delivered no warm-up frames");
            Err(e)
        }
        _ => Ok(()),
    }
}

/// An open device. Dropping it closes the file descriptor.
struct OpenCamera {
    device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl OpenCamera {
    fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(format!("{device_path}: {e}"))
            }
            _ if e.raw_os_error() == Some(EBUSY) => CameraError::DeviceBusy,
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"Y16 ") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "camera opened"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }
}

impl FrameSource for OpenCamera {
    fn read_frame(&mut self, sequence: u32, wait: Duration) -> Result<Option<Frame>, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(wait);

        let buf = match stream.next() {
            Ok((buf, _meta)) => buf,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => {
                return Err(CameraError::CaptureFailed(format!(
                    "failed to dequeue buffer: {e}"
                )))
            }
        };

        let gray = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height),
            PixelFormat::Grey => frame::grey_to_grayscale(buf, self.width, self.height),
            PixelFormat::Y16 => frame::y16_to_grayscale(buf, self.width, self.height),
        }
        .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;

        let is_dark = frame::is_dark_frame(&gray, DARK_FRAME_THRESHOLD);
        Ok(Some(Frame {
            data: gray,
            width: self.width,
            height: self.height,
            sequence,
            is_dark,
        }))
    }
}

/// Exclusive use of the device. Fields drop in order: the source closes the
/// device before the permit lets the next stream open it.
struct Lease<S> {
    source: S,
    _permit: OwnedSemaphorePermit,
}

/// Active stream over an open camera.
struct V4lStream<S: FrameSource> {
    lease: Option<Arc<Mutex<Lease<S>>>>,
    stopped: Arc<AtomicBool>,
    sequence: u32,
}

impl<S: FrameSource> V4lStream<S> {
    fn new(source: S, permit: OwnedSemaphorePermit) -> Self {
        Self {
            lease: Some(Arc::new(Mutex::new(Lease {
                source,
                _permit: permit,
            }))),
            stopped: Arc::new(AtomicBool::new(false)),
            sequence: 0,
        }
    }
}

#[async_trait]
impl<S: FrameSource> CaptureStream for V4lStream<S> {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let lease = self.lease.clone().ok_or(CaptureError::Stopped)?;
        let stopped = self.stopped.clone();
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        tokio::task::spawn_blocking(move || {
            let mut lease = lease
                .lock()
                .map_err(|_| CaptureError::CaptureFailed("camera lock poisoned".into()))?;
            read_until_stopped(&mut lease.source, sequence, &stopped, FRAME_TIMEOUT)
        })
        .await
        .map_err(|e| CaptureError::CaptureFailed(format!("camera task: {e}")))?
    }

    /// A read still blocked on the worker holds its own handle to the lease;
    /// it sees the flag within one poll slice and the device closes then.
    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        if self.lease.take().is_some() {
            tracing::debug!("camera stream stopped");
        }
    }
}

impl<S: FrameSource> Drop for V4lStream<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
