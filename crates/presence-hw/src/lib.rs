//! presence-hw: V4L2 camera capture for the attendance verifier.
//!
//! Implements the core `CaptureDevice` capability on top of the `v4l` crate.

pub mod camera;
pub mod frame;

pub use camera::{CameraError, DeviceInfo, PixelFormat, V4lCamera};
