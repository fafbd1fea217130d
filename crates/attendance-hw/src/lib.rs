//! attendance-hw — Camera capture for the attendance pipeline.
//!
//! Provides V4L2-based frame capture converted to 8-bit grayscale.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::Frame;
