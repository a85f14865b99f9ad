//! Camera capture backends.

mod nokhwa_backend;
#[cfg(target_os = "linux")]
mod v4l_backend;

pub use nokhwa_backend::NokhwaCapture;
#[cfg(target_os = "linux")]
pub use v4l_backend::V4lCapture;

use crate::frame::{FrameError, RawFrame};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("failed to open device: {0}")]
    Open(String),
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),
    #[error("backend {0:?} is not available on this platform")]
    BackendUnavailable(BackendKind),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Trait for camera capture backends.
pub trait CaptureBackend {
    /// Reads the next frame, blocking until the device delivers one or the
    /// configured read timeout expires.
    ///
    /// An `Err` means no usable frame was produced this time; the device may
    /// still deliver frames on later calls.
    fn read_frame(&mut self) -> Result<RawFrame, CaptureError>;

    /// Enables or disables conversion of native frames to RGB.
    fn set_rgb_conversion(&mut self, enabled: bool) -> Result<(), CaptureError>;

    /// Whether frames are currently converted to RGB.
    fn rgb_conversion(&self) -> bool;

    /// Returns the current frame dimensions.
    fn frame_size(&self) -> (u32, u32);
}

impl<C: CaptureBackend + ?Sized> CaptureBackend for Box<C> {
    fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
        (**self).read_frame()
    }

    fn set_rgb_conversion(&mut self, enabled: bool) -> Result<(), CaptureError> {
        (**self).set_rgb_conversion(enabled)
    }

    fn rgb_conversion(&self) -> bool {
        (**self).rgb_conversion()
    }

    fn frame_size(&self) -> (u32, u32) {
        (**self).frame_size()
    }
}

/// Capture library used to talk to the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// nokhwa (V4L2, Media Foundation, AVFoundation)
    #[default]
    Nokhwa,
    /// Direct V4L2 access, exposes 10/12/16-bit mono formats (Linux only)
    V4l,
}

/// Information about a camera device.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    /// Device index
    pub index: u32,
    /// Human-readable name
    pub name: String,
}

/// Sensor controls set once the camera is streaming. Unset fields keep the
/// driver's current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorControls {
    pub exposure: Option<i64>,
    pub gain: Option<i64>,
    pub analogue_gain: Option<i64>,
    pub vblank: Option<i64>,
    pub hflip: Option<bool>,
    pub vflip: Option<bool>,
}

impl SensorControls {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The integer controls that are set, by name.
    pub fn integer_values(&self) -> impl Iterator<Item = (&'static str, i64)> {
        [
            ("exposure", self.exposure),
            ("gain", self.gain),
            ("analogue_gain", self.analogue_gain),
            ("vblank", self.vblank),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }
}

/// Configuration for camera capture.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Camera device index
    pub device_index: u32,
    /// Deliver frames in their native encoding instead of RGB
    pub disable_rgb_conversion: bool,
    /// Requested frame size; the driver's current size when unset
    pub resolution: Option<(u32, u32)>,
    /// Requested frame rate; the driver's choice when unset
    pub fps: Option<u32>,
    /// Longest wait for one frame; unbounded when unset
    pub read_timeout: Option<Duration>,
    /// Sensor controls to apply after streaming starts
    pub controls: SensorControls,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            disable_rgb_conversion: true,
            resolution: None,
            fps: None,
            read_timeout: None,
            controls: SensorControls::default(),
        }
    }
}

/// Applies the RGB conversion option to an opened backend.
///
/// A backend that rejects the option, or accepts it without honoring it,
/// is logged and otherwise left alone.
pub fn apply_config<C: CaptureBackend + ?Sized>(backend: &mut C, config: &CaptureConfig) {
    let wanted = !config.disable_rgb_conversion;
    if let Err(e) = backend.set_rgb_conversion(wanted) {
        tracing::warn!("Camera rejected RGB conversion = {}: {}", wanted, e);
        return;
    }
    if backend.rgb_conversion() != wanted {
        tracing::warn!(
            "Camera ignored RGB conversion = {} (still {})",
            wanted,
            backend.rgb_conversion()
        );
    }
}

/// Opens the requested backend and applies `config`.
pub fn open(kind: BackendKind, config: &CaptureConfig) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    let mut backend: Box<dyn CaptureBackend> = match kind {
        BackendKind::Nokhwa => Box::new(NokhwaCapture::open(config)?),
        #[cfg(target_os = "linux")]
        BackendKind::V4l => Box::new(V4lCapture::open(config)?),
        #[cfg(not(target_os = "linux"))]
        BackendKind::V4l => return Err(CaptureError::BackendUnavailable(kind)),
    };
    apply_config(backend.as_mut(), config);
    Ok(backend)
}

/// Lists cameras visible to the requested backend.
pub fn list_devices(kind: BackendKind) -> Result<Vec<CameraInfo>, CaptureError> {
    match kind {
        BackendKind::Nokhwa => NokhwaCapture::list_devices(),
        #[cfg(target_os = "linux")]
        BackendKind::V4l => Ok(V4lCapture::list_devices()),
        #[cfg(not(target_os = "linux"))]
        BackendKind::V4l => Err(CaptureError::BackendUnavailable(kind)),
    }
}
