//! Nokhwa-based camera capture backend.

use super::{CameraInfo, CaptureBackend, CaptureConfig, CaptureError};
use crate::frame::{RawFrame, SampleFormat};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;

/// Frame size requested when only a frame rate is configured.
const FALLBACK_RESOLUTION: (u32, u32) = (640, 480);
/// Frame rate requested when only a size is configured.
const FALLBACK_FPS: u32 = 30;

/// Camera capture using the nokhwa library.
pub struct NokhwaCapture {
    camera: Camera,
    width: u32,
    height: u32,
    convert_rgb: bool,
    sequence: u64,
}

impl NokhwaCapture {
    pub fn list_devices() -> Result<Vec<CameraInfo>, CaptureError> {
        let devices = nokhwa::query(nokhwa::utils::ApiBackend::Auto)
            .map_err(|e| CaptureError::DeviceNotFound(e.to_string()))?;
        Ok(devices
            .into_iter()
            .map(|d| CameraInfo {
                index: d.index().as_index().unwrap_or(0),
                name: d.human_name().to_string(),
            })
            .collect())
    }

    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        if config.read_timeout.is_some() {
            tracing::warn!("Read timeout is only supported by the v4l backend; reads will block");
        }
        if !config.controls.is_empty() {
            tracing::warn!("Sensor controls are only supported by the v4l backend; ignoring them");
        }

        let requested = match (config.resolution, config.fps) {
            (None, None) => RequestedFormatType::AbsoluteHighestFrameRate,
            (resolution, fps) => {
                let (w, h) = resolution.unwrap_or(FALLBACK_RESOLUTION);
                // Hint at a format that matches the conversion mode; the
                // driver picks the closest one it has.
                let hint = if config.disable_rgb_conversion {
                    FrameFormat::GRAY
                } else {
                    FrameFormat::YUYV
                };
                RequestedFormatType::Closest(CameraFormat::new(
                    Resolution::new(w, h),
                    hint,
                    fps.unwrap_or(FALLBACK_FPS),
                ))
            }
        };

        let idx = CameraIndex::Index(config.device_index);
        let mut camera = Camera::new(idx, RequestedFormat::new::<RgbFormat>(requested)).map_err(|e| {
            CaptureError::Open(format!("camera index {}: {}", config.device_index, e))
        })?;

        camera.open_stream().map_err(|e| {
            CaptureError::Open(format!("failed to open stream on camera index {}: {}", config.device_index, e))
        })?;

        let resolution = camera.resolution();
        tracing::info!(
            "Camera {} opened: {} {:?} @ {} fps",
            config.device_index,
            resolution,
            camera.frame_format(),
            camera.frame_rate()
        );

        Ok(Self {
            camera,
            width: resolution.width(),
            height: resolution.height(),
            convert_rgb: !config.disable_rgb_conversion,
            sequence: 0,
        })
    }
}

impl CaptureBackend for NokhwaCapture {
    fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
        let buffer = self
            .camera
            .frame()
            .map_err(|e| CaptureError::Read(e.to_string()))?;
        self.sequence += 1;

        let frame = if self.convert_rgb {
            let decoded = buffer
                .decode_image::<RgbFormat>()
                .map_err(|e| CaptureError::Read(format!("RGB decode failed: {e}")))?;
            RawFrame::from_bytes(
                decoded.width(),
                decoded.height(),
                SampleFormat::Rgb8,
                decoded.into_raw(),
            )?
        } else {
            let resolution = buffer.resolution();
            let format = sample_format(buffer.source_frame_format())?;
            RawFrame::from_bytes(
                resolution.width(),
                resolution.height(),
                format,
                buffer.buffer().to_vec(),
            )?
        };

        Ok(frame.with_sequence(self.sequence))
    }

    fn set_rgb_conversion(&mut self, enabled: bool) -> Result<(), CaptureError> {
        self.convert_rgb = enabled;
        Ok(())
    }

    fn rgb_conversion(&self) -> bool {
        self.convert_rgb
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for NokhwaCapture {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            tracing::warn!("Failed to stop camera stream: {}", e);
        } else {
            tracing::debug!("Camera stream stopped");
        }
    }
}

/// Maps the driver's frame encoding to the raw sample layout.
fn sample_format(format: FrameFormat) -> Result<SampleFormat, CaptureError> {
    match format {
        FrameFormat::GRAY => Ok(SampleFormat::Gray8),
        FrameFormat::YUYV => Ok(SampleFormat::Yuyv),
        FrameFormat::NV12 => Ok(SampleFormat::Nv12),
        FrameFormat::MJPEG => Ok(SampleFormat::Mjpeg),
        FrameFormat::RAWRGB => Ok(SampleFormat::Rgb8),
        #[allow(unreachable_patterns)]
        other => Err(CaptureError::UnsupportedFormat(format!("{other:?}"))),
    }
}
