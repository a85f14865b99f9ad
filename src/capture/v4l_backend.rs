//! Direct V4L2 capture via the `v4l` crate.
//!
//! Unlike nokhwa this keeps the driver's native format, so monochrome
//! sensors delivering 10/12/16-bit samples (e.g. `Y10 `, `Y10P`) reach the
//! viewer unmodified.
//!
//! Sensors running in external-trigger mode only deliver a frame per
//! trigger pulse. A read timeout keeps `read_frame` from blocking forever
//! between pulses; each expiry surfaces as a failed read.

use super::{CameraInfo, CaptureBackend, CaptureConfig, CaptureError, SensorControls};
use crate::frame::{self, RawFrame, SampleFormat};
use std::io;
use std::path::Path;
use std::time::Duration;
use v4l::buffer::Type as BufType;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

const BUFFER_COUNT: u32 = 4;

// V4L2 control IDs (linux/v4l2-controls.h).
const CID_EXPOSURE: u32 = 0x0098_0911;
const CID_GAIN: u32 = 0x0098_0913;
const CID_HFLIP: u32 = 0x0098_0914;
const CID_VFLIP: u32 = 0x0098_0915;
const CID_VBLANK: u32 = 0x009e_0901;
const CID_ANALOGUE_GAIN: u32 = 0x009e_0903;

/// The poll timeout is a signed 32-bit millisecond count.
const MAX_READ_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

/// How the driver lays out one frame in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// One sample per storage unit, rows possibly padded to the stride.
    Plain(SampleFormat),
    /// MIPI CSI-2 packed 10-bit mono.
    Y10Packed,
}

impl Layout {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        let layout = match &fourcc.repr {
            b"GREY" => Layout::Plain(SampleFormat::Gray8),
            b"Y10 " => Layout::Plain(SampleFormat::Gray10),
            b"Y10P" => Layout::Y10Packed,
            b"Y12 " => Layout::Plain(SampleFormat::Gray12),
            b"Y16 " | b"Y16\0" => Layout::Plain(SampleFormat::Gray16),
            b"YUYV" => Layout::Plain(SampleFormat::Yuyv),
            b"NV12" => Layout::Plain(SampleFormat::Nv12),
            b"MJPG" => Layout::Plain(SampleFormat::Mjpeg),
            b"RGB3" => Layout::Plain(SampleFormat::Rgb8),
            b"BGR3" => Layout::Plain(SampleFormat::Bgr8),
            _ => return None,
        };
        Some(layout)
    }

    fn sample_format(&self) -> SampleFormat {
        match self {
            Layout::Plain(format) => *format,
            Layout::Y10Packed => SampleFormat::Gray10,
        }
    }
}

/// V4L2 camera device handle.
pub struct V4lCapture {
    /// Holds its own handle to the device; dropping it stops streaming.
    stream: MmapStream<'static>,
    device: Device,
    device_path: String,
    width: u32,
    height: u32,
    stride: usize,
    layout: Layout,
    convert_rgb: bool,
    read_timeout: Option<Duration>,
    /// Written after the first frame; the sensor ignores controls until it streams.
    pending_controls: Vec<(&'static str, Control)>,
}

impl V4lCapture {
    /// Opens `/dev/video<device_index>`, keeping its current format unless
    /// a resolution is configured.
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let device_path = format!("/dev/video{}", config.device_index);
        if !Path::new(&device_path).exists() {
            return Err(CaptureError::DeviceNotFound(device_path));
        }

        let device = Device::with_path(&device_path)
            .map_err(|e| CaptureError::Open(format!("{device_path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::Open(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::Open(format!(
                "{device_path} is not a video capture device"
            )));
        }

        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::Open(format!("failed to get format: {e}")))?;

        if let Some((width, height)) = config.resolution {
            fmt.width = width;
            fmt.height = height;
            fmt = device
                .set_format(&fmt)
                .map_err(|e| CaptureError::Open(format!("failed to set format: {e}")))?;
        }

        if let Some(fps) = config.fps {
            if let Err(e) = device.set_params(&Parameters::with_fps(fps)) {
                tracing::warn!(fps, "driver rejected frame rate: {}", e);
            }
        }

        let layout = Layout::from_fourcc(fmt.fourcc).ok_or_else(|| {
            CaptureError::UnsupportedFormat(format!("{} on {device_path}", fmt.fourcc))
        })?;

        tracing::info!(
            width = fmt.width,
            height = fmt.height,
            stride = fmt.stride,
            fourcc = %fmt.fourcc,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, BUFFER_COUNT)
            .map_err(|e| CaptureError::Open(format!("failed to create mmap stream: {e}")))?;
        let read_timeout = config.read_timeout.map(|t| t.min(MAX_READ_TIMEOUT));
        if let Some(timeout) = read_timeout {
            tracing::info!(timeout_ms = timeout.as_millis() as u64, "frame reads time out");
            stream.set_timeout(timeout);
        }

        Ok(Self {
            stream,
            device,
            device_path,
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride as usize,
            layout,
            convert_rgb: !config.disable_rgb_conversion,
            read_timeout,
            pending_controls: control_list(&config.controls),
        })
    }

    fn apply_pending_controls(&mut self) {
        for (name, control) in self.pending_controls.drain(..) {
            let value = format!("{:?}", control.value);
            match self.device.set_control(control) {
                Ok(()) => tracing::info!(control = name, %value, "sensor control set"),
                Err(e) => tracing::warn!(control = name, %value, "driver rejected control: {}", e),
            }
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<CameraInfo> {
        let mut devices = Vec::new();

        for i in 0..64u32 {
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
            devices.push(CameraInfo {
                index: i,
                name: format!("{} ({}, {})", caps.card, caps.driver, caps.bus),
            });
        }

        devices
    }
}

/// Controls to write, in the order the driver applies them.
fn control_list(controls: &SensorControls) -> Vec<(&'static str, Control)> {
    let integers = [
        ("exposure", CID_EXPOSURE, controls.exposure),
        ("gain", CID_GAIN, controls.gain),
        ("analogue_gain", CID_ANALOGUE_GAIN, controls.analogue_gain),
        ("vblank", CID_VBLANK, controls.vblank),
    ];
    let flags = [
        ("hflip", CID_HFLIP, controls.hflip),
        ("vflip", CID_VFLIP, controls.vflip),
    ];

    let mut list = Vec::new();
    for (name, id, value) in integers {
        if let Some(v) = value {
            list.push((name, Control { id, value: Value::Integer(v) }));
        }
    }
    for (name, id, value) in flags {
        if let Some(v) = value {
            list.push((name, Control { id, value: Value::Boolean(v) }));
        }
    }
    list
}

fn dequeue_error(e: io::Error, timeout: Option<Duration>) -> CaptureError {
    match (e.kind(), timeout) {
        (io::ErrorKind::TimedOut, Some(t)) => {
            CaptureError::Read(format!("no frame within {} ms", t.as_millis()))
        }
        _ => CaptureError::Read(format!("failed to dequeue buffer: {e}")),
    }
}

/// Turns one dequeued buffer into a frame.
fn decode_buffer(
    buf: &[u8],
    layout: Layout,
    width: u32,
    height: u32,
    stride: usize,
) -> Result<RawFrame, CaptureError> {
    match layout {
        Layout::Y10Packed => {
            let samples = frame::unpack_y10p(buf, width, height, stride)?;
            Ok(RawFrame::from_wide(width, height, SampleFormat::Gray10, samples)?)
        }
        Layout::Plain(SampleFormat::Mjpeg) => Ok(RawFrame::from_bytes(
            width,
            height,
            SampleFormat::Mjpeg,
            buf.to_vec(),
        )?),
        Layout::Plain(format) => {
            let (cols, rows) = format.plane_dims(width, height).unwrap_or((0, 0));
            let bytes_per_sample = if format.is_wide() { 2 } else { 1 };
            let data = frame::compact_rows(buf, cols * bytes_per_sample, stride, rows);
            Ok(RawFrame::from_bytes(width, height, format, data)?)
        }
    }
}

impl CaptureBackend for V4lCapture {
    fn read_frame(&mut self) -> Result<RawFrame, CaptureError> {
        let (layout, width, height, stride) = (self.layout, self.width, self.height, self.stride);
        let timeout = self.read_timeout;
        let (buf, meta) = self.stream.next().map_err(|e| dequeue_error(e, timeout))?;

        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };
        let sequence = meta.sequence as u64;
        let decoded = decode_buffer(&buf[..used], layout, width, height, stride);

        if !self.pending_controls.is_empty() {
            self.apply_pending_controls();
        }
        let frame = decoded?.with_sequence(sequence);

        if self.convert_rgb {
            Ok(frame.to_rgb8()?)
        } else {
            Ok(frame)
        }
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

impl Drop for V4lCapture {
    fn drop(&mut self) {
        tracing::debug!(
            device = %self.device_path,
            format = ?self.layout.sample_format(),
            "closing camera"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Samples;

    #[test]
    fn test_layout_from_fourcc() {
        assert_eq!(
            Layout::from_fourcc(FourCC::new(b"Y10 ")),
            Some(Layout::Plain(SampleFormat::Gray10))
        );
        assert_eq!(Layout::from_fourcc(FourCC::new(b"Y10P")), Some(Layout::Y10Packed));
        assert_eq!(
            Layout::from_fourcc(FourCC::new(b"GREY")),
            Some(Layout::Plain(SampleFormat::Gray8))
        );
        assert_eq!(Layout::from_fourcc(FourCC::new(b"H264")), None);
    }

    #[test]
    fn test_decode_y10_little_endian_with_stride() {
        // 2x2 Y10, rows padded from 4 to 6 bytes.
        let buf = vec![0x01, 0x00, 0xFF, 0x03, 0xAA, 0xAA, 0x02, 0x00, 0x00, 0x02, 0xAA, 0xAA];
        let frame = decode_buffer(&buf, Layout::Plain(SampleFormat::Gray10), 2, 2, 6).unwrap();
        assert_eq!(frame.samples, Samples::U16(vec![1, 0x3FF, 2, 0x200]));
    }

    #[test]
    fn test_decode_y10_packed() {
        let buf = vec![0xFF, 0x00, 0x00, 0x00, 0b0000_0011];
        let frame = decode_buffer(&buf, Layout::Y10Packed, 4, 1, 5).unwrap();
        assert_eq!(frame.format, SampleFormat::Gray10);
        assert_eq!(frame.samples, Samples::U16(vec![0x3FF, 0, 0, 0]));
    }

    #[test]
    fn test_control_list_skips_unset() {
        let controls = SensorControls {
            exposure: Some(400),
            vblank: Some(92),
            vflip: Some(true),
            ..Default::default()
        };
        let list = control_list(&controls);
        let ids: Vec<_> = list.iter().map(|(name, c)| (*name, c.id)).collect();
        assert_eq!(
            ids,
            vec![("exposure", CID_EXPOSURE), ("vblank", CID_VBLANK), ("vflip", CID_VFLIP)]
        );
        assert_eq!(list[0].1.value, Value::Integer(400));
        assert_eq!(list[2].1.value, Value::Boolean(true));
        assert!(control_list(&SensorControls::default()).is_empty());
    }

    #[test]
    fn test_timeout_maps_to_failed_read() {
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "VIDIOC_DQBUF");
        match dequeue_error(timed_out, Some(Duration::from_millis(250))) {
            CaptureError::Read(msg) => assert_eq!(msg, "no frame within 250 ms"),
            other => panic!("unexpected error: {other:?}"),
        }

        let broken = io::Error::new(io::ErrorKind::Other, "ENODEV");
        assert!(matches!(dequeue_error(broken, None), CaptureError::Read(_)));
    }

    #[test]
    fn test_decode_short_buffer_fails() {
        let result = decode_buffer(&[0; 3], Layout::Plain(SampleFormat::Gray8), 2, 2, 2);
        assert!(matches!(result, Err(CaptureError::Frame(_))));
    }
}
