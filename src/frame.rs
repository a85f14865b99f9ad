//! Raw frame types, sample storage and display conversions.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Native encoding of the samples in a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 8-bit monochrome (V4L2 `GREY`)
    Gray8,
    /// 10-bit monochrome in 16-bit containers (V4L2 `Y10 `, unpacked `Y10P`)
    Gray10,
    /// 12-bit monochrome in 16-bit containers (V4L2 `Y12 `)
    Gray12,
    /// 16-bit monochrome (V4L2 `Y16 `)
    Gray16,
    /// YUV 4:2:2 packed bytes (Y0 U0 Y1 V0), left undecoded
    Yuyv,
    /// NV12 semi-planar bytes (Y plane + interleaved UV), left undecoded
    Nv12,
    /// Motion-JPEG compressed bytes
    Mjpeg,
    /// RGB with 8 bits per channel
    Rgb8,
    /// BGR with 8 bits per channel
    Bgr8,
}

impl SampleFormat {
    /// Whether samples are stored in 16-bit containers. The shift wraps at
    /// the storage width, so 16 bits here and 8 bits otherwise.
    pub fn is_wide(&self) -> bool {
        matches!(self, SampleFormat::Gray10 | SampleFormat::Gray12 | SampleFormat::Gray16)
    }

    /// Number of bits carrying sensor data.
    pub fn significant_bits(&self) -> u32 {
        match self {
            SampleFormat::Gray10 => 10,
            SampleFormat::Gray12 => 12,
            SampleFormat::Gray16 => 16,
            _ => 8,
        }
    }

    /// Sample grid `(columns, rows)` of one frame, or `None` for compressed data.
    pub fn plane_dims(&self, width: u32, height: u32) -> Option<(usize, usize)> {
        let w = width as usize;
        let h = height as usize;
        match self {
            SampleFormat::Gray8
            | SampleFormat::Gray10
            | SampleFormat::Gray12
            | SampleFormat::Gray16 => Some((w, h)),
            SampleFormat::Yuyv => Some((w * 2, h)),
            SampleFormat::Nv12 => Some((w, h + h.div_ceil(2))),
            SampleFormat::Rgb8 | SampleFormat::Bgr8 => Some((w * 3, h)),
            SampleFormat::Mjpeg => None,
        }
    }
}

/// Sample storage at the native bit width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Samples {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Samples::U8(v) => v.len(),
            Samples::U16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid {format:?} buffer length: expected {expected}, got {actual}")]
    InvalidLength {
        format: SampleFormat,
        expected: usize,
        actual: usize,
    },
    #[error("{format:?} frame needs {expected} storage, got {actual}")]
    StorageMismatch {
        format: SampleFormat,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("conversion failed: {0}")]
    Conversion(String),
}

/// A single captured frame in its native encoding.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Encoding of `samples`
    pub format: SampleFormat,
    /// Driver sequence number (0 when the backend has none)
    pub sequence: u64,
    /// Pixel samples
    pub samples: Samples,
}

impl RawFrame {
    /// Builds a frame from a byte buffer.
    ///
    /// 16-bit formats are read as little-endian pairs. Buffers longer than
    /// one frame are truncated; shorter ones are rejected. Compressed data is
    /// kept as-is.
    pub fn from_bytes(
        width: u32,
        height: u32,
        format: SampleFormat,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        let samples = match format.plane_dims(width, height) {
            None => Samples::U8(data),
            Some((cols, rows)) => {
                let count = cols * rows;
                if format.is_wide() {
                    let expected = count * 2;
                    if data.len() < expected {
                        return Err(FrameError::InvalidLength {
                            format,
                            expected,
                            actual: data.len(),
                        });
                    }
                    Samples::U16(le_bytes_to_u16(&data[..expected]))
                } else {
                    if data.len() < count {
                        return Err(FrameError::InvalidLength {
                            format,
                            expected: count,
                            actual: data.len(),
                        });
                    }
                    let mut data = data;
                    data.truncate(count);
                    Samples::U8(data)
                }
            }
        };

        Ok(Self {
            width,
            height,
            format,
            sequence: 0,
            samples,
        })
    }

    /// Builds a frame from 16-bit samples.
    pub fn from_wide(
        width: u32,
        height: u32,
        format: SampleFormat,
        data: Vec<u16>,
    ) -> Result<Self, FrameError> {
        if !format.is_wide() {
            return Err(FrameError::StorageMismatch {
                format,
                expected: "8-bit",
                actual: "16-bit",
            });
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                format,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            format,
            sequence: 0,
            samples: Samples::U16(data),
        })
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Maps the samples to an RGBA image without interpreting color.
    ///
    /// 8-bit samples are shown as-is, 16-bit samples by their high byte.
    /// Packed or compressed buffers are laid out as a grayscale byte plane.
    pub fn to_display_rgba(&self) -> DisplayImage {
        match (&self.samples, self.format) {
            (Samples::U8(data), SampleFormat::Rgb8) => {
                rgb_to_display(self.width, self.height, data, [0, 1, 2])
            }
            (Samples::U8(data), SampleFormat::Bgr8) => {
                rgb_to_display(self.width, self.height, data, [2, 1, 0])
            }
            (Samples::U8(data), format) => {
                let (cols, rows) = format
                    .plane_dims(self.width, self.height)
                    .unwrap_or_else(|| byte_plane_dims(data.len(), self.width));
                gray_to_display(cols, rows, data.iter().copied())
            }
            (Samples::U16(data), _) => gray_to_display(
                self.width as usize,
                self.height as usize,
                data.iter().map(|&v| (v >> 8) as u8),
            ),
        }
    }

    /// Decodes this frame into 8-bit RGB. Used when RGB conversion is enabled.
    pub fn to_rgb8(&self) -> Result<RawFrame, FrameError> {
        let width = self.width as usize;
        let height = self.height as usize;

        let rgb = match (&self.samples, self.format) {
            (Samples::U8(data), SampleFormat::Rgb8) => data.clone(),
            (Samples::U8(data), SampleFormat::Bgr8) => data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            (Samples::U8(data), SampleFormat::Gray8) => {
                data.iter().flat_map(|&v| [v, v, v]).collect()
            }
            (Samples::U16(data), format) => {
                let drop_bits = format.significant_bits().saturating_sub(8);
                data.iter()
                    .flat_map(|&v| {
                        let g = (v >> drop_bits).min(255) as u8;
                        [g, g, g]
                    })
                    .collect()
            }
            (Samples::U8(data), SampleFormat::Mjpeg) => {
                let decoded = image::load_from_memory_with_format(data, image::ImageFormat::Jpeg)
                    .map_err(|e| FrameError::Conversion(format!("MJPEG decode failed: {e}")))?
                    .to_rgb8();
                if decoded.width() != self.width || decoded.height() != self.height {
                    tracing::debug!(
                        "MJPEG frame decoded at {}x{}, expected {}x{}",
                        decoded.width(),
                        decoded.height(),
                        self.width,
                        self.height
                    );
                }
                return Ok(RawFrame {
                    width: decoded.width(),
                    height: decoded.height(),
                    format: SampleFormat::Rgb8,
                    sequence: self.sequence,
                    samples: Samples::U8(decoded.into_raw()),
                });
            }
            (Samples::U8(data), SampleFormat::Yuyv) => {
                let rgba = yuv_to_rgba(ezk_image::PixelFormat::YUYV, "YUYV", data, width, height)?;
                strip_alpha(&rgba)
            }
            (Samples::U8(data), SampleFormat::Nv12) => {
                let rgba = yuv_to_rgba(ezk_image::PixelFormat::NV12, "NV12", data, width, height)?;
                strip_alpha(&rgba)
            }
            (Samples::U8(_), format) => {
                return Err(FrameError::StorageMismatch {
                    format,
                    expected: "16-bit",
                    actual: "8-bit",
                })
            }
        };

        Ok(RawFrame {
            width: self.width,
            height: self.height,
            format: SampleFormat::Rgb8,
            sequence: self.sequence,
            samples: Samples::U8(rgb),
        })
    }
}

/// An RGBA8 image ready for upload to the window texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

fn gray_to_display(cols: usize, rows: usize, values: impl Iterator<Item = u8>) -> DisplayImage {
    let mut data = Vec::with_capacity(cols * rows * 4);
    for v in values.take(cols * rows) {
        data.extend_from_slice(&[v, v, v, 255]);
    }
    // Compressed buffers rarely fill the last row.
    data.resize(cols * rows * 4, 0);
    DisplayImage {
        width: cols as u32,
        height: rows as u32,
        data,
    }
}

fn rgb_to_display(width: u32, height: u32, data: &[u8], order: [usize; 3]) -> DisplayImage {
    let pixel_count = width as usize * height as usize;
    let mut rgba = vec![0u8; pixel_count * 4];
    for (dst, src) in rgba.chunks_exact_mut(4).zip(data.chunks_exact(3)) {
        dst[0] = src[order[0]];
        dst[1] = src[order[1]];
        dst[2] = src[order[2]];
        dst[3] = 255;
    }
    DisplayImage {
        width,
        height,
        data: rgba,
    }
}

/// Rows of `width` bytes needed to show `len` bytes, at least one.
fn byte_plane_dims(len: usize, width: u32) -> (usize, usize) {
    let cols = (width as usize).max(1);
    (cols, len.div_ceil(cols).max(1))
}

fn strip_alpha(rgba: &[u8]) -> Vec<u8> {
    rgba.chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect()
}

fn yuv_to_rgba(
    src_format: ezk_image::PixelFormat,
    label: &str,
    data: &[u8],
    width: usize,
    height: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut rgba_data = vec![0u8; width * height * 4];

    let dst_color = ezk_image::ColorInfo::RGB(ezk_image::RgbColorInfo {
        transfer: ezk_image::ColorTransfer::Linear,
        primaries: ezk_image::ColorPrimaries::BT709,
    });
    let src_color = ezk_image::ColorInfo::YUV(ezk_image::YuvColorInfo {
        transfer: ezk_image::ColorTransfer::Linear,
        primaries: ezk_image::ColorPrimaries::BT709,
        space: ezk_image::ColorSpace::BT709,
        full_range: false,
    });

    {
        let mut dst_image = ezk_image::Image::from_buffer(
            ezk_image::PixelFormat::RGBA,
            &mut rgba_data[..],
            None,
            width,
            height,
            dst_color,
        )
        .map_err(|e| FrameError::Conversion(format!("failed to wrap RGBA buffer: {e:?}")))?;

        let src_image =
            ezk_image::Image::from_buffer(src_format, data, None, width, height, src_color)
                .map_err(|e| {
                    FrameError::Conversion(format!("failed to wrap {label} buffer: {e:?}"))
                })?;

        ezk_image::convert(&src_image, &mut dst_image)
            .map_err(|e| FrameError::Conversion(format!("{e:?}")))?;
    }

    Ok(rgba_data)
}

/// Decodes little-endian 16-bit samples.
pub fn le_bytes_to_u16(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Unpacks MIPI CSI-2 packed 10-bit samples (`Y10P`) into 16-bit containers.
///
/// Every 5 bytes carry 4 pixels: bytes 0..4 hold the high 8 bits of each
/// pixel, byte 4 holds the low 2 bits of pixel `i` at bit `2 * i`.
/// `stride` is the number of bytes per row including driver padding.
pub fn unpack_y10p(
    packed: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<Vec<u16>, FrameError> {
    let w = width as usize;
    let h = height as usize;
    let row_bytes = (w * 5).div_ceil(4);
    let stride = stride.max(row_bytes);
    let expected = stride * h.saturating_sub(1) + row_bytes;
    if h > 0 && packed.len() < expected {
        return Err(FrameError::InvalidLength {
            format: SampleFormat::Gray10,
            expected,
            actual: packed.len(),
        });
    }

    let mut out = Vec::with_capacity(w * h);
    for row in 0..h {
        let line = &packed[row * stride..row * stride + row_bytes];
        let mut done = 0;
        for group in line.chunks(5) {
            let n = (w - done).min(4);
            let lsbs = group.get(n).copied().unwrap_or(0);
            for (i, &msb) in group.iter().take(n).enumerate() {
                let low = ((lsbs >> (2 * i)) & 0x03) as u16;
                out.push(((msb as u16) << 2) | low);
            }
            done += n;
        }
    }
    Ok(out)
}

/// Copies `rows` rows of `row_bytes` out of a buffer with `stride` bytes per row.
pub fn compact_rows(buf: &[u8], row_bytes: usize, stride: usize, rows: usize) -> Vec<u8> {
    if stride <= row_bytes {
        return buf[..(row_bytes * rows).min(buf.len())].to_vec();
    }
    let mut out = Vec::with_capacity(row_bytes * rows);
    for row in buf.chunks(stride).take(rows) {
        out.extend_from_slice(&row[..row_bytes.min(row.len())]);
    }
    out
}

/// Vertex for rendering a full-window quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ];

    /// Two triangles covering the quad.
    pub const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}
