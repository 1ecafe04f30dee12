//! Format Converter: raw camera frames to upright, packed RGBA
//!
//! Conversion is a pure function of the frame and the converter's fixed
//! settings, so it runs inline on the capture thread without shared state.

mod mjpeg;
mod yuv;

use serde::{Deserialize, Serialize};

use crate::capture::{Frame, Orientation, PixelFormat};
use crate::error::{BridgeError, Result};
use crate::ConvertConfig;

pub use yuv::YuvCoefficients;

/// YUV → RGB matrix the camera encodes with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorMatrix {
    #[default]
    Bt601,
    Bt709,
}

/// Luma/chroma quantization range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorRange {
    /// Y in 16..=235, UV in 16..=240
    #[default]
    Limited,
    Full,
}

pub const RGBA_BYTES: usize = 4;

/// Packed RGBA8 pixels ready for texture upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertedImage {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, always `width * 4`.
    pub stride: usize,
    pub sequence: u64,
}

impl ConvertedImage {
    /// Resizes in place, reusing the allocation when it is large enough.
    fn reset(&mut self, width: u32, height: u32, sequence: u64) {
        self.width = width;
        self.height = height;
        self.stride = width as usize * RGBA_BYTES;
        self.sequence = sequence;
        self.data.resize(self.stride * height as usize, 0);
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let at = y as usize * self.stride + x as usize * RGBA_BYTES;
        let mut px = [0; 4];
        px.copy_from_slice(&self.data[at..at + RGBA_BYTES]);
        Some(px)
    }
}

/// Maps source pixel coordinates to their upright, mirrored destination.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Transform {
    width: usize,
    height: usize,
    out_width: usize,
    orientation: Orientation,
    mirror: bool,
}

impl Transform {
    fn new(width: u32, height: u32, orientation: Orientation, mirror: bool) -> Self {
        let out_width = if orientation.swaps_dimensions() { height } else { width };
        Self {
            width: width as usize,
            height: height as usize,
            out_width: out_width as usize,
            orientation,
            mirror,
        }
    }

    /// Byte offset of source pixel `(x, y)` in the RGBA output.
    #[inline]
    pub(crate) fn offset(&self, x: usize, y: usize) -> usize {
        // mirror in sensor space, then rotate clockwise
        let x = if self.mirror { self.width - 1 - x } else { x };
        let (dx, dy) = match self.orientation {
            Orientation::Deg0 => (x, y),
            Orientation::Deg90 => (self.height - 1 - y, x),
            Orientation::Deg180 => (self.width - 1 - x, self.height - 1 - y),
            Orientation::Deg270 => (y, self.width - 1 - x),
        };
        (dy * self.out_width + dx) * RGBA_BYTES
    }

    #[inline]
    pub(crate) fn put(&self, out: &mut [u8], x: usize, y: usize, rgba: [u8; 4]) {
        let at = self.offset(x, y);
        out[at..at + RGBA_BYTES].copy_from_slice(&rgba);
    }
}

/// Converts raw frames to RGBA with a fixed orientation, mirroring and color matrix.
#[derive(Debug, Clone, Copy)]
pub struct FormatConverter {
    orientation: Orientation,
    mirror: bool,
    coefficients: YuvCoefficients,
}

impl FormatConverter {
    pub fn new(
        orientation: Orientation,
        mirror: bool,
        matrix: ColorMatrix,
        range: ColorRange,
    ) -> Self {
        Self {
            orientation,
            mirror,
            coefficients: YuvCoefficients::new(matrix, range),
        }
    }

    /// Uses the orientation from `config` when set, otherwise the one the sensor reports.
    pub fn from_config(config: &ConvertConfig, sensor: Orientation) -> Self {
        let orientation = config
            .sensor_orientation
            .map(Orientation::from_degrees)
            .unwrap_or(sensor);
        Self::new(orientation, config.mirror, config.color_matrix, config.range)
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Output size for a `width`x`height` source.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.orientation.swaps_dimensions() {
            (height, width)
        } else {
            (width, height)
        }
    }

    pub fn convert(&self, frame: &Frame) -> Result<ConvertedImage> {
        let mut image = ConvertedImage::default();
        self.convert_into(frame, &mut image)?;
        Ok(image)
    }

    /// Like [`convert`](Self::convert) but reuses `out`'s allocation.
    pub fn convert_into(&self, frame: &Frame, out: &mut ConvertedImage) -> Result<()> {
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            return Err(BridgeError::InvalidFrame(format!("empty {width}x{height} frame")));
        }

        let format = frame.format();
        if format == PixelFormat::Mjpeg {
            let decoded = mjpeg::decode(frame.bytes())?;
            if (decoded.width, decoded.height) != (width, height) {
                return Err(BridgeError::InvalidFrame(format!(
                    "JPEG is {}x{}, stream is {width}x{height}",
                    decoded.width, decoded.height
                )));
            }
            let (out_w, out_h) = self.output_size(width, height);
            out.reset(out_w, out_h, frame.sequence());
            let transform = Transform::new(width, height, self.orientation, self.mirror);
            let stride = width as usize * decoded.bytes_per_pixel;
            let pixels = &decoded.pixels;
            return match decoded.bytes_per_pixel {
                1 => packed_gray(pixels, stride, width, height, &transform, &mut out.data),
                _ => packed_rgb(
                    pixels,
                    stride,
                    width,
                    height,
                    PixelFormat::Rgb24,
                    &transform,
                    &mut out.data,
                ),
            };
        }

        let (out_w, out_h) = self.output_size(width, height);
        out.reset(out_w, out_h, frame.sequence());
        let transform = Transform::new(width, height, self.orientation, self.mirror);
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

        match format {
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                let (y_plane, y_stride) = plane(frame, 0, w, h)?;
                let (uv_plane, uv_stride) = plane(frame, 1, cw * 2, ch)?;
                yuv::semi_planar(
                    y_plane,
                    y_stride,
                    uv_plane,
                    uv_stride,
                    format == PixelFormat::Nv12,
                    w,
                    h,
                    &self.coefficients,
                    &transform,
                    &mut out.data,
                );
            }
            PixelFormat::I420 => {
                let (y_plane, y_stride) = plane(frame, 0, w, h)?;
                let (u_plane, u_stride) = plane(frame, 1, cw, ch)?;
                let (v_plane, v_stride) = plane(frame, 2, cw, ch)?;
                yuv::planar(
                    [(y_plane, y_stride), (u_plane, u_stride), (v_plane, v_stride)],
                    w,
                    h,
                    &self.coefficients,
                    &transform,
                    &mut out.data,
                );
            }
            PixelFormat::Yuyv => {
                let (packed, stride) = plane(frame, 0, cw * 4, h)?;
                yuv::packed_422(
                    packed,
                    stride,
                    w,
                    h,
                    &self.coefficients,
                    &transform,
                    &mut out.data,
                );
            }
            PixelFormat::Rgb24 | PixelFormat::Rgba | PixelFormat::Bgra => {
                let bpp = format.bytes_per_pixel().unwrap_or(RGBA_BYTES);
                let (bytes, stride) = plane(frame, 0, w * bpp, h)?;
                packed_rgb(bytes, stride, width, height, format, &transform, &mut out.data)?;
            }
            PixelFormat::Mjpeg => unreachable!("handled above"),
        }
        Ok(())
    }
}

/// Plane `index` checked to hold `rows` rows of at least `row_bytes` each.
fn plane(frame: &Frame, index: usize, row_bytes: usize, rows: usize) -> Result<(&[u8], usize)> {
    let (bytes, stride) = frame.plane(index).ok_or_else(|| {
        BridgeError::InvalidFrame(format!("{} frame lacks plane {index}", frame.format()))
    })?;
    if stride < row_bytes {
        return Err(BridgeError::InvalidFrame(format!(
            "plane {index} stride {stride} is shorter than a {row_bytes}-byte row"
        )));
    }
    let needed = stride * rows.saturating_sub(1) + row_bytes;
    if bytes.len() < needed {
        return Err(BridgeError::InvalidFrame(format!(
            "plane {index} holds {} bytes, needs {needed}",
            bytes.len()
        )));
    }
    Ok((bytes, stride))
}

fn packed_rgb(
    bytes: &[u8],
    stride: usize,
    width: u32,
    height: u32,
    format: PixelFormat,
    transform: &Transform,
    out: &mut [u8],
) -> Result<()> {
    let (w, h) = (width as usize, height as usize);
    let bpp = format.bytes_per_pixel().unwrap_or(RGBA_BYTES);
    if bytes.len() < stride * h.saturating_sub(1) + w * bpp {
        return Err(BridgeError::InvalidFrame(format!("{format} buffer too small")));
    }
    for y in 0..h {
        let row = &bytes[y * stride..y * stride + w * bpp];
        for (x, px) in row.chunks_exact(bpp).enumerate() {
            let rgba = match format {
                PixelFormat::Rgb24 => [px[0], px[1], px[2], 255],
                PixelFormat::Bgra => [px[2], px[1], px[0], px[3]],
                _ => [px[0], px[1], px[2], px[3]],
            };
            transform.put(out, x, y, rgba);
        }
    }
    Ok(())
}

fn packed_gray(
    bytes: &[u8],
    stride: usize,
    width: u32,
    height: u32,
    transform: &Transform,
    out: &mut [u8],
) -> Result<()> {
    let (w, h) = (width as usize, height as usize);
    if bytes.len() < stride * h.saturating_sub(1) + w {
        return Err(BridgeError::InvalidFrame("grayscale buffer too small".into()));
    }
    for y in 0..h {
        for (x, &l) in bytes[y * stride..y * stride + w].iter().enumerate() {
            transform.put(out, x, y, [l, l, l, 255]);
        }
    }
    Ok(())
}
