use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::pool::PooledBuffer;
use crate::error::{BridgeError, Result};

/// Raw layouts a camera driver may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Y plane + interleaved UV plane, 4:2:0
    Nv12,
    /// Y plane + interleaved VU plane, 4:2:0 (Android camera default)
    Nv21,
    /// Three planes Y, U, V, 4:2:0
    I420,
    /// Packed Y0 U Y1 V, 4:2:2
    Yuyv,
    Rgb24,
    Rgba,
    Bgra,
    Mjpeg,
}

impl PixelFormat {
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            PixelFormat::I420 => 3,
            _ => 1,
        }
    }

    pub fn is_yuv(self) -> bool {
        matches!(
            self,
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::I420 | PixelFormat::Yuyv
        )
    }

    /// Bytes per pixel of the first plane; `None` for compressed formats.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::I420 => Some(1),
            PixelFormat::Yuyv => Some(2),
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Rgba | PixelFormat::Bgra => Some(4),
            PixelFormat::Mjpeg => None,
        }
    }

    /// Tightly packed plane layouts for a `width`x`height` image.
    pub fn packed_layout(self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 => vec![
                PlaneLayout::new(0, w, h),
                PlaneLayout::new(w * h, cw * 2, ch),
            ],
            PixelFormat::I420 => vec![
                PlaneLayout::new(0, w, h),
                PlaneLayout::new(w * h, cw, ch),
                PlaneLayout::new(w * h + cw * ch, cw, ch),
            ],
            PixelFormat::Yuyv => vec![PlaneLayout::new(0, cw * 4, h)],
            PixelFormat::Rgb24 => vec![PlaneLayout::new(0, w * 3, h)],
            PixelFormat::Rgba | PixelFormat::Bgra => vec![PlaneLayout::new(0, w * 4, h)],
            PixelFormat::Mjpeg => Vec::new(),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::I420 => "I420",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Mjpeg => "MJPEG",
        };
        f.write_str(name)
    }
}

/// Clockwise rotation that brings a sensor image upright.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Orientation {
    /// Normalizes any angle, negative or not a quarter turn, to the nearest quarter turn.
    pub fn from_degrees(degrees: i32) -> Self {
        let quarter = ((degrees as f64) / 90.0).round() as i64;
        match quarter.rem_euclid(4) {
            0 => Orientation::Deg0,
            1 => Orientation::Deg90,
            2 => Orientation::Deg180,
            _ => Orientation::Deg270,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Orientation::Deg0 => 0,
            Orientation::Deg90 => 90,
            Orientation::Deg180 => 180,
            Orientation::Deg270 => 270,
        }
    }

    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Orientation::Deg90 | Orientation::Deg270)
    }
}

/// Where one plane lives inside a frame buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    /// Bytes per row, may exceed the visible row width.
    pub stride: usize,
    pub rows: usize,
}

impl PlaneLayout {
    pub fn new(offset: usize, stride: usize, rows: usize) -> Self {
        Self {
            offset,
            stride,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.stride * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub const MAX_PLANES: usize = 3;

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: [PlaneLayout; MAX_PLANES],
    pub plane_count: usize,
    /// Bytes actually used in the buffer; compressed frames are shorter than the buffer.
    pub bytes_used: usize,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// One capture from the camera.
///
/// Immutable once delivered. Cloning retains the underlying pooled buffer
/// (reference-count increment); the buffer returns to the driver pool when
/// the last clone drops.
#[derive(Clone)]
pub struct Frame {
    data: Arc<PooledBuffer>,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    /// Wraps a filled buffer. Plane layouts must fit inside `bytes_used`.
    pub fn new(
        data: PooledBuffer,
        width: u32,
        height: u32,
        format: PixelFormat,
        layouts: &[PlaneLayout],
        sequence: u64,
        device_timestamp: Option<Duration>,
    ) -> Result<Self> {
        if layouts.len() > MAX_PLANES {
            return Err(BridgeError::InvalidFrame(format!(
                "{} planes exceed the maximum of {MAX_PLANES}",
                layouts.len()
            )));
        }
        if format != PixelFormat::Mjpeg && layouts.len() != format.plane_count() {
            return Err(BridgeError::InvalidFrame(format!(
                "{format} needs {} planes, got {}",
                format.plane_count(),
                layouts.len()
            )));
        }
        let bytes_used = data.len();
        for (i, plane) in layouts.iter().enumerate() {
            if plane.offset + plane.len() > bytes_used {
                return Err(BridgeError::InvalidFrame(format!(
                    "plane {i} ends at {} past buffer of {bytes_used} bytes",
                    plane.offset + plane.len()
                )));
            }
        }

        let mut planes = [PlaneLayout::default(); MAX_PLANES];
        planes[..layouts.len()].copy_from_slice(layouts);

        Ok(Self {
            data: Arc::new(data),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                format,
                planes,
                plane_count: layouts.len(),
                bytes_used,
                device_timestamp,
            }),
            timestamp: Instant::now(),
        })
    }

    /// Unpooled frame over an owned buffer with tightly packed planes.
    pub fn from_packed(
        bytes: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self> {
        let layouts = format.packed_layout(width, height);
        Self::new(
            PooledBuffer::detached(bytes),
            width,
            height,
            format,
            &layouts,
            sequence,
            None,
        )
    }

    /// Explicitly keep the frame past the delivery callback.
    pub fn retain(&self) -> Frame {
        self.clone()
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    /// Plane bytes including row padding.
    pub fn plane(&self, index: usize) -> Option<(&[u8], usize)> {
        if index >= self.meta.plane_count {
            return None;
        }
        let layout = self.meta.planes[index];
        let bytes = self.data.as_slice();
        Some((&bytes[layout.offset..layout.offset + layout.len()], layout.stride))
    }

    /// All bytes the driver wrote, e.g. a compressed MJPEG payload.
    pub fn bytes(&self) -> &[u8] {
        &self.data.as_slice()[..self.meta.bytes_used]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orientation_normalizes_negative_and_odd_angles() {
        assert_eq!(Orientation::from_degrees(-90), Orientation::Deg270);
        assert_eq!(Orientation::from_degrees(450), Orientation::Deg90);
        assert_eq!(Orientation::from_degrees(-180), Orientation::Deg180);
        assert_eq!(Orientation::from_degrees(100), Orientation::Deg90);
        assert_eq!(Orientation::from_degrees(-44), Orientation::Deg0);
        assert!(Orientation::Deg270.swaps_dimensions());
        assert!(!Orientation::Deg180.swaps_dimensions());
    }

    #[test]
    fn packed_layout_handles_odd_dimensions() {
        let planes = PixelFormat::I420.packed_layout(5, 3);
        assert_eq!(planes[0], PlaneLayout::new(0, 5, 3));
        assert_eq!(planes[1], PlaneLayout::new(15, 3, 2));
        assert_eq!(planes[2], PlaneLayout::new(21, 3, 2));

        let nv21 = PixelFormat::Nv21.packed_layout(5, 3);
        assert_eq!(nv21[1], PlaneLayout::new(15, 6, 2));
    }

    #[test]
    fn frame_rejects_plane_past_buffer() {
        let result = Frame::new(
            PooledBuffer::detached(vec![0; 10]),
            4,
            4,
            PixelFormat::Rgba,
            &[PlaneLayout::new(0, 16, 4)],
            1,
            None,
        );
        assert!(matches!(result, Err(BridgeError::InvalidFrame(_))));
    }

    #[test]
    fn frame_rejects_wrong_plane_count() {
        let result = Frame::new(
            PooledBuffer::detached(vec![0; 24]),
            4,
            4,
            PixelFormat::Nv12,
            &[PlaneLayout::new(0, 4, 4)],
            1,
            None,
        );
        assert!(matches!(result, Err(BridgeError::InvalidFrame(_))));
    }

    #[test]
    fn retain_shares_the_buffer() {
        let frame = Frame::from_packed(vec![7; 16], 2, 2, PixelFormat::Rgba, 9).unwrap();
        let kept = frame.retain();
        drop(frame);
        assert_eq!(kept.sequence(), 9);
        let (plane, stride) = kept.plane(0).unwrap();
        assert_eq!(stride, 8);
        assert!(plane.iter().all(|&b| b == 7));
    }
}
