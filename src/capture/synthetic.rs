//! Test-pattern camera driver
//!
//! Behaves like a vendor camera stack: frames are produced on the driver's
//! own thread at the negotiated rate and pushed through a [`FrameSink`].
//! Used by the demo binary, the tests, and hosts without a camera.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use tracing::{debug, info, warn};

use super::driver::{
    CameraDescriptor, CameraDriver, Facing, FrameSink, NegotiatedFormat, StreamRequest,
};
use super::frame::{Orientation, PixelFormat, PlaneLayout};
use super::source::join_bounded;
use crate::error::{BridgeError, Result};

/// Image the synthetic sensor produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// See [`pattern_pixel`].
    Gradient,
    Solid([u8; 3]),
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub cameras: Vec<CameraDescriptor>,
    pub supported_formats: Vec<PixelFormat>,
    /// Used when the request does not name a format.
    pub native_format: PixelFormat,
    pub pattern: Pattern,
    /// Extra bytes appended to every row of every plane.
    pub row_padding: usize,
    /// Report a disconnect after this many delivered frames.
    pub disconnect_after: Option<u64>,
    /// Every n-th capture is dropped by the "sensor".
    pub drop_every: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            cameras: vec![
                CameraDescriptor {
                    id: "synthetic-back".into(),
                    name: "Synthetic back camera".into(),
                    facing: Facing::Back,
                    sensor_orientation: 90,
                },
                CameraDescriptor {
                    id: "synthetic-front".into(),
                    name: "Synthetic front camera".into(),
                    facing: Facing::Front,
                    sensor_orientation: 270,
                },
            ],
            supported_formats: vec![
                PixelFormat::Nv12,
                PixelFormat::Nv21,
                PixelFormat::I420,
                PixelFormat::Yuyv,
                PixelFormat::Rgb24,
                PixelFormat::Rgba,
                PixelFormat::Bgra,
                PixelFormat::Mjpeg,
            ],
            native_format: PixelFormat::Nv21,
            pattern: Pattern::Gradient,
            row_padding: 0,
            disconnect_after: None,
            drop_every: None,
        }
    }
}

/// Deterministic RGB value of the gradient pattern at `(x, y)`.
pub fn pattern_pixel(x: u32, y: u32) -> [u8; 3] {
    [
        (x.wrapping_mul(7) & 0xFF) as u8,
        (y.wrapping_mul(13) & 0xFF) as u8,
        ((x + y).wrapping_mul(3) & 0xFF) as u8,
    ]
}

/// Plane layouts with `padding` extra bytes per row.
pub fn padded_layout(
    format: PixelFormat,
    width: u32,
    height: u32,
    padding: usize,
) -> Vec<PlaneLayout> {
    let mut offset = 0;
    format
        .packed_layout(width, height)
        .into_iter()
        .map(|plane| {
            let stride = plane.stride + padding;
            let layout = PlaneLayout::new(offset, stride, plane.rows);
            offset += layout.len();
            layout
        })
        .collect()
}

#[derive(Default)]
struct ControlShared {
    busy: AtomicBool,
    open: AtomicBool,
    opens: AtomicU64,
    starts: AtomicU64,
    emitted: AtomicU64,
    disconnect: AtomicBool,
}

/// Observes and steers a [`SyntheticDriver`] from another thread.
#[derive(Clone, Default)]
pub struct SyntheticControl {
    shared: Arc<ControlShared>,
}

impl SyntheticControl {
    /// While busy, `open` fails with `DeviceUnavailable`.
    pub fn set_busy(&self, busy: bool) {
        self.shared.busy.store(busy, Ordering::Release);
    }

    /// Makes the running stream report a disconnect.
    pub fn disconnect(&self) {
        self.shared.disconnect.store(true, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn open_count(&self) -> u64 {
        self.shared.opens.load(Ordering::Acquire)
    }

    pub fn start_count(&self) -> u64 {
        self.shared.starts.load(Ordering::Acquire)
    }

    pub fn frames_emitted(&self) -> u64 {
        self.shared.emitted.load(Ordering::Acquire)
    }
}

pub struct SyntheticDriver {
    config: SyntheticConfig,
    control: SyntheticControl,
    negotiated: Option<NegotiatedFormat>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticDriver {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            control: SyntheticControl::default(),
            negotiated: None,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn control(&self) -> SyntheticControl {
        self.control.clone()
    }
}

impl CameraDriver for SyntheticDriver {
    fn enumerate(&self) -> Vec<CameraDescriptor> {
        self.config.cameras.clone()
    }

    fn open(
        &mut self,
        camera: &CameraDescriptor,
        request: &StreamRequest,
    ) -> Result<NegotiatedFormat> {
        if self.control.shared.busy.load(Ordering::Acquire) {
            return Err(BridgeError::DeviceUnavailable(format!("{} is busy", camera.id)));
        }
        if !self.config.cameras.iter().any(|c| c.id == camera.id) {
            return Err(BridgeError::DeviceUnavailable(format!("no camera {}", camera.id)));
        }

        let format = request.format.unwrap_or(self.config.native_format);
        if !self.config.supported_formats.contains(&format) {
            return Err(BridgeError::FormatUnsupported(format!(
                "{} cannot deliver {format}",
                camera.id
            )));
        }

        let (width, height) = (request.resolution.width, request.resolution.height);
        let frame_len = match format {
            // worst case for a baseline JPEG of noisy content
            PixelFormat::Mjpeg => width as usize * height as usize * 3 + 4096,
            _ => padded_layout(format, width, height, self.config.row_padding)
                .iter()
                .map(|plane| plane.offset + plane.len())
                .max()
                .unwrap_or(0),
        };

        let negotiated = NegotiatedFormat {
            width,
            height,
            format,
            fps: request.fps.max(1),
            orientation: Orientation::from_degrees(camera.sensor_orientation),
            frame_len,
        };
        self.negotiated = Some(negotiated);
        self.control.shared.open.store(true, Ordering::Release);
        self.control.shared.opens.fetch_add(1, Ordering::AcqRel);
        debug!("Synthetic camera {} opened", camera.id);
        Ok(negotiated)
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        let negotiated = self
            .negotiated
            .ok_or_else(|| BridgeError::DeviceUnavailable("synthetic camera not open".into()))?;
        if self.thread.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::Release);
        self.control.shared.disconnect.store(false, Ordering::Release);
        self.control.shared.starts.fetch_add(1, Ordering::AcqRel);

        let running = Arc::clone(&self.running);
        let control = self.control.clone();
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name("camtex-synthetic".into())
            .spawn(move || produce(negotiated, config, sink, running, control))
            .map_err(|e| BridgeError::DeviceUnavailable(format!("spawn synthetic thread: {e}")))?;
        self.thread = Some(handle);
        info!(
            "Synthetic camera streaming {}x{} {} @ {}fps",
            negotiated.width, negotiated.height, negotiated.format, negotiated.fps
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            // the producer sleeps at most one frame interval between checks
            let interval = self
                .negotiated
                .map_or(Duration::ZERO, |f| Duration::from_secs_f64(1.0 / f.fps as f64));
            join_bounded(handle, interval + Duration::from_millis(100));
        }
        if self.control.shared.open.swap(false, Ordering::AcqRel) {
            debug!("Synthetic camera closed");
        }
        self.negotiated = None;
    }

    fn is_open(&self) -> bool {
        self.control.is_open()
    }
}

impl Drop for SyntheticDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce(
    format: NegotiatedFormat,
    config: SyntheticConfig,
    sink: FrameSink,
    running: Arc<AtomicBool>,
    control: SyntheticControl,
) {
    let interval = Duration::from_secs_f64(1.0 / format.fps as f64);
    let started = Instant::now();
    let mut next = started;
    let mut captures = 0u64;
    let mut delivered = 0u64;
    let mut jpeg = Vec::new();

    while running.load(Ordering::Acquire) {
        next += interval;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }

        let disconnect_due = config.disconnect_after.is_some_and(|n| delivered >= n);
        if control.shared.disconnect.swap(false, Ordering::AcqRel) || disconnect_due {
            warn!("Synthetic camera disconnected");
            sink.disconnected("synthetic camera disconnected");
            break;
        }

        captures += 1;
        if config.drop_every.is_some_and(|n| n > 0 && captures % n == 0) {
            sink.dropped();
            continue;
        }

        let Some(mut buffer) = sink.buffer(format.frame_len) else {
            sink.dropped();
            continue;
        };

        let layouts = if format.format == PixelFormat::Mjpeg {
            jpeg.clear();
            if let Err(e) = encode_jpeg(&mut jpeg, format.width, format.height, config.pattern) {
                warn!("Synthetic JPEG encode failed: {e}");
                sink.dropped();
                continue;
            }
            let used = jpeg.len().min(buffer.len());
            buffer.as_mut_slice()[..used].copy_from_slice(&jpeg[..used]);
            buffer.truncate(used);
            Vec::new()
        } else {
            let (width, height) = (format.width, format.height);
            let layouts = padded_layout(format.format, width, height, config.row_padding);
            let bytes = buffer.as_mut_slice();
            fill(bytes, format.format, width, height, &layouts, config.pattern);
            layouts
        };

        match sink.deliver(buffer, &layouts, Some(started.elapsed())) {
            Ok(_) => {
                delivered += 1;
                control.shared.emitted.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => warn!("Synthetic frame rejected: {e}"),
        }
    }
}

fn rgb_at(pattern: Pattern, x: u32, y: u32) -> [u8; 3] {
    match pattern {
        Pattern::Gradient => pattern_pixel(x, y),
        Pattern::Solid(rgb) => rgb,
    }
}

/// Full-range BT.601, the inverse of what the converter applies for `ColorRange::Full`.
pub fn rgb_to_yuv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
    let v = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
    [
        y.round().clamp(0.0, 255.0) as u8,
        u.round().clamp(0.0, 255.0) as u8,
        v.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Writes the pattern into `buf` following `layouts`.
pub fn fill(
    buf: &mut [u8],
    format: PixelFormat,
    width: u32,
    height: u32,
    layouts: &[PlaneLayout],
    pattern: Pattern,
) {
    let (w, h) = (width as usize, height as usize);
    match format {
        PixelFormat::Rgb24 | PixelFormat::Rgba | PixelFormat::Bgra => {
            let plane = layouts[0];
            let bpp = format.bytes_per_pixel().unwrap_or(4);
            for y in 0..h {
                for x in 0..w {
                    let [r, g, b] = rgb_at(pattern, x as u32, y as u32);
                    let at = plane.offset + y * plane.stride + x * bpp;
                    let px = &mut buf[at..at + bpp];
                    match format {
                        PixelFormat::Rgb24 => px.copy_from_slice(&[r, g, b]),
                        PixelFormat::Rgba => px.copy_from_slice(&[r, g, b, 255]),
                        _ => px.copy_from_slice(&[b, g, r, 255]),
                    }
                }
            }
        }
        PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::I420 => {
            let luma = layouts[0];
            for y in 0..h {
                for x in 0..w {
                    let [luma_value, _, _] = rgb_to_yuv(rgb_at(pattern, x as u32, y as u32));
                    buf[luma.offset + y * luma.stride + x] = luma_value;
                }
            }
            for cy in 0..h.div_ceil(2) {
                for cx in 0..w.div_ceil(2) {
                    let [_, u, v] = rgb_to_yuv(rgb_at(pattern, (cx * 2) as u32, (cy * 2) as u32));
                    match format {
                        PixelFormat::I420 => {
                            buf[layouts[1].offset + cy * layouts[1].stride + cx] = u;
                            buf[layouts[2].offset + cy * layouts[2].stride + cx] = v;
                        }
                        _ => {
                            let at = layouts[1].offset + cy * layouts[1].stride + cx * 2;
                            let (first, second) = if format == PixelFormat::Nv12 {
                                (u, v)
                            } else {
                                (v, u)
                            };
                            buf[at] = first;
                            buf[at + 1] = second;
                        }
                    }
                }
            }
        }
        PixelFormat::Yuyv => {
            let plane = layouts[0];
            for y in 0..h {
                for pair in 0..w.div_ceil(2) {
                    let x0 = (pair * 2) as u32;
                    let [y0, u, v] = rgb_to_yuv(rgb_at(pattern, x0, y as u32));
                    let x1 = (x0 + 1).min(width.saturating_sub(1));
                    let y1 = rgb_to_yuv(rgb_at(pattern, x1, y as u32))[0];
                    let at = plane.offset + y * plane.stride + pair * 4;
                    buf[at..at + 4].copy_from_slice(&[y0, u, y1, v]);
                }
            }
        }
        PixelFormat::Mjpeg => {}
    }
}

fn encode_jpeg(
    out: &mut Vec<u8>,
    width: u32,
    height: u32,
    pattern: Pattern,
) -> image::ImageResult<()> {
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            rgb.extend_from_slice(&rgb_at(pattern, x, y));
        }
    }
    JpegEncoder::new_with_quality(out, 95).encode(
        &rgb,
        width,
        height,
        image::ExtendedColorType::Rgb8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Resolution;

    fn request(format: Option<PixelFormat>) -> StreamRequest {
        StreamRequest {
            resolution: Resolution::new(32, 16),
            fps: 120,
            format,
        }
    }

    #[test]
    fn open_negotiates_native_format_and_orientation() {
        let mut driver = SyntheticDriver::new(SyntheticConfig::default());
        let camera = driver.enumerate()[0].clone();
        let format = driver.open(&camera, &request(None)).unwrap();
        assert_eq!(format.format, PixelFormat::Nv21);
        assert_eq!(format.orientation, Orientation::Deg90);
        assert_eq!(format.frame_len, 32 * 16 * 3 / 2);
        assert!(driver.is_open());
        driver.stop();
        assert!(!driver.is_open());
    }

    #[test]
    fn busy_camera_is_unavailable() {
        let mut driver = SyntheticDriver::new(SyntheticConfig::default());
        driver.control().set_busy(true);
        let camera = driver.enumerate()[0].clone();
        assert!(matches!(
            driver.open(&camera, &request(None)),
            Err(BridgeError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let mut driver = SyntheticDriver::new(SyntheticConfig {
            supported_formats: vec![PixelFormat::Nv12],
            ..SyntheticConfig::default()
        });
        let camera = driver.enumerate()[0].clone();
        assert!(matches!(
            driver.open(&camera, &request(Some(PixelFormat::Yuyv))),
            Err(BridgeError::FormatUnsupported(_))
        ));
    }

    #[test]
    fn padded_layout_grows_every_row() {
        let layouts = padded_layout(PixelFormat::Nv12, 4, 4, 4);
        assert_eq!(layouts[0], PlaneLayout::new(0, 8, 4));
        assert_eq!(layouts[1], PlaneLayout::new(32, 8, 2));
    }

    #[test]
    fn rgb_to_yuv_keeps_gray_neutral() {
        assert_eq!(rgb_to_yuv([128, 128, 128]), [128, 128, 128]);
        assert_eq!(rgb_to_yuv([0, 0, 0]), [0, 128, 128]);
        assert_eq!(rgb_to_yuv([255, 255, 255]), [255, 128, 128]);
    }
}
