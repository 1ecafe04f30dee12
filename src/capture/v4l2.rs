//! V4L2 camera driver for Linux boards and desktop development

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::driver::{
    CameraDescriptor, CameraDriver, Facing, FrameSink, NegotiatedFormat, StreamRequest,
};
use super::frame::{Orientation, PixelFormat, PlaneLayout};
use super::source::join_bounded;
use crate::error::{BridgeError, Result};

const MAX_DEVICES: u32 = 10;

/// How long one dequeue may block before the thread rechecks `running`.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// A stalled device gets this long to leave its dequeue on `stop`.
const STOP_TIMEOUT: Duration = Duration::from_millis(300);

fn fourcc_for(format: PixelFormat) -> Result<FourCC> {
    match format {
        PixelFormat::Mjpeg => Ok(FourCC::new(b"MJPG")),
        PixelFormat::Yuyv => Ok(FourCC::new(b"YUYV")),
        PixelFormat::Nv12 => Ok(FourCC::new(b"NV12")),
        PixelFormat::Nv21 => Ok(FourCC::new(b"NV21")),
        PixelFormat::I420 => Ok(FourCC::new(b"YU12")),
        PixelFormat::Rgb24 => Ok(FourCC::new(b"RGB3")),
        other => Err(BridgeError::FormatUnsupported(format!(
            "V4L2 has no mapping for {other}"
        ))),
    }
}

/// Plane layouts for a contiguous V4L2 buffer with luma stride `stride`.
fn layouts_for(format: PixelFormat, stride: usize, height: usize) -> Vec<PlaneLayout> {
    let chroma_rows = height.div_ceil(2);
    match format {
        PixelFormat::Nv12 | PixelFormat::Nv21 => vec![
            PlaneLayout::new(0, stride, height),
            PlaneLayout::new(stride * height, stride, chroma_rows),
        ],
        PixelFormat::I420 => {
            let chroma_stride = stride.div_ceil(2);
            let u = stride * height;
            vec![
                PlaneLayout::new(0, stride, height),
                PlaneLayout::new(u, chroma_stride, chroma_rows),
                PlaneLayout::new(u + chroma_stride * chroma_rows, chroma_stride, chroma_rows),
            ]
        }
        PixelFormat::Mjpeg => Vec::new(),
        _ => vec![PlaneLayout::new(0, stride, height)],
    }
}

/// Camera driver over a `/dev/videoN` node.
pub struct V4l2Driver {
    device: Option<Device>,
    negotiated: Option<NegotiatedFormat>,
    stride: usize,
    buffer_count: u32,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl V4l2Driver {
    pub fn new(buffer_count: u32) -> Self {
        Self {
            device: None,
            negotiated: None,
            stride: 0,
            buffer_count: buffer_count.max(2),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new(4)
    }
}

impl CameraDriver for V4l2Driver {
    fn enumerate(&self) -> Vec<CameraDescriptor> {
        let mut found = Vec::new();
        for i in 0..MAX_DEVICES {
            let path = format!("/dev/video{}", i);
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                debug!("Found capture device: {} - {}", path, caps.card);
                found.push(CameraDescriptor {
                    id: path,
                    name: caps.card,
                    facing: Facing::External,
                    sensor_orientation: 0,
                });
            }
        }
        found
    }

    #[instrument(skip_all, fields(device = %camera.id))]
    fn open(
        &mut self,
        camera: &CameraDescriptor,
        request: &StreamRequest,
    ) -> Result<NegotiatedFormat> {
        let unavailable =
            |e: io::Error| BridgeError::DeviceUnavailable(format!("{}: {e}", camera.id));

        let device = Device::with_path(&camera.id).map_err(unavailable)?;
        let caps = device.query_caps().map_err(unavailable)?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(BridgeError::DeviceUnavailable(format!(
                "{} doesn't support video capture",
                camera.id
            )));
        }

        let wanted = request.format.unwrap_or(PixelFormat::Yuyv);
        let fourcc = fourcc_for(wanted)?;
        let mut fmt = device.format().map_err(unavailable)?;
        fmt.width = request.resolution.width;
        fmt.height = request.resolution.height;
        fmt.fourcc = fourcc;
        let actual = device.set_format(&fmt).map_err(unavailable)?;
        if actual.fourcc != fourcc {
            return Err(BridgeError::FormatUnsupported(format!(
                "{} negotiated {} instead of {wanted}",
                camera.id, actual.fourcc
            )));
        }

        let bpp = wanted.bytes_per_pixel().unwrap_or(1);
        self.stride = (actual.stride as usize).max(actual.width as usize * bpp);
        let negotiated = NegotiatedFormat {
            width: actual.width,
            height: actual.height,
            format: wanted,
            fps: request.fps,
            orientation: Orientation::Deg0,
            frame_len: actual.size as usize,
        };
        self.device = Some(device);
        self.negotiated = Some(negotiated);
        Ok(negotiated)
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        let (Some(device), Some(negotiated)) = (self.device.take(), self.negotiated) else {
            return Err(BridgeError::DeviceUnavailable("V4L2 device not open".into()));
        };
        let layouts = layouts_for(negotiated.format, self.stride, negotiated.height as usize);
        let buffer_count = self.buffer_count;

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("camtex-v4l2".into())
            .spawn(move || {
                let mapped = MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count);
                let mut stream = match mapped {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to map capture buffers: {e}");
                        sink.disconnected(e.to_string());
                        return;
                    }
                };
                stream.set_timeout(POLL_TIMEOUT);
                info!("Capture stream started with {} buffers", buffer_count);

                while running.load(Ordering::Acquire) {
                    let (buf, meta) = match stream.next() {
                        Ok(next) => next,
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                        Err(e) => {
                            error!("Capture error: {e}");
                            sink.disconnected(e.to_string());
                            break;
                        }
                    };
                    let used = (meta.bytesused as usize).min(buf.len());
                    let Some(mut frame) = sink.buffer(used) else {
                        sink.dropped();
                        continue;
                    };
                    frame.as_mut_slice().copy_from_slice(&buf[..used]);
                    let timestamp = Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64);
                    if let Err(e) = sink.deliver(frame, &layouts, Some(timestamp)) {
                        debug!("Dropping short V4L2 buffer: {e}");
                        sink.dropped();
                    }
                }
            })
            .map_err(|e| BridgeError::DeviceUnavailable(format!("spawn V4L2 thread: {e}")))?;
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            // a detached thread closes the device when its dequeue returns
            join_bounded(handle, STOP_TIMEOUT);
        }
        self.device = None;
        self.negotiated = None;
    }

    fn is_open(&self) -> bool {
        self.negotiated.is_some()
    }
}

impl Drop for V4l2Driver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_layout_follows_driver_stride() {
        let layouts = layouts_for(PixelFormat::Nv12, 656, 480);
        assert_eq!(layouts[0], PlaneLayout::new(0, 656, 480));
        assert_eq!(layouts[1], PlaneLayout::new(656 * 480, 656, 240));
    }

    #[test]
    fn stop_outlasts_one_dequeue() {
        assert!(STOP_TIMEOUT > POLL_TIMEOUT * 2);
    }

    #[test]
    fn bgra_has_no_fourcc() {
        assert!(matches!(
            fourcc_for(PixelFormat::Bgra),
            Err(BridgeError::FormatUnsupported(_))
        ));
    }
}
