#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camtex::capture::{
    CameraDescriptor, CameraDriver, Facing, FrameSink, NegotiatedFormat, Orientation,
    StreamRequest, SyntheticConfig, SyntheticControl, SyntheticDriver,
};
use camtex::convert::ConvertedImage;
use camtex::host::{ChannelMessenger, HostEvent, PermissionProvider, StaticPermission};
use camtex::texture::{CpuTextureBackend, TextureBackend, TextureDesc, TextureHandle};
use camtex::{BridgeSurface, Config, LifecycleController, PixelFormat, Resolution, Result};

/// Small, fast stream: 32x24 NV21 at 200fps on the 90° back camera.
pub fn config() -> Config {
    let mut config = Config::default();
    config.capture.resolution = Resolution::new(32, 24);
    config.capture.fps = 200;
    config.capture.format = Some(PixelFormat::Nv21);
    config
}

pub struct Harness {
    pub controller: LifecycleController,
    pub camera: SyntheticControl,
    pub backend: Arc<CpuTextureBackend>,
    pub messages: flume::Receiver<HostEvent>,
}

pub fn harness(config: Config, synthetic: SyntheticConfig) -> Harness {
    harness_with(config, synthetic, Arc::new(StaticPermission::granted()))
}

pub fn harness_with(
    config: Config,
    synthetic: SyntheticConfig,
    permission: Arc<dyn PermissionProvider>,
) -> Harness {
    let driver = SyntheticDriver::new(synthetic);
    let camera = driver.control();
    let backend = Arc::new(CpuTextureBackend::new());
    let (messenger, messages) = ChannelMessenger::new();
    let controller = LifecycleController::builder(Box::new(driver))
        .config(config)
        .backend(backend.clone())
        .permission(permission)
        .messenger(Arc::new(messenger))
        .build()
        .unwrap();
    Harness {
        controller,
        camera,
        backend,
        messages,
    }
}

/// Polls the bridge like a host render loop until a frame shows up.
pub fn wait_for_frame(bridge: &BridgeSurface, timeout: Duration) -> Option<TextureHandle> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let handle = bridge.get_current_texture_handle();
        if !handle.is_null() {
            return Some(handle);
        }
        thread::sleep(Duration::from_millis(2));
    }
    None
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// CPU textures whose uploads take `delay`, to hold a frame callback in flight.
pub struct SlowBackend {
    pub inner: CpuTextureBackend,
    pub delay: Duration,
    pub uploading: AtomicBool,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: CpuTextureBackend::new(),
            delay,
            uploading: AtomicBool::new(false),
        }
    }
}

impl TextureBackend for SlowBackend {
    fn create(&self, desc: &TextureDesc) -> Result<TextureHandle> {
        self.inner.create(desc)
    }

    fn upload(&self, handle: TextureHandle, image: &ConvertedImage) -> Result<()> {
        self.uploading.store(true, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.inner.upload(handle, image)
    }

    fn read_back(&self, handle: TextureHandle) -> Option<Vec<u8>> {
        self.inner.read_back(handle)
    }

    fn release(&self, handle: TextureHandle) {
        self.inner.release(handle)
    }

    fn live_handles(&self) -> usize {
        self.inner.live_handles()
    }
}

/// An 8x8 baseline JPEG with four components, which decodes as CMYK.
///
/// Every block is flat: one-symbol Huffman tables, DC difference 0, then
/// end-of-block.
pub fn cmyk_jpeg() -> Vec<u8> {
    let mut jpeg = vec![0xFF, 0xD8];
    // quantization table 0, all ones
    jpeg.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x43, 0x00]);
    jpeg.extend_from_slice(&[1; 64]);
    // baseline frame: 8 bit, 8x8, four components sampled 1x1 on table 0
    jpeg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x14, 0x08, 0x00, 0x08, 0x00, 0x08, 0x04]);
    for id in 1..=4 {
        jpeg.extend_from_slice(&[id, 0x11, 0x00]);
    }
    // DC and AC table 0, each a single one-bit code for symbol 0
    for class in [0x00, 0x10] {
        jpeg.extend_from_slice(&[0xFF, 0xC4, 0x00, 0x14, class, 0x01]);
        jpeg.extend_from_slice(&[0; 15]);
        jpeg.push(0x00);
    }
    // scan over all four components
    jpeg.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x0E, 0x04]);
    for id in 1..=4 {
        jpeg.extend_from_slice(&[id, 0x00]);
    }
    jpeg.extend_from_slice(&[0x00, 0x3F, 0x00]);
    // four blocks of two zero bits each
    jpeg.push(0x00);
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    jpeg
}

/// A camera that streams the same MJPEG bytes over and over, through the
/// public driver API.
pub struct StillJpegCamera {
    jpeg: Arc<Vec<u8>>,
    width: u32,
    height: u32,
    open: bool,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StillJpegCamera {
    pub fn new(jpeg: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            jpeg: Arc::new(jpeg),
            width,
            height,
            open: false,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl CameraDriver for StillJpegCamera {
    fn enumerate(&self) -> Vec<CameraDescriptor> {
        vec![CameraDescriptor {
            id: "still".into(),
            name: "Still JPEG camera".into(),
            facing: Facing::Back,
            sensor_orientation: 0,
        }]
    }

    fn open(
        &mut self,
        _camera: &CameraDescriptor,
        request: &StreamRequest,
    ) -> Result<NegotiatedFormat> {
        self.open = true;
        Ok(NegotiatedFormat {
            width: self.width,
            height: self.height,
            format: PixelFormat::Mjpeg,
            fps: request.fps,
            orientation: Orientation::Deg0,
            frame_len: self.jpeg.len(),
        })
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let jpeg = Arc::clone(&self.jpeg);
        self.thread = Some(thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(10));
                let Some(mut buffer) = sink.buffer(jpeg.len()) else {
                    sink.dropped();
                    continue;
                };
                buffer.as_mut_slice().copy_from_slice(&jpeg);
                let _ = sink.deliver(buffer, &[], None);
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
