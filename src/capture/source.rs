//! Frame Source: owns the camera open/close lifecycle and the capture thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::driver::{
    CameraDescriptor, CameraDriver, FaultHook, FrameSink, NegotiatedFormat, SourceEvent,
    StreamRequest,
};
use super::frame::Frame;
use super::pool::{FramePool, InFlightQueue};
use crate::error::{BridgeError, Result};
use crate::stats::PipelineStats;

const WAKE_INTERVAL: Duration = Duration::from_millis(20);

/// Joins `handle` if it finishes within `timeout`, else leaves it detached.
/// Returns false when the thread was detached.
pub(crate) fn join_bounded(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    if !handle.is_finished() {
        let name = handle.thread().name().unwrap_or("unnamed").to_owned();
        warn!("Thread {name} still busy after {timeout:?}, detaching it");
        return false;
    }
    if handle.join().is_err() {
        warn!("Joined thread had panicked");
    }
    true
}

/// Wraps a [`CameraDriver`] and delivers its frames on a dedicated capture
/// thread.
pub struct FrameSource {
    driver: Box<dyn CameraDriver>,
    camera: Option<CameraDescriptor>,
    format: Option<NegotiatedFormat>,
    pool_size: usize,
    pin_core: Option<usize>,
    pool: Option<Arc<FramePool>>,
    queue: Option<Arc<InFlightQueue>>,
    running: Arc<AtomicBool>,
    capture_thread: Option<JoinHandle<()>>,
    events_tx: flume::Sender<SourceEvent>,
    events_rx: flume::Receiver<SourceEvent>,
    on_fault: Option<FaultHook>,
    stats: Arc<PipelineStats>,
}

impl FrameSource {
    pub fn new(driver: Box<dyn CameraDriver>, pool_size: usize, stats: Arc<PipelineStats>) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            driver,
            camera: None,
            format: None,
            pool_size,
            pin_core: None,
            pool: None,
            queue: None,
            running: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
            events_tx,
            events_rx,
            on_fault: None,
            stats,
        }
    }

    /// Pin the capture thread to a core id when streaming starts.
    pub fn with_pinned_core(mut self, core: Option<usize>) -> Self {
        self.pin_core = core;
        self
    }

    /// Runs `hook` on the driver's thread for every fault it reports, ahead
    /// of the event channel. Takes effect at the next `start_streaming`.
    pub fn set_fault_hook(&mut self, hook: FaultHook) {
        self.on_fault = Some(hook);
    }

    /// Opens `camera` and negotiates the stream. Pre-allocates the buffer pool.
    #[instrument(skip_all, fields(camera = %camera.id))]
    pub fn open(
        &mut self,
        camera: &CameraDescriptor,
        request: &StreamRequest,
    ) -> Result<NegotiatedFormat> {
        if self.driver.is_open() {
            return Err(BridgeError::DeviceUnavailable(format!(
                "{} is already open",
                camera.id
            )));
        }

        let format = self.driver.open(camera, request)?;
        info!(
            "Opened {} ({}): {}x{} {} @ {}fps, sensor {}°",
            camera.name,
            camera.id,
            format.width,
            format.height,
            format.format,
            format.fps,
            format.orientation.degrees()
        );

        self.pool = Some(FramePool::new(self.pool_size, format.frame_len));
        self.queue = Some(Arc::new(InFlightQueue::new(self.pool_size)));
        self.camera = Some(camera.clone());
        self.format = Some(format);
        Ok(format)
    }

    /// Starts the driver and the capture thread. `on_frame` runs on the
    /// capture thread and receives ownership of each frame.
    pub fn start_streaming<F>(&mut self, mut on_frame: F) -> Result<()>
    where
        F: FnMut(Frame) + Send + 'static,
    {
        let (Some(format), Some(pool), Some(queue)) =
            (self.format, self.pool.clone(), self.queue.clone())
        else {
            return Err(BridgeError::DeviceUnavailable("camera is not open".into()));
        };
        if self.capture_thread.is_some() {
            return Err(BridgeError::DeviceUnavailable("already streaming".into()));
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let thread_queue = Arc::clone(&queue);
        let pin_core = self.pin_core;

        let handle = thread::Builder::new()
            .name("camtex-capture".into())
            .spawn(move || {
                if let Some(core) = pin_core {
                    pin_current_thread(core);
                }
                debug!("Capture thread running");
                while running.load(Ordering::Acquire) {
                    thread_queue.wait(WAKE_INTERVAL);
                    while let Some(frame) = thread_queue.pop() {
                        if !running.load(Ordering::Acquire) {
                            break;
                        }
                        on_frame(frame);
                    }
                }
                thread_queue.clear();
                debug!("Capture thread exiting");
            })
            .map_err(|e| BridgeError::DeviceUnavailable(format!("spawn capture thread: {e}")))?;
        self.capture_thread = Some(handle);

        let sink = FrameSink::new(
            pool,
            queue,
            self.events_tx.clone(),
            Arc::clone(&self.stats),
            format,
            self.on_fault.clone(),
        );
        if let Err(e) = self.driver.start(sink) {
            self.stop(WAKE_INTERVAL * 5);
            return Err(e);
        }
        info!("Capture stream started with {} buffers", self.pool_size);
        Ok(())
    }

    /// Stops the driver, drains the queue and joins the capture thread.
    ///
    /// Idempotent. Returns false if the capture thread did not exit within
    /// `timeout` and was detached.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::Release);
        self.driver.stop();

        let mut clean = true;
        if let Some(queue) = &self.queue {
            queue.clear();
            queue.wake();
        }
        if let Some(handle) = self.capture_thread.take() {
            clean = join_bounded(handle, timeout);
        }

        if self.camera.take().is_some() {
            info!("Capture stream stopped");
        }
        self.format = None;
        self.pool = None;
        self.queue = None;
        self.on_fault = None;
        clean
    }

    pub fn format(&self) -> Option<&NegotiatedFormat> {
        self.format.as_ref()
    }

    pub fn camera(&self) -> Option<&CameraDescriptor> {
        self.camera.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.capture_thread.is_some()
    }

    pub fn events(&self) -> flume::Receiver<SourceEvent> {
        self.events_rx.clone()
    }

    pub fn event_sender(&self) -> flume::Sender<SourceEvent> {
        self.events_tx.clone()
    }

    /// Raw buffers not yet returned to the pool.
    pub fn outstanding_buffers(&self) -> usize {
        self.pool.as_ref().map_or(0, |pool| pool.outstanding())
    }

    /// The open stream's buffer pool. Buffers still out when the stream
    /// stops keep returning to it.
    pub fn pool(&self) -> Option<Arc<FramePool>> {
        self.pool.clone()
    }

    pub fn driver(&self) -> &dyn CameraDriver {
        self.driver.as_ref()
    }

    /// Closes the device and gives the driver back for the next session.
    pub fn into_driver(mut self) -> Box<dyn CameraDriver> {
        self.stop(WAKE_INTERVAL * 5);
        let placeholder: Box<dyn CameraDriver> = Box::new(ClosedDriver);
        std::mem::replace(&mut self.driver, placeholder)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop(WAKE_INTERVAL * 5);
    }
}

fn pin_current_thread(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if pinned {
        debug!(core, "Pinned capture thread");
    } else {
        warn!(core, "Could not pin capture thread");
    }
}

/// Stand-in left behind once a source hands its driver back.
struct ClosedDriver;

impl CameraDriver for ClosedDriver {
    fn enumerate(&self) -> Vec<CameraDescriptor> {
        Vec::new()
    }

    fn open(
        &mut self,
        camera: &CameraDescriptor,
        _: &StreamRequest,
    ) -> Result<NegotiatedFormat> {
        Err(BridgeError::DeviceUnavailable(format!("{} has no driver", camera.id)))
    }

    fn start(&mut self, _: FrameSink) -> Result<()> {
        Err(BridgeError::DeviceUnavailable("no driver".into()))
    }

    fn stop(&mut self) {}

    fn is_open(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{SyntheticConfig, SyntheticDriver};
    use crate::capture::PixelFormat;
    use crate::Resolution;
    use std::sync::atomic::AtomicU64;

    fn request() -> StreamRequest {
        StreamRequest {
            resolution: Resolution::new(64, 48),
            fps: 200,
            format: Some(PixelFormat::Nv12),
        }
    }

    #[test]
    fn streams_frames_on_capture_thread() {
        let driver = SyntheticDriver::new(SyntheticConfig::default());
        let camera = driver.enumerate()[0].clone();
        let stats = Arc::new(PipelineStats::new());
        let mut source = FrameSource::new(Box::new(driver), 3, stats);
        let format = source.open(&camera, &request()).unwrap();
        assert_eq!((format.width, format.height), (64, 48));

        let (tx, rx) = flume::unbounded();
        source
            .start_streaming(move |frame| {
                let name = thread::current().name().map(String::from);
                let _ = tx.send((frame.sequence(), name));
            })
            .unwrap();

        let (sequence, name) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(sequence >= 1);
        assert_eq!(name.as_deref(), Some("camtex-capture"));
        let pool = source.pool().unwrap();
        assert!(source.stop(Duration::from_secs(1)));
        assert_eq!(source.outstanding_buffers(), 0);
        assert!(source.pool().is_none());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn stop_is_idempotent_and_driver_is_reusable() {
        let driver = SyntheticDriver::new(SyntheticConfig::default());
        let control = driver.control();
        let camera = driver.enumerate()[0].clone();
        let stats = Arc::new(PipelineStats::new());
        let mut source = FrameSource::new(Box::new(driver), 2, Arc::clone(&stats));
        source.open(&camera, &request()).unwrap();
        source.start_streaming(|_| {}).unwrap();

        assert!(source.stop(Duration::from_secs(1)));
        assert!(source.stop(Duration::from_secs(1)));
        assert!(!control.is_open());

        let mut source = FrameSource::new(source.into_driver(), 2, stats);
        source.open(&camera, &request()).unwrap();
        assert_eq!(control.open_count(), 2);
    }

    #[test]
    fn retaining_frames_never_blocks_the_driver() {
        let driver = SyntheticDriver::new(SyntheticConfig::default());
        let camera = driver.enumerate()[0].clone();
        let stats = Arc::new(PipelineStats::new());
        let mut source = FrameSource::new(Box::new(driver), 2, Arc::clone(&stats));
        source.open(&camera, &request()).unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let mut kept = Vec::new();
        source
            .start_streaming(move |frame| {
                // hold every frame: the pool runs dry and the driver must
                // drop instead of waiting
                kept.push(frame.retain());
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.snapshot().frames_dropped == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(stats.snapshot().frames_dropped > 0);
        assert!(seen.load(Ordering::Relaxed) <= 2);
        assert!(source.stop(Duration::from_secs(1)));
    }

    #[test]
    fn disconnect_runs_the_fault_hook_before_the_channel() {
        let config = SyntheticConfig {
            disconnect_after: Some(2),
            ..SyntheticConfig::default()
        };
        let driver = SyntheticDriver::new(config);
        let camera = driver.enumerate()[0].clone();
        let mut source = FrameSource::new(Box::new(driver), 2, Arc::new(PipelineStats::new()));
        source.open(&camera, &request()).unwrap();

        let events = source.events();
        let (tx, rx) = flume::unbounded();
        source.set_fault_hook(Arc::new(move |event: &SourceEvent| {
            // the channel is still empty while the hook runs
            let _ = tx.send((event.clone(), events.len()));
        }));
        source.start_streaming(|_| {}).unwrap();

        let (event, queued) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, SourceEvent::Disconnected(_)));
        assert_eq!(queued, 0);
        let reported = source.events().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reported, event);
        assert!(source.stop(Duration::from_secs(1)));
    }

    #[test]
    fn join_bounded_detaches_a_stuck_thread() {
        let quick = thread::spawn(|| {});
        assert!(join_bounded(quick, Duration::from_secs(1)));

        let stuck = thread::spawn(|| thread::sleep(Duration::from_millis(400)));
        let started = Instant::now();
        assert!(!join_bounded(stuck, Duration::from_millis(20)));
        assert!(started.elapsed() < Duration::from_millis(300));
    }
}
