//! Lifecycle Controller
//!
//! `Idle → Opening → Streaming ⇄ Paused → Stopping → Idle`, plus `Error`
//! when the capture side reports a fatal fault. Open/close transitions are
//! serialized by one mutex; the frame path never takes it, and host messages
//! are only sent once it is released.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use tracing::{debug, error, info, instrument, warn};

use crate::bridge::BridgeSurface;
use crate::capture::{
    CameraDescriptor, CameraDriver, Frame, FramePool, FrameSource, NegotiatedFormat, SourceEvent,
    StreamRequest,
};
use crate::convert::{ConvertedImage, FormatConverter};
use crate::error::{BridgeError, Result};
use crate::host::{
    HostEvent, HostMessenger, NullMessenger, PermissionProvider, PermissionStatus,
    StaticPermission,
};
use crate::stats::{ConvertTimer, PipelineStats, StatsSnapshot};
use crate::texture::{CpuTextureBackend, SlotReader, SlotWriter, TextureBackend, TextureSlots};
use crate::{utils, CameraSelector, CaptureConfig, Config, Resolution, CONFIG};

/// Floor for joining the capture thread once the drain budget is spent.
const MIN_JOIN_BUDGET: Duration = Duration::from_millis(50);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle = 0,
    Opening = 1,
    Streaming = 2,
    Paused = 3,
    Stopping = 4,
    Error = 5,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::Opening,
            2 => StreamState::Streaming,
            3 => StreamState::Paused,
            4 => StreamState::Stopping,
            5 => StreamState::Error,
            _ => StreamState::Idle,
        }
    }

    /// States a capture fault can move to `Error`.
    fn is_live(self) -> bool {
        matches!(
            self,
            StreamState::Opening | StreamState::Streaming | StreamState::Paused
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Opening => "opening",
            StreamState::Streaming => "streaming",
            StreamState::Paused => "paused",
            StreamState::Stopping => "stopping",
            StreamState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One open camera-to-texture session.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    pub id: u64,
    pub camera: CameraDescriptor,
    pub format: NegotiatedFormat,
    /// Size of the upright frames the host receives.
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub camera: CameraSelector,
    pub resolution: Resolution,
}

impl StartRequest {
    pub fn new(camera: CameraSelector, resolution: Resolution) -> Self {
        Self { camera, resolution }
    }
}

impl From<&CaptureConfig> for StartRequest {
    fn from(config: &CaptureConfig) -> Self {
        Self::new(config.camera.clone(), config.resolution)
    }
}

/// Outcome of [`LifecycleController::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TeardownReport {
    /// Session that was stopped, if any was live.
    pub session: Option<u64>,
    /// The frame callback did not drain in time and resources were
    /// force-released.
    pub forced: bool,
}

/// Admission control for the frame callback.
///
/// `stop()` closes the gate first, then waits for callbacks already inside
/// to leave. Entry and close both use `SeqCst` so a callback either sees the
/// gate closed or is counted by the drain.
struct CallbackGate {
    active: AtomicBool,
    closed: AtomicBool,
    in_flight: AtomicUsize,
}

struct GateEntry<'a>(&'a CallbackGate);

impl Drop for GateEntry<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CallbackGate {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn enter(&self) -> Option<GateEntry<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let entry = GateEntry(self);
        if self.closed.load(Ordering::SeqCst) || !self.active.load(Ordering::SeqCst) {
            return None;
        }
        Some(entry)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Waits for in-flight callbacks to leave. False on timeout.
    fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            if backoff.is_completed() {
                thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
        true
    }
}

/// Moves a live session to `Error` from the thread that hit the fault and
/// tells the host right away. Never touches the control mutex, so a host
/// that only pulls textures still hears about a lost camera.
struct FaultReporter {
    session: u64,
    state: Arc<AtomicU8>,
    gate: Arc<CallbackGate>,
    messenger: Arc<dyn HostMessenger>,
    /// Set by `stop()`; a detached driver thread must not fail the next
    /// session.
    retired: AtomicBool,
}

impl FaultReporter {
    fn new(
        session: u64,
        state: Arc<AtomicU8>,
        gate: Arc<CallbackGate>,
        messenger: Arc<dyn HostMessenger>,
    ) -> Self {
        Self {
            session,
            state,
            gate,
            messenger,
            retired: AtomicBool::new(false),
        }
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Returns true if this call moved the session to `Error`. Later faults,
    /// and faults racing a `stop()`, are only logged.
    fn raise(&self, event: &SourceEvent) -> bool {
        let reason = match event {
            SourceEvent::Disconnected(reason) => {
                BridgeError::DeviceUnavailable(reason.clone()).to_string()
            }
            SourceEvent::Fatal(e) => e.to_string(),
        };
        let retired = self.retired.load(Ordering::SeqCst);
        let moved = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                let live = !retired && StreamState::from_u8(v).is_live();
                live.then_some(StreamState::Error as u8)
            });
        let previous = match moved {
            Ok(previous) => StreamState::from_u8(previous),
            Err(current) => {
                debug!(
                    "Session {} fault while {}: {reason}",
                    self.session,
                    StreamState::from_u8(current)
                );
                return false;
            }
        };

        error!("Session {} failed: {reason}", self.session);
        debug!("{} -> {}", previous, StreamState::Error);
        self.gate.close();
        self.messenger.send(HostEvent::Error(reason));
        true
    }
}

/// Runs on the capture thread for every frame: convert, upload, publish.
struct FramePipeline {
    gate: Arc<CallbackGate>,
    converter: FormatConverter,
    writer: SlotWriter,
    image: ConvertedImage,
    timer: ConvertTimer,
    stats: Arc<PipelineStats>,
    events: flume::Sender<SourceEvent>,
    faults: Arc<FaultReporter>,
    budget: Duration,
    expected: u64,
    over_budget: u64,
}

impl FramePipeline {
    fn on_frame(&mut self, frame: Frame) {
        let Some(entry) = self.gate.enter() else {
            self.stats.record_skipped();
            return;
        };

        let sequence = frame.sequence();
        if sequence < self.expected {
            debug!(sequence, expected = self.expected, "stale frame ignored");
            return;
        }
        if sequence > self.expected {
            let gap = BridgeError::FrameDropped {
                expected: self.expected,
                got: sequence,
            };
            debug!("{gap}");
            self.stats.record_gap(sequence - self.expected);
        }
        self.expected = sequence + 1;

        let started = Instant::now();
        if let Err(e) = self.converter.convert_into(&frame, &mut self.image) {
            if matches!(e, BridgeError::InvalidFrame(_)) {
                warn!(sequence, "Dropping frame: {e}");
                self.stats.record_dropped(1);
                return;
            }
            error!(sequence, "Conversion failed: {e}");
            drop(frame);
            // leave the gate first: the host may stop the session from its
            // message callback, on this thread
            drop(entry);
            let event = SourceEvent::Fatal(e);
            self.faults.raise(&event);
            let _ = self.events.send(event);
            return;
        }
        // the raw buffer goes back to the pool before the upload
        drop(frame);

        let elapsed = started.elapsed();
        self.timer.record(elapsed, &self.stats);
        if elapsed > self.budget {
            self.stats.record_over_budget();
            self.over_budget += 1;
            if self.over_budget % 100 == 1 {
                warn!(
                    "Conversion took {:?}, over the {:?} frame budget ({} times so far)",
                    elapsed, self.budget, self.over_budget
                );
            }
        }

        let index = self.writer.acquire_write_slot();
        if let Err(e) = self.writer.upload(index, &self.image) {
            debug!(sequence, "Upload skipped: {e}");
            self.writer.abandon();
            return;
        }
        match self.writer.publish(index, sequence) {
            Ok(()) => self.stats.record_published(),
            Err(e) => debug!(sequence, "Publish skipped: {e}"),
        }
    }
}

/// What a successful `launch` hands back to the session.
struct Launched {
    format: NegotiatedFormat,
    width: u32,
    height: u32,
    gate: Arc<CallbackGate>,
    reader: Arc<SlotReader>,
    faults: Arc<FaultReporter>,
}

struct ActiveSession {
    session: StreamSession,
    source: FrameSource,
    gate: Arc<CallbackGate>,
    reader: Arc<SlotReader>,
    faults: Arc<FaultReporter>,
    events: flume::Receiver<SourceEvent>,
}

struct Control {
    /// The driver while no session holds it.
    driver: Option<Box<dyn CameraDriver>>,
    active: Option<ActiveSession>,
    pending_start: Option<StartRequest>,
    /// Pool of the last stopped session; a detached callback may still
    /// return buffers to it.
    retired_pool: Option<Arc<FramePool>>,
}

/// Host-facing work decided under the control lock and carried out after
/// it is released, so a host callback may call straight back in.
#[derive(Default)]
struct Outbox {
    events: Vec<HostEvent>,
    request_permission: bool,
}

impl Outbox {
    fn push(&mut self, event: HostEvent) {
        self.events.push(event);
    }
}

/// Orchestrates the camera session in response to host lifecycle and
/// permission events. Every exit path releases the camera and the textures.
pub struct LifecycleController {
    config: Config,
    backend: Arc<dyn TextureBackend>,
    permission: Arc<dyn PermissionProvider>,
    messenger: Arc<dyn HostMessenger>,
    stats: Arc<PipelineStats>,
    bridge: Arc<BridgeSurface>,
    state: Arc<AtomicU8>,
    next_session: AtomicU64,
    control: Mutex<Control>,
}

pub struct ControllerBuilder {
    driver: Box<dyn CameraDriver>,
    config: Option<Config>,
    backend: Option<Arc<dyn TextureBackend>>,
    permission: Option<Arc<dyn PermissionProvider>>,
    messenger: Option<Arc<dyn HostMessenger>>,
}

impl ControllerBuilder {
    /// Defaults to a snapshot of the global [`CONFIG`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Defaults to [`CpuTextureBackend`].
    pub fn backend(mut self, backend: Arc<dyn TextureBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Defaults to an always-granted permission.
    pub fn permission(mut self, permission: Arc<dyn PermissionProvider>) -> Self {
        self.permission = Some(permission);
        self
    }

    pub fn messenger(mut self, messenger: Arc<dyn HostMessenger>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    pub fn build(self) -> Result<LifecycleController> {
        let config = self
            .config
            .unwrap_or_else(|| Config::clone(&CONFIG.load_full()));
        config.validate()?;

        let stats = Arc::new(PipelineStats::new());
        Ok(LifecycleController {
            config,
            backend: self
                .backend
                .unwrap_or_else(|| Arc::new(CpuTextureBackend::new())),
            permission: self
                .permission
                .unwrap_or_else(|| Arc::new(StaticPermission::granted())),
            messenger: self.messenger.unwrap_or_else(|| Arc::new(NullMessenger)),
            bridge: Arc::new(BridgeSurface::new(Arc::clone(&stats))),
            stats,
            state: Arc::new(AtomicU8::new(StreamState::Idle as u8)),
            next_session: AtomicU64::new(0),
            control: Mutex::new(Control {
                driver: Some(self.driver),
                active: None,
                pending_start: None,
                retired_pool: None,
            }),
        })
    }
}

impl LifecycleController {
    pub fn builder(driver: Box<dyn CameraDriver>) -> ControllerBuilder {
        ControllerBuilder {
            driver,
            config: None,
            backend: None,
            permission: None,
            messenger: None,
        }
    }

    /// Opens the selected camera and starts streaming into fresh texture slots.
    ///
    /// Fails with `PermissionDenied` without touching the camera unless the
    /// permission is granted; an undetermined permission is requested and the
    /// start retried from [`on_permission_result`](Self::on_permission_result).
    /// Any failure leaves the controller `Idle`.
    #[instrument(skip(self))]
    pub fn start(&self, request: StartRequest) -> Result<StreamSession> {
        self.start_with(request, false)
    }

    /// Starts with the capture settings from the controller's config.
    pub fn start_default(&self) -> Result<StreamSession> {
        self.start(StartRequest::from(&self.config.capture))
    }

    fn start_with(&self, request: StartRequest, granted: bool) -> Result<StreamSession> {
        let mut outbox = Outbox::default();
        let result = self.start_locked(&mut self.lock(), request, granted, &mut outbox);
        self.flush(outbox);
        result
    }

    fn start_locked(
        &self,
        control: &mut Control,
        request: StartRequest,
        granted: bool,
        outbox: &mut Outbox,
    ) -> Result<StreamSession> {
        let state = self.load_state();
        if state != StreamState::Idle {
            return Err(BridgeError::InvalidState { op: "start", state });
        }

        if !granted {
            match self.permission.status() {
                PermissionStatus::Granted => {}
                PermissionStatus::Denied => {
                    info!("Camera permission denied");
                    outbox.push(HostEvent::PermissionDenied);
                    return Err(BridgeError::PermissionDenied);
                }
                PermissionStatus::Undetermined => {
                    info!("Camera permission undetermined, requesting it");
                    control.pending_start = Some(request);
                    outbox.request_permission = true;
                    return Err(BridgeError::PermissionDenied);
                }
            }
        }
        control.pending_start = None;

        self.set_state(StreamState::Opening);
        let session = match self.open_session(control, &request) {
            Ok(session) => session,
            Err(e) => {
                self.set_state(StreamState::Idle);
                warn!("Start failed: {e}");
                outbox.push(HostEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        if !self.advance(StreamState::Opening, StreamState::Streaming) {
            // the fault was already reported; the session waits for stop()
            warn!("Session {} failed while opening", session.id);
            return Ok(session);
        }
        info!(
            "Session {} streaming {}x{} from {}",
            session.id, session.width, session.height, session.camera.id
        );
        outbox.push(HostEvent::Started {
            session: session.id,
            width: session.width,
            height: session.height,
        });
        Ok(session)
    }

    fn open_session(
        &self,
        control: &mut Control,
        request: &StartRequest,
    ) -> Result<StreamSession> {
        let driver = control.driver.take().ok_or_else(|| {
            BridgeError::DeviceUnavailable("camera driver is held by a session".into())
        })?;
        let camera = match utils::select_camera(&request.camera, &driver.enumerate()) {
            Ok(camera) => camera,
            Err(e) => {
                control.driver = Some(driver);
                return Err(e);
            }
        };

        let capture = &self.config.capture;
        let mut source = FrameSource::new(driver, capture.pool_size, Arc::clone(&self.stats))
            .with_pinned_core(capture.pin_core);
        let stream_request = StreamRequest {
            resolution: request.resolution,
            fps: capture.fps,
            format: capture.format,
        };
        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;

        match self.launch(id, &mut source, &camera, &stream_request) {
            Ok(launched) => {
                let session = StreamSession {
                    id,
                    camera,
                    format: launched.format,
                    width: launched.width,
                    height: launched.height,
                };
                self.bridge
                    .enable(Arc::clone(&launched.reader), launched.width, launched.height);
                control.retired_pool = None;
                control.active = Some(ActiveSession {
                    session: session.clone(),
                    events: source.events(),
                    source,
                    gate: launched.gate,
                    reader: launched.reader,
                    faults: launched.faults,
                });
                Ok(session)
            }
            Err(e) => {
                control.driver = Some(source.into_driver());
                Err(e)
            }
        }
    }

    fn launch(
        &self,
        session: u64,
        source: &mut FrameSource,
        camera: &CameraDescriptor,
        request: &StreamRequest,
    ) -> Result<Launched> {
        let format = source.open(camera, request)?;
        let convert = &self.config.convert;
        let converter = FormatConverter::from_config(convert, format.orientation);
        let (width, height) = converter.output_size(format.width, format.height);

        let (writer, reader) = TextureSlots::allocate(
            Arc::clone(&self.backend),
            self.config.texture.slot_count,
            width,
            height,
        )?;
        let reader = Arc::new(reader);
        let gate = Arc::new(CallbackGate::new());

        let faults = Arc::new(FaultReporter::new(
            session,
            Arc::clone(&self.state),
            Arc::clone(&gate),
            Arc::clone(&self.messenger),
        ));
        let hook = Arc::clone(&faults);
        source.set_fault_hook(Arc::new(move |event: &SourceEvent| {
            hook.raise(event);
        }));

        let mut pipeline = FramePipeline {
            gate: Arc::clone(&gate),
            converter,
            writer,
            image: ConvertedImage::default(),
            timer: ConvertTimer::new(),
            stats: Arc::clone(&self.stats),
            events: source.event_sender(),
            faults: Arc::clone(&faults),
            budget: Duration::from_millis(convert.frame_budget_ms),
            expected: 1,
            over_budget: 0,
        };
        if let Err(e) = source.start_streaming(move |frame| pipeline.on_frame(frame)) {
            reader.release_textures();
            return Err(e);
        }
        Ok(Launched {
            format,
            width,
            height,
            gate,
            reader,
            faults,
        })
    }

    /// Suspends frame delivery while keeping the camera open.
    pub fn pause(&self) -> Result<()> {
        let result = {
            let control = self.lock();
            match (self.load_state(), control.active.as_ref()) {
                (StreamState::Paused, _) => Ok(false),
                (StreamState::Streaming, Some(active)) => {
                    if self.advance(StreamState::Streaming, StreamState::Paused) {
                        active.gate.set_active(false);
                        info!("Session {} paused", active.session.id);
                        Ok(true)
                    } else {
                        let state = self.load_state();
                        Err(BridgeError::InvalidState { op: "pause", state })
                    }
                }
                (state, _) => Err(BridgeError::InvalidState { op: "pause", state }),
            }
        };
        if result? {
            self.messenger.send(HostEvent::Paused);
        }
        Ok(())
    }

    /// Resumes the paused session without reopening the camera.
    pub fn resume(&self) -> Result<()> {
        let result = {
            let control = self.lock();
            match (self.load_state(), control.active.as_ref()) {
                (StreamState::Streaming, _) => Ok(false),
                (StreamState::Paused, Some(active)) => {
                    if self.advance(StreamState::Paused, StreamState::Streaming) {
                        active.gate.set_active(true);
                        info!("Session {} resumed", active.session.id);
                        Ok(true)
                    } else {
                        let state = self.load_state();
                        Err(BridgeError::InvalidState { op: "resume", state })
                    }
                }
                (state, _) => Err(BridgeError::InvalidState { op: "resume", state }),
            }
        };
        if result? {
            self.messenger.send(HostEvent::Resumed);
        }
        Ok(())
    }

    /// Tears the session down from any state. Always succeeds and is
    /// idempotent.
    ///
    /// The frame callback is shut out first, then given the configured
    /// drain timeout to finish. Past that, the textures and the camera are
    /// released anyway and the teardown is reported as forced.
    #[instrument(skip(self))]
    pub fn stop(&self) -> TeardownReport {
        let mut outbox = Outbox::default();
        let report = self.stop_locked(&mut self.lock(), &mut outbox);
        self.flush(outbox);
        report
    }

    fn stop_locked(&self, control: &mut Control, outbox: &mut Outbox) -> TeardownReport {
        control.pending_start = None;
        let Some(active) = control.active.take() else {
            self.set_state(StreamState::Idle);
            return TeardownReport::default();
        };

        let ActiveSession {
            session,
            mut source,
            gate,
            reader,
            faults,
            events,
        } = active;
        faults.retire();
        self.set_state(StreamState::Stopping);
        info!("Stopping session {}", session.id);

        let timeout = Duration::from_millis(self.config.lifecycle.drain_timeout_ms);
        let started = Instant::now();
        gate.close();
        self.bridge.disable();

        let forced = !gate.drain(timeout);
        if forced {
            let e = BridgeError::ForcedTeardownTimeout(timeout);
            warn!("Session {}: {e}", session.id);
            self.stats.record_forced_teardown();
            outbox.push(HostEvent::Warning(e.to_string()));
        }

        control.retired_pool = source.pool();
        let budget = timeout
            .saturating_sub(started.elapsed())
            .max(MIN_JOIN_BUDGET);
        if !source.stop(budget) {
            debug!("Capture thread detached, its callback finishes against released slots");
        }
        reader.release_textures();
        // late events belong to the session that just ended
        events.drain().for_each(drop);
        control.driver = Some(source.into_driver());

        self.set_state(StreamState::Idle);
        info!("Session {} stopped in {:?}", session.id, started.elapsed());
        outbox.push(HostEvent::Stopped {
            session: session.id,
            forced,
        });
        TeardownReport {
            session: Some(session.id),
            forced,
        }
    }

    /// Forwards the host's answer to a permission prompt. A grant retries
    /// the start that was waiting for it.
    pub fn on_permission_result(&self, granted: bool) -> Result<Option<StreamSession>> {
        let pending = self.lock().pending_start.take();
        if granted {
            info!("Camera permission granted");
            return match pending {
                Some(request) => self.start_with(request, true).map(Some),
                None => Ok(None),
            };
        }

        info!("Camera permission denied by the user");
        self.messenger.send(HostEvent::PermissionDenied);
        match pending {
            Some(_) => Err(BridgeError::PermissionDenied),
            None => Ok(None),
        }
    }

    /// Current state. Never blocks; capture faults are applied as they
    /// happen.
    pub fn state(&self) -> StreamState {
        self.load_state()
    }

    pub fn session(&self) -> Option<StreamSession> {
        self.lock()
            .active
            .as_ref()
            .map(|active| active.session.clone())
    }

    pub fn bridge(&self) -> Arc<BridgeSurface> {
        Arc::clone(&self.bridge)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn TextureBackend> {
        &self.backend
    }

    /// Raw capture buffers held outside the pool by the live session, or by
    /// the last stopped one while its detached callback finishes.
    pub fn outstanding_buffers(&self) -> usize {
        let control = self.lock();
        match (control.active.as_ref(), control.retired_pool.as_ref()) {
            (Some(active), _) => active.source.outstanding_buffers(),
            (None, Some(pool)) => pool.outstanding(),
            (None, None) => 0,
        }
    }

    fn flush(&self, outbox: Outbox) {
        if outbox.request_permission {
            self.permission.request();
        }
        for event in outbox.events {
            self.messenger.send(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        // teardown must complete even after a panic elsewhere
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!("{} -> {}", StreamState::from_u8(previous), state);
        }
    }

    /// Moves `from` to `to` unless a fault got there first.
    fn advance(&self, from: StreamState, to: StreamState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            debug!("{from} -> {to}");
        }
        moved
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{SyntheticConfig, SyntheticControl, SyntheticDriver};
    use crate::capture::PixelFormat;

    fn config() -> Config {
        let mut config = Config::default();
        config.capture.resolution = Resolution::new(32, 24);
        config.capture.fps = 120;
        config.capture.format = Some(PixelFormat::Nv21);
        config
    }

    fn controller() -> (LifecycleController, SyntheticControl) {
        let driver = SyntheticDriver::new(SyntheticConfig::default());
        let control = driver.control();
        let controller = LifecycleController::builder(Box::new(driver))
            .config(config())
            .build()
            .unwrap();
        (controller, control)
    }

    #[test]
    fn gate_counts_entries_and_refuses_when_closed() {
        let gate = CallbackGate::new();
        {
            let _entry = gate.enter().unwrap();
            assert!(!gate.drain(Duration::from_millis(5)));
        }
        assert!(gate.drain(Duration::from_millis(5)));

        gate.set_active(false);
        assert!(gate.enter().is_none());
        gate.set_active(true);
        gate.close();
        assert!(gate.enter().is_none());
        assert_eq!(gate.in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fault_reporter_fails_a_live_session_once() {
        let state = Arc::new(AtomicU8::new(StreamState::Streaming as u8));
        let gate = Arc::new(CallbackGate::new());
        let (messenger, messages) = crate::host::ChannelMessenger::new();
        let faults =
            FaultReporter::new(7, Arc::clone(&state), Arc::clone(&gate), Arc::new(messenger));

        let lost = SourceEvent::Disconnected("unplugged".into());
        assert!(faults.raise(&lost));
        assert!(!faults.raise(&lost));
        assert_eq!(StreamState::from_u8(state.load(Ordering::SeqCst)), StreamState::Error);
        assert!(gate.enter().is_none());
        let sent: Vec<_> = messages.try_iter().collect();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].to_message().starts_with("ERROR:"));

        // a stopped session's driver thread cannot fail its successor
        state.store(StreamState::Streaming as u8, Ordering::SeqCst);
        faults.retire();
        assert!(!faults.raise(&lost));
        assert_eq!(StreamState::from_u8(state.load(Ordering::SeqCst)), StreamState::Streaming);
    }

    #[test]
    fn start_rotates_output_to_sensor_orientation() {
        let (controller, camera) = controller();
        let session = controller.start_default().unwrap();
        // back camera reports 90°, so 32x24 arrives as 24x32
        assert_eq!((session.width, session.height), (24, 32));
        assert_eq!(controller.state(), StreamState::Streaming);
        assert!(camera.is_open());
        assert_eq!(controller.bridge().stream_dimensions(), (24, 32));

        let report = controller.stop();
        assert_eq!(report.session, Some(session.id));
        assert!(!report.forced);
        assert!(!camera.is_open());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let (controller, _) = controller();
        assert_eq!(
            controller.pause(),
            Err(BridgeError::InvalidState {
                op: "pause",
                state: StreamState::Idle
            })
        );
        controller.start_default().unwrap();
        assert!(matches!(
            controller.start_default(),
            Err(BridgeError::InvalidState { op: "start", .. })
        ));
        controller.pause().unwrap();
        controller.pause().unwrap();
        controller.resume().unwrap();
        controller.resume().unwrap();
        controller.stop();
        assert!(controller.resume().is_err());
    }

    #[test]
    fn unknown_camera_keeps_driver_for_next_start() {
        let (controller, camera) = controller();
        let missing = StartRequest::new(CameraSelector::Id("nope".into()), Resolution::VGA);
        assert!(matches!(
            controller.start(missing),
            Err(BridgeError::DeviceUnavailable(_))
        ));
        assert_eq!(controller.state(), StreamState::Idle);
        controller.start_default().unwrap();
        assert_eq!(camera.open_count(), 1);
    }

    #[test]
    fn stop_without_session_is_a_no_op() {
        let (controller, _) = controller();
        assert_eq!(controller.stop(), TeardownReport::default());
        assert_eq!(controller.state(), StreamState::Idle);
    }

    #[test]
    fn dropping_the_controller_closes_the_camera() {
        let (controller, camera) = controller();
        controller.start_default().unwrap();
        drop(controller);
        assert!(!camera.is_open());
    }
}
