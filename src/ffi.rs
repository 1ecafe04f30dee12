//! Exported plugin ABI
//!
//! The engine's native-plugin loader calls these by name. Render-loop calls
//! are atomic loads on the installed bridge and never allocate. Every
//! function is a no-op returning zero while no controller is installed.

use std::ffi::{c_char, CString};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use once_cell::sync::Lazy;
use tracing::{info, warn};

use crate::bridge::BridgeSurface;
use crate::error::BridgeError;
use crate::host::{HostEvent, HostMessenger};
use crate::lifecycle::LifecycleController;
use crate::utils;

/// Receives NUL-terminated [`HostEvent`] messages. The pointer is only valid
/// for the duration of the call.
///
/// Called on whichever thread produced the event: the one that called into
/// `camtex_*`, or the capture thread for a lost camera. No plugin lock is
/// held during the call, so the callback may call any `camtex_*` function.
pub type MessageCallback = extern "C" fn(message: *const c_char);

static CONTROLLER: Lazy<ArcSwapOption<LifecycleController>> =
    Lazy::new(ArcSwapOption::empty);
static BRIDGE: Lazy<ArcSwapOption<BridgeSurface>> = Lazy::new(ArcSwapOption::empty);
static CALLBACK: Lazy<ArcSwapOption<MessageCallback>> = Lazy::new(ArcSwapOption::empty);

pub const OK: i32 = 0;
pub const ERR_NOT_INSTALLED: i32 = -1;
pub const ERR_PERMISSION_DENIED: i32 = -2;
pub const ERR_DEVICE_UNAVAILABLE: i32 = -3;
pub const ERR_FORMAT_UNSUPPORTED: i32 = -4;
pub const ERR_INVALID_STATE: i32 = -5;
pub const ERR_OTHER: i32 = -6;

fn error_code(err: &BridgeError) -> i32 {
    match err {
        BridgeError::PermissionDenied => ERR_PERMISSION_DENIED,
        BridgeError::DeviceUnavailable(_) => ERR_DEVICE_UNAVAILABLE,
        BridgeError::FormatUnsupported(_) => ERR_FORMAT_UNSUPPORTED,
        BridgeError::InvalidState { .. } => ERR_INVALID_STATE,
        _ => ERR_OTHER,
    }
}

/// Forwards host events to the callback registered with
/// [`camtex_set_message_callback`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CallbackMessenger;

impl HostMessenger for CallbackMessenger {
    fn send(&self, event: HostEvent) {
        let guard = CALLBACK.load();
        let Some(callback) = guard.as_ref() else {
            return;
        };
        match CString::new(event.to_message()) {
            Ok(message) => (**callback)(message.as_ptr()),
            Err(e) => warn!("Host message not sent: {e}"),
        }
    }
}

/// Makes `controller` the one the exported functions drive. A previously
/// installed controller is stopped.
pub fn install(controller: LifecycleController) -> Arc<LifecycleController> {
    let controller = Arc::new(controller);
    BRIDGE.store(Some(controller.bridge()));
    if let Some(previous) = CONTROLLER.swap(Some(Arc::clone(&controller))) {
        previous.stop();
    }
    controller
}

/// Stops and removes the installed controller.
pub fn uninstall() -> Option<Arc<LifecycleController>> {
    BRIDGE.store(None);
    let controller = CONTROLLER.swap(None)?;
    controller.stop();
    Some(controller)
}

pub fn installed() -> Option<Arc<LifecycleController>> {
    CONTROLLER.load_full()
}

/// Installs tracing and, unless one is already installed, a controller over
/// the platform camera with the global configuration.
#[no_mangle]
pub extern "C" fn camtex_init() -> i32 {
    utils::init_tracing();
    if CONTROLLER.load().is_some() {
        return OK;
    }
    match LifecycleController::builder(utils::default_driver())
        .messenger(Arc::new(CallbackMessenger))
        .build()
    {
        Ok(controller) => {
            install(controller);
            info!("camtex plugin initialized");
            OK
        }
        Err(e) => {
            warn!("camtex init failed: {e}");
            error_code(&e)
        }
    }
}

/// Registers, or clears with null, the host message callback.
#[no_mangle]
pub extern "C" fn camtex_set_message_callback(callback: Option<MessageCallback>) {
    CALLBACK.store(callback.map(Arc::new));
}

/// Starts streaming with the configured camera and resolution.
#[no_mangle]
pub extern "C" fn camtex_start() -> i32 {
    let Some(controller) = installed() else {
        return ERR_NOT_INSTALLED;
    };
    match controller.start_default() {
        Ok(_) => OK,
        Err(e) => error_code(&e),
    }
}

/// Texture handle for this host frame, 0 when there is none.
#[no_mangle]
pub extern "C" fn camtex_get_current_texture_handle() -> u64 {
    BRIDGE
        .load()
        .as_ref()
        .map_or(0, |bridge| bridge.get_current_texture_handle().raw())
}

#[no_mangle]
pub extern "C" fn camtex_notify_frame_rendered() {
    if let Some(bridge) = BRIDGE.load().as_ref() {
        bridge.notify_host_frame_rendered();
    }
}

#[no_mangle]
pub extern "C" fn camtex_stream_width() -> u32 {
    BRIDGE
        .load()
        .as_ref()
        .map_or(0, |bridge| bridge.stream_dimensions().0)
}

#[no_mangle]
pub extern "C" fn camtex_stream_height() -> u32 {
    BRIDGE
        .load()
        .as_ref()
        .map_or(0, |bridge| bridge.stream_dimensions().1)
}

#[no_mangle]
pub extern "C" fn camtex_last_sequence() -> u64 {
    BRIDGE
        .load()
        .as_ref()
        .map_or(0, |bridge| bridge.current_sequence())
}

/// The controller's [`StreamState`](crate::StreamState) as its numeric value
/// (`0` idle through `5` error), or `ERR_NOT_INSTALLED`. Cheap enough to poll
/// every host frame.
#[no_mangle]
pub extern "C" fn camtex_state() -> i32 {
    CONTROLLER
        .load()
        .as_ref()
        .map_or(ERR_NOT_INSTALLED, |controller| controller.state() as i32)
}

/// Stops the session and releases every texture handle. The controller
/// stays installed, so `camtex_start` may follow.
#[no_mangle]
pub extern "C" fn camtex_shutdown() {
    if let Some(controller) = installed() {
        controller.stop();
    }
}

#[no_mangle]
pub extern "C" fn camtex_on_pause() {
    if let Some(controller) = installed() {
        if let Err(e) = controller.pause() {
            info!("Host pause ignored: {e}");
        }
    }
}

#[no_mangle]
pub extern "C" fn camtex_on_resume() {
    if let Some(controller) = installed() {
        if let Err(e) = controller.resume() {
            info!("Host resume ignored: {e}");
        }
    }
}

#[no_mangle]
pub extern "C" fn camtex_on_permission_result(granted: bool) {
    if let Some(controller) = installed() {
        if let Err(e) = controller.on_permission_result(granted) {
            warn!("Start after permission result failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    use serial_test::serial;

    use super::*;
    use crate::capture::{SyntheticConfig, SyntheticControl, SyntheticDriver};
    use crate::host::{PermissionStatus, StaticPermission};
    use crate::{Config, PixelFormat, Resolution, StreamState};

    static MESSAGES: Mutex<Vec<String>> = Mutex::new(Vec::new());

    extern "C" fn record_message(message: *const c_char) {
        // SAFETY: the messenger passes a live NUL-terminated string
        let message = unsafe { CStr::from_ptr(message) };
        MESSAGES
            .lock()
            .unwrap()
            .push(message.to_string_lossy().into_owned());
    }

    fn controller(permission: Arc<StaticPermission>) -> LifecycleController {
        controller_with_camera(permission).0
    }

    fn controller_with_camera(
        permission: Arc<StaticPermission>,
    ) -> (LifecycleController, SyntheticControl) {
        let mut config = Config::default();
        config.capture.resolution = Resolution::new(16, 8);
        config.capture.fps = 200;
        config.capture.format = Some(PixelFormat::I420);
        let driver = SyntheticDriver::new(SyntheticConfig::default());
        let camera = driver.control();
        let controller = LifecycleController::builder(Box::new(driver))
            .config(config)
            .permission(permission)
            .messenger(Arc::new(CallbackMessenger))
            .build()
            .unwrap();
        (controller, camera)
    }

    fn wait_for_handle() -> u64 {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let handle = camtex_get_current_texture_handle();
            if handle != 0 || Instant::now() > deadline {
                return handle;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    #[serial]
    fn calls_without_controller_return_zero() {
        uninstall();
        assert_eq!(camtex_get_current_texture_handle(), 0);
        assert_eq!(camtex_stream_width(), 0);
        assert_eq!(camtex_last_sequence(), 0);
        assert_eq!(camtex_start(), ERR_NOT_INSTALLED);
        assert_eq!(camtex_state(), ERR_NOT_INSTALLED);
        camtex_notify_frame_rendered();
        camtex_on_pause();
        camtex_shutdown();
    }

    #[test]
    #[serial]
    fn init_installs_a_controller_once() {
        uninstall();
        assert_eq!(camtex_init(), OK);
        let first = installed().unwrap();
        assert_eq!(camtex_init(), OK);
        assert!(Arc::ptr_eq(&first, &installed().unwrap()));
        assert_eq!(first.state(), StreamState::Idle);
        assert_eq!(camtex_state(), StreamState::Idle as i32);
        uninstall();
    }

    #[test]
    #[serial]
    fn full_session_through_exports() {
        install(controller(Arc::new(StaticPermission::granted())));
        assert_eq!(camtex_start(), OK);
        assert_eq!(camtex_state(), StreamState::Streaming as i32);
        assert_eq!((camtex_stream_width(), camtex_stream_height()), (8, 16));

        assert_ne!(wait_for_handle(), 0);
        camtex_notify_frame_rendered();
        assert!(camtex_last_sequence() >= 1);

        camtex_on_pause();
        assert_eq!(camtex_state(), StreamState::Paused as i32);
        camtex_on_resume();
        assert_eq!(camtex_start(), ERR_INVALID_STATE);

        camtex_shutdown();
        assert_eq!(camtex_state(), StreamState::Idle as i32);
        assert_eq!(camtex_get_current_texture_handle(), 0);
        assert_eq!(installed().unwrap().backend().live_handles(), 0);
        uninstall();
    }

    #[test]
    #[serial]
    fn permission_grant_starts_pending_session() {
        MESSAGES.lock().unwrap().clear();
        camtex_set_message_callback(Some(record_message));
        let permission = Arc::new(StaticPermission::new(PermissionStatus::Undetermined));
        install(controller(Arc::clone(&permission)));

        assert_eq!(camtex_start(), ERR_PERMISSION_DENIED);
        assert_eq!(permission.request_count(), 1);
        permission.set(PermissionStatus::Granted);
        camtex_on_permission_result(true);
        assert_ne!(wait_for_handle(), 0);

        uninstall();
        camtex_set_message_callback(None);
        let messages = MESSAGES.lock().unwrap();
        assert!(messages[0].starts_with("STREAM_STARTED:"));
        assert!(messages.last().unwrap().starts_with("STREAM_STOPPED:"));
    }

    #[test]
    #[serial]
    fn reinstall_stops_previous_controller() {
        let first = install(controller(Arc::new(StaticPermission::granted())));
        assert_eq!(camtex_start(), OK);
        install(controller(Arc::new(StaticPermission::granted())));
        assert_eq!(first.state(), StreamState::Idle);
        assert_eq!(first.backend().live_handles(), 0);
        uninstall();
    }

    #[test]
    #[serial]
    fn lost_camera_reaches_a_host_that_only_renders() {
        MESSAGES.lock().unwrap().clear();
        camtex_set_message_callback(Some(record_message));
        let (controller, camera) = controller_with_camera(Arc::new(StaticPermission::granted()));
        install(controller);
        assert_eq!(camtex_start(), OK);
        assert_ne!(wait_for_handle(), 0);

        camera.disconnect();
        // the host keeps rendering and never calls a control function
        let deadline = Instant::now() + Duration::from_secs(2);
        let failed = loop {
            camtex_get_current_texture_handle();
            camtex_notify_frame_rendered();
            let failed = MESSAGES
                .lock()
                .unwrap()
                .iter()
                .any(|message| message.starts_with("ERROR:"));
            if failed || Instant::now() > deadline {
                break failed;
            }
            thread::sleep(Duration::from_millis(2));
        };
        assert!(failed);
        assert_eq!(camtex_state(), StreamState::Error as i32);
        assert_eq!(camtex_start(), ERR_INVALID_STATE);

        camtex_shutdown();
        assert_eq!(camtex_state(), StreamState::Idle as i32);
        uninstall();
        camtex_set_message_callback(None);
    }

    static STATES_SEEN: Mutex<Vec<(String, i32)>> = Mutex::new(Vec::new());

    extern "C" fn query_state_on_message(message: *const c_char) {
        // SAFETY: the messenger passes a live NUL-terminated string
        let message = unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned();
        let state = camtex_state();
        if message.starts_with("STREAM_STARTED:") {
            // calling back in, as engine scripts do
            camtex_get_current_texture_handle();
            installed().and_then(|controller| controller.session());
        }
        STATES_SEEN.lock().unwrap().push((message, state));
    }

    #[test]
    #[serial]
    fn message_callback_may_call_back_in() {
        STATES_SEEN.lock().unwrap().clear();
        camtex_set_message_callback(Some(query_state_on_message));
        install(controller(Arc::new(StaticPermission::granted())));

        let (tx, rx) = flume::bounded(1);
        thread::spawn(move || {
            let started = camtex_start();
            camtex_on_pause();
            camtex_shutdown();
            let _ = tx.send(started);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(3)), Ok(OK));

        uninstall();
        camtex_set_message_callback(None);
        let seen = STATES_SEEN.lock().unwrap();
        assert!(seen[0].0.starts_with("STREAM_STARTED:"));
        assert_eq!(seen[0].1, StreamState::Streaming as i32);
        assert_eq!(seen[1], ("STREAM_PAUSED".to_string(), StreamState::Paused as i32));
        assert!(seen[2].0.starts_with("STREAM_STOPPED:"));
        assert_eq!(seen[2].1, StreamState::Idle as i32);
    }
}
