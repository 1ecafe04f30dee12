//! Host-side collaborators: the permission subsystem and the message channel
//! back to the engine's scripting layer

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    /// Never asked, or the user dismissed the prompt.
    Undetermined,
}

/// Camera permission as the host platform reports it.
pub trait PermissionProvider: Send + Sync {
    fn status(&self) -> PermissionStatus;

    /// Starts the platform prompt. The answer arrives later through
    /// [`on_permission_result`](crate::LifecycleController::on_permission_result).
    fn request(&self);
}

/// Permission held in an atomic, set by platform glue or tests.
#[derive(Debug)]
pub struct StaticPermission {
    status: AtomicU8,
    requests: AtomicU64,
}

impl StaticPermission {
    pub fn new(status: PermissionStatus) -> Self {
        Self {
            status: AtomicU8::new(status as u8),
            requests: AtomicU64::new(0),
        }
    }

    pub fn granted() -> Self {
        Self::new(PermissionStatus::Granted)
    }

    pub fn set(&self, status: PermissionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// How many times the prompt was requested.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }
}

impl PermissionProvider for StaticPermission {
    fn status(&self) -> PermissionStatus {
        match self.status.load(Ordering::Acquire) {
            0 => PermissionStatus::Granted,
            1 => PermissionStatus::Denied,
            _ => PermissionStatus::Undetermined,
        }
    }

    fn request(&self) {
        self.requests.fetch_add(1, Ordering::AcqRel);
    }
}

/// Notifications pushed to the host's scripting layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Started { session: u64, width: u32, height: u32 },
    Stopped { session: u64, forced: bool },
    Paused,
    Resumed,
    PermissionDenied,
    Error(String),
    Warning(String),
}

impl HostEvent {
    /// Stable string form for engines that only pass strings across.
    pub fn to_message(&self) -> String {
        match self {
            HostEvent::Started {
                session,
                width,
                height,
            } => format!("STREAM_STARTED:{session}:{width}x{height}"),
            HostEvent::Stopped {
                session,
                forced: false,
            } => format!("STREAM_STOPPED:{session}"),
            HostEvent::Stopped {
                session,
                forced: true,
            } => format!("STREAM_STOPPED:{session}:FORCED"),
            HostEvent::Paused => "STREAM_PAUSED".into(),
            HostEvent::Resumed => "STREAM_RESUMED".into(),
            HostEvent::PermissionDenied => "PERMISSION_DENIED".into(),
            HostEvent::Error(reason) => format!("ERROR:{reason}"),
            HostEvent::Warning(reason) => format!("WARNING:{reason}"),
        }
    }
}

impl fmt::Display for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_message())
    }
}

/// Delivers [`HostEvent`]s.
///
/// Called from the thread that made the controller call, or from the
/// capture side for a fault, never from the render thread. No controller
/// lock is held during `send`, so implementations may call back in.
pub trait HostMessenger: Send + Sync {
    fn send(&self, event: HostEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMessenger;

impl HostMessenger for NullMessenger {
    fn send(&self, event: HostEvent) {
        trace!(%event, "no host messenger installed");
    }
}

/// Queues events for a host that polls.
#[derive(Debug, Clone)]
pub struct ChannelMessenger {
    tx: flume::Sender<HostEvent>,
}

impl ChannelMessenger {
    pub fn new() -> (Self, flume::Receiver<HostEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl HostMessenger for ChannelMessenger {
    fn send(&self, event: HostEvent) {
        // a host that dropped its receiver no longer wants messages
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_have_stable_wire_form() {
        let started = HostEvent::Started {
            session: 3,
            width: 720,
            height: 1280,
        };
        assert_eq!(started.to_message(), "STREAM_STARTED:3:720x1280");
        assert_eq!(
            HostEvent::Stopped {
                session: 3,
                forced: true
            }
            .to_message(),
            "STREAM_STOPPED:3:FORCED"
        );
        assert_eq!(HostEvent::PermissionDenied.to_string(), "PERMISSION_DENIED");
        assert_eq!(
            HostEvent::Error("camera unplugged".into()).to_message(),
            "ERROR:camera unplugged"
        );
    }

    #[test]
    fn static_permission_counts_requests() {
        let permission = StaticPermission::new(PermissionStatus::Undetermined);
        assert_eq!(permission.status(), PermissionStatus::Undetermined);
        permission.request();
        permission.set(PermissionStatus::Denied);
        assert_eq!(permission.status(), PermissionStatus::Denied);
        assert_eq!(permission.request_count(), 1);
    }

    #[test]
    fn channel_messenger_delivers_in_order() {
        let (messenger, rx) = ChannelMessenger::new();
        messenger.send(HostEvent::Paused);
        messenger.send(HostEvent::Resumed);
        assert_eq!(rx.try_recv().unwrap(), HostEvent::Paused);
        assert_eq!(rx.try_recv().unwrap(), HostEvent::Resumed);
        drop(rx);
        messenger.send(HostEvent::Paused);
    }
}
