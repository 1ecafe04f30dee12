//! Consumed device camera API
//!
//! A [`CameraDriver`] is the platform's camera stack: it enumerates devices,
//! negotiates a stream format and pushes raw frames from its own thread into
//! a [`FrameSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::frame::{Frame, Orientation, PixelFormat, PlaneLayout};
use super::pool::{FramePool, InFlightQueue, PooledBuffer};
use crate::error::{BridgeError, Result};
use crate::stats::PipelineStats;
use crate::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Facing {
    Back,
    Front,
    External,
}

/// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub id: String,
    pub name: String,
    pub facing: Facing,
    /// Clockwise degrees the sensor image must rotate to appear upright.
    pub sensor_orientation: i32,
}

/// What the session asks the driver for.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub resolution: Resolution,
    pub fps: u32,
    pub format: Option<PixelFormat>,
}

/// What the driver actually delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
    pub orientation: Orientation,
    /// Upper bound of one raw frame in bytes, used to size the pool.
    pub frame_len: usize,
}

/// Events the capture side marshals to the lifecycle controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// The device went away. Fatal to the session.
    Disconnected(String),
    /// An unrecoverable pipeline error, e.g. a format the converter rejects.
    Fatal(BridgeError),
}

/// Runs on the thread that hit a fault, as soon as it is reported.
pub type FaultHook = Arc<dyn Fn(&SourceEvent) + Send + Sync>;

pub trait CameraDriver: Send {
    fn enumerate(&self) -> Vec<CameraDescriptor>;

    /// Opens the device and negotiates the stream format.
    fn open(
        &mut self,
        camera: &CameraDescriptor,
        request: &StreamRequest,
    ) -> Result<NegotiatedFormat>;

    /// Starts pushing frames into `sink` from the driver's own thread.
    fn start(&mut self, sink: FrameSink) -> Result<()>;

    /// Stops delivery and releases the native handle. Idempotent.
    fn stop(&mut self);

    fn is_open(&self) -> bool;
}

struct SinkShared {
    pool: Arc<FramePool>,
    queue: Arc<InFlightQueue>,
    sequence: AtomicU64,
    events: flume::Sender<SourceEvent>,
    stats: Arc<PipelineStats>,
    format: NegotiatedFormat,
    on_fault: Option<FaultHook>,
}

/// Driver-facing push handle.
///
/// Assigns sequence numbers in delivery order; a skipped capture consumes a
/// sequence number so downstream sees the gap.
#[derive(Clone)]
pub struct FrameSink {
    shared: Arc<SinkShared>,
}

impl FrameSink {
    pub(crate) fn new(
        pool: Arc<FramePool>,
        queue: Arc<InFlightQueue>,
        events: flume::Sender<SourceEvent>,
        stats: Arc<PipelineStats>,
        format: NegotiatedFormat,
        on_fault: Option<FaultHook>,
    ) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                pool,
                queue,
                sequence: AtomicU64::new(0),
                events,
                stats,
                format,
                on_fault,
            }),
        }
    }

    pub fn format(&self) -> &NegotiatedFormat {
        &self.shared.format
    }

    /// A buffer to capture into, or `None` if the pool is exhausted even
    /// after evicting the oldest queued frame.
    pub fn buffer(&self, len: usize) -> Option<PooledBuffer> {
        let shared = &self.shared;
        if let Some(buffer) = shared.pool.acquire(len) {
            return Some(buffer);
        }
        if shared.queue.reclaim_oldest() {
            shared.stats.record_dropped(1);
            return shared.pool.acquire(len);
        }
        None
    }

    /// Hands a filled buffer downstream. Returns the assigned sequence number.
    pub fn deliver(
        &self,
        buffer: PooledBuffer,
        layouts: &[PlaneLayout],
        device_timestamp: Option<Duration>,
    ) -> Result<u64> {
        let shared = &self.shared;
        let sequence = shared.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let frame = Frame::new(
            buffer,
            shared.format.width,
            shared.format.height,
            shared.format.format,
            layouts,
            sequence,
            device_timestamp,
        )?;
        shared.stats.record_captured();
        if shared.queue.push(frame) {
            shared.stats.record_dropped(1);
            trace!(sequence, "in-flight queue full, evicted oldest frame");
        }
        Ok(sequence)
    }

    /// Records a capture the driver could not deliver.
    pub fn dropped(&self) {
        self.shared.sequence.fetch_add(1, Ordering::AcqRel);
        self.shared.stats.record_dropped(1);
    }

    /// Reports that the device went away. The fault hook runs on the
    /// calling thread before this returns.
    pub fn disconnected(&self, reason: impl Into<String>) {
        let event = SourceEvent::Disconnected(reason.into());
        if let Some(hook) = &self.shared.on_fault {
            hook(&event);
        }
        let _ = self.shared.events.send(event);
        self.shared.queue.wake();
    }
}
