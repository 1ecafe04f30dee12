//! Bounded raw-buffer pool and the drop-oldest in-flight queue between the
//! driver thread and the capture thread

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;

use super::frame::Frame;

/// Fixed set of reusable capture buffers.
///
/// At most `capacity` buffers are outstanding at once. `acquire` never blocks:
/// it returns `None` when the pool is exhausted so the driver can reclaim or
/// skip instead of stalling the sensor.
pub struct FramePool {
    free: ArrayQueue<Vec<u8>>,
    outstanding: CachePadded<AtomicUsize>,
    capacity: usize,
}

impl FramePool {
    /// Pre-allocates `capacity` buffers of `buffer_len` bytes.
    pub fn new(capacity: usize, buffer_len: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = free.push(Vec::with_capacity(buffer_len));
        }
        Arc::new(Self {
            free,
            outstanding: CachePadded::new(AtomicUsize::new(0)),
            capacity,
        })
    }

    pub fn acquire(self: &Arc<Self>, len: usize) -> Option<PooledBuffer> {
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .ok()?;

        let mut data = self.free.pop().unwrap_or_default();
        data.clear();
        data.resize(len, 0);
        Some(PooledBuffer {
            data,
            pool: Some(Arc::clone(self)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffers currently held by the driver, the queue or a consumer.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn recycle(&self, data: Vec<u8>) {
        let _ = self.free.push(data);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A capture buffer that returns to its pool on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Option<Arc<FramePool>>,
}

impl PooledBuffer {
    /// A buffer that belongs to no pool.
    pub fn detached(data: Vec<u8>) -> Self {
        Self { data, pool: None }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Shrinks the visible length, e.g. to the bytes a compressed frame used.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.data));
        }
    }
}

/// Frames delivered by the driver, waiting for the capture thread.
///
/// Pushing into a full queue evicts the oldest frame: only the newest frame
/// matters and the driver must never wait on the consumer.
pub struct InFlightQueue {
    queue: ArrayQueue<Frame>,
    doorbell_tx: flume::Sender<()>,
    doorbell_rx: flume::Receiver<()>,
    evicted: CachePadded<AtomicU64>,
}

impl InFlightQueue {
    pub fn new(capacity: usize) -> Self {
        let (doorbell_tx, doorbell_rx) = flume::bounded(1);
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            doorbell_tx,
            doorbell_rx,
            evicted: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Returns true when an older frame was evicted to make room.
    pub fn push(&self, frame: Frame) -> bool {
        let evicted = self.queue.force_push(frame).is_some();
        if evicted {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        // A pending ring is enough to wake the consumer.
        let _ = self.doorbell_tx.try_send(());
        evicted
    }

    pub fn pop(&self) -> Option<Frame> {
        self.queue.pop()
    }

    /// Drops the oldest queued frame so its buffer returns to the pool.
    pub fn reclaim_oldest(&self) -> bool {
        match self.queue.pop() {
            Some(frame) => {
                drop(frame);
                self.evicted.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Waits up to `timeout` for a push notification.
    pub fn wait(&self, timeout: Duration) {
        let _ = self.doorbell_rx.recv_timeout(timeout);
    }

    /// Wakes a waiting consumer without a frame, e.g. on shutdown.
    pub fn wake(&self) {
        let _ = self.doorbell_tx.try_send(());
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
