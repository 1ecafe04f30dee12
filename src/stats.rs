//! Pipeline counters shared between the capture thread, the render thread and
//! whoever asks for a snapshot

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Lock-free counters. Every field is written by exactly one thread.
#[derive(Default)]
pub struct PipelineStats {
    capture: CachePadded<CaptureCounters>,
    render: CachePadded<RenderCounters>,
}

#[derive(Default)]
struct CaptureCounters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    frames_skipped: AtomicU64,
    frames_published: AtomicU64,
    sequence_gaps: AtomicU64,
    over_budget: AtomicU64,
    convert_avg_us: AtomicU64,
    convert_p99_us: AtomicU64,
}

#[derive(Default)]
struct RenderCounters {
    reads: AtomicU64,
    frames_rendered: AtomicU64,
    forced_teardowns: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    /// Frames discarded at the callback gate while paused or stopping.
    pub frames_skipped: u64,
    pub frames_published: u64,
    pub sequence_gaps: u64,
    pub over_budget: u64,
    pub convert_avg_us: u64,
    pub convert_p99_us: u64,
    pub reads: u64,
    pub frames_rendered: u64,
    pub forced_teardowns: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_captured(&self) {
        self.capture.frames_captured.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camtex_frames_captured").increment(1);
    }

    pub fn record_dropped(&self, count: u64) {
        self.capture
            .frames_dropped
            .fetch_add(count, Ordering::Relaxed);
        metrics::counter!("camtex_frames_dropped").increment(count);
    }

    pub fn record_skipped(&self) {
        self.capture.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.capture
            .frames_published
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camtex_frames_published").increment(1);
    }

    pub fn record_gap(&self, missing: u64) {
        self.capture
            .sequence_gaps
            .fetch_add(missing, Ordering::Relaxed);
    }

    pub fn record_over_budget(&self) {
        self.capture.over_budget.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camtex_convert_over_budget").increment(1);
    }

    pub fn record_read(&self) {
        self.render.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rendered(&self) {
        self.render.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forced_teardown(&self) {
        self.render
            .forced_teardowns
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camtex_forced_teardowns").increment(1);
    }

    fn store_convert_times(&self, avg_us: u64, p99_us: u64) {
        self.capture.convert_avg_us.store(avg_us, Ordering::Relaxed);
        self.capture.convert_p99_us.store(p99_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.capture;
        let r = &self.render;
        StatsSnapshot {
            frames_captured: c.frames_captured.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            frames_skipped: c.frames_skipped.load(Ordering::Relaxed),
            frames_published: c.frames_published.load(Ordering::Relaxed),
            sequence_gaps: c.sequence_gaps.load(Ordering::Relaxed),
            over_budget: c.over_budget.load(Ordering::Relaxed),
            convert_avg_us: c.convert_avg_us.load(Ordering::Relaxed),
            convert_p99_us: c.convert_p99_us.load(Ordering::Relaxed),
            reads: r.reads.load(Ordering::Relaxed),
            frames_rendered: r.frames_rendered.load(Ordering::Relaxed),
            forced_teardowns: r.forced_teardowns.load(Ordering::Relaxed),
        }
    }
}

const TIMING_WINDOW: usize = 128;
const PUBLISH_EVERY: u64 = 16;

/// Sliding window of conversion times, owned by the capture thread.
///
/// Folds avg/p99 into [`PipelineStats`] every few frames so readers never
/// touch the window itself.
pub struct ConvertTimer {
    window: HeapRb<u32>,
    samples: u64,
    sorted: Vec<u32>,
}

impl ConvertTimer {
    pub fn new() -> Self {
        Self {
            window: HeapRb::new(TIMING_WINDOW),
            samples: 0,
            sorted: Vec::with_capacity(TIMING_WINDOW),
        }
    }

    pub fn record(&mut self, elapsed: Duration, stats: &PipelineStats) {
        let micros = elapsed.as_micros().min(u32::MAX as u128) as u32;
        self.window.push_overwrite(micros);
        metrics::histogram!("camtex_convert_time_us").record(micros as f64);

        self.samples += 1;
        if self.samples % PUBLISH_EVERY == 0 || self.samples == 1 {
            let (avg, p99) = self.summary();
            stats.store_convert_times(avg, p99);
        }
    }

    /// Average and 99th percentile of the window, in microseconds.
    pub fn summary(&mut self) -> (u64, u64) {
        if self.window.is_empty() {
            return (0, 0);
        }
        self.sorted.clear();
        self.sorted.extend(self.window.iter().copied());
        self.sorted.sort_unstable();

        let len = self.sorted.len();
        let total: u64 = self.sorted.iter().map(|&v| v as u64).sum();
        let p99_index = ((len * 99).div_ceil(100)).saturating_sub(1);
        (total / len as u64, self.sorted[p99_index] as u64)
    }
}

impl Default for ConvertTimer {
    fn default() -> Self {
        Self::new()
    }
}
