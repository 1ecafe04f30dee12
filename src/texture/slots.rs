//! Triple-buffered texture handoff
//!
//! The writer (capture thread) owns a back slot, the reader (render thread)
//! owns a front slot, and the most recently published slot sits in between.
//! One `AtomicU64` holds the middle slot's index, its sequence number and a
//! fresh bit. Publishing swaps the back slot in; reading swaps the front slot
//! in only when the fresh bit is set. Neither side ever waits on the other and
//! the reader's slot is never the writer's.
//!
//! With more than three slots the writer keeps the spares in rotation so the
//! same index is not written twice in a row.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use tracing::{debug, trace, warn};

use super::backend::{TextureBackend, TextureDesc, TextureHandle};
use super::{MAX_SLOTS, MIN_SLOTS};
use crate::convert::ConvertedImage;
use crate::error::{BridgeError, Result};

const INDEX_MASK: u64 = 0xFF;
const FRESH: u64 = 1 << 8;
const SEQ_SHIFT: u32 = 16;

#[inline]
fn pack(index: usize, sequence: u64, fresh: bool) -> u64 {
    (sequence << SEQ_SHIFT) | if fresh { FRESH } else { 0 } | index as u64
}

#[inline]
fn unpack(word: u64) -> (usize, u64, bool) {
    ((word & INDEX_MASK) as usize, word >> SEQ_SHIFT, word & FRESH != 0)
}

/// Diagnostic state of one slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle = 0,
    Writing = 1,
    Ready = 2,
    Reading = 3,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SlotState::Writing,
            2 => SlotState::Ready,
            3 => SlotState::Reading,
            _ => SlotState::Idle,
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Slot {
    handle: TextureHandle,
    state: AtomicU8,
    sequence: AtomicU64,
    width: AtomicU32,
    height: AtomicU32,
}

impl Slot {
    fn set_state(&self, state: SlotState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }
}

struct Shared {
    slots: Box<[Slot]>,
    latest: CachePadded<AtomicU64>,
    last_published: AtomicU64,
    released: AtomicBool,
    backend: Arc<dyn TextureBackend>,
}

impl Shared {
    fn release_all(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        for slot in self.slots.iter() {
            self.backend.release(slot.handle);
            slot.set_state(SlotState::Idle);
        }
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Allocates the slot set for one stream.
pub struct TextureSlots;

impl TextureSlots {
    /// Creates `count` `width`x`height` textures and splits them between a
    /// writer and a reader. No texture is created after this call.
    pub fn allocate(
        backend: Arc<dyn TextureBackend>,
        count: usize,
        width: u32,
        height: u32,
    ) -> Result<(SlotWriter, SlotReader)> {
        if !(MIN_SLOTS..=MAX_SLOTS).contains(&count) {
            return Err(BridgeError::Config(format!(
                "slot count must be within {MIN_SLOTS}..={MAX_SLOTS}, got {count}"
            )));
        }

        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            let desc = TextureDesc {
                label: format!("camtex slot {i}"),
                width,
                height,
            };
            match backend.create(&desc) {
                Ok(handle) => slots.push(Slot {
                    handle,
                    state: AtomicU8::new(SlotState::Idle as u8),
                    sequence: AtomicU64::new(0),
                    width: AtomicU32::new(width),
                    height: AtomicU32::new(height),
                }),
                Err(e) => {
                    for slot in &slots {
                        backend.release(slot.handle);
                    }
                    return Err(e);
                }
            }
        }
        debug!("Allocated {} {}x{} texture slots", count, width, height);

        // writer starts on 0, the middle is 1, the reader holds the last slot
        let shared = Arc::new(Shared {
            slots: slots.into_boxed_slice(),
            latest: CachePadded::new(AtomicU64::new(pack(1, 0, false))),
            last_published: AtomicU64::new(0),
            released: AtomicBool::new(false),
            backend,
        });
        let writer = SlotWriter {
            shared: Arc::clone(&shared),
            back: 0,
            spares: (2..count - 1).collect(),
            writing: false,
        };
        let reader = SlotReader {
            shared,
            front: AtomicU64::new((count - 1) as u64),
            loaded: AtomicBool::new(false),
            busy: AtomicBool::new(false),
        };
        Ok((writer, reader))
    }
}

/// Capture-side end. Owned by exactly one thread.
pub struct SlotWriter {
    shared: Arc<Shared>,
    back: usize,
    spares: VecDeque<usize>,
    writing: bool,
}

impl SlotWriter {
    /// The slot to write the next frame into. Never the reader's slot.
    pub fn acquire_write_slot(&mut self) -> usize {
        if !self.writing {
            self.writing = true;
            self.shared.slots[self.back].set_state(SlotState::Writing);
        }
        self.back
    }

    /// Copies `image` into the acquired slot's texture.
    pub fn upload(&mut self, index: usize, image: &ConvertedImage) -> Result<()> {
        self.check_acquired(index)?;
        if self.shared.released.load(Ordering::Acquire) {
            return Err(BridgeError::Texture("slots already released".into()));
        }
        let slot = &self.shared.slots[index];
        self.shared.backend.upload(slot.handle, image)?;
        slot.width.store(image.width, Ordering::Relaxed);
        slot.height.store(image.height, Ordering::Relaxed);
        Ok(())
    }

    /// Makes `index` the latest frame with one atomic swap and rotates the
    /// back slot. Sequences must strictly increase.
    pub fn publish(&mut self, index: usize, sequence: u64) -> Result<()> {
        self.check_acquired(index)?;
        let last = self.shared.last_published.load(Ordering::Relaxed);
        if sequence <= last {
            self.abandon();
            return Err(BridgeError::InvalidFrame(format!(
                "sequence {sequence} does not follow published {last}"
            )));
        }

        let slot = &self.shared.slots[index];
        slot.sequence.store(sequence, Ordering::Relaxed);
        slot.set_state(SlotState::Ready);
        self.shared.last_published.store(sequence, Ordering::Relaxed);

        let previous = self
            .shared
            .latest
            .swap(pack(index, sequence, true), Ordering::AcqRel);
        let (old_middle, old_sequence, unread) = unpack(previous);
        if unread {
            trace!(sequence = old_sequence, "superseded before the reader saw it");
            self.shared.slots[old_middle].set_state(SlotState::Idle);
        }

        self.writing = false;
        self.spares.push_back(old_middle);
        self.back = self.spares.pop_front().unwrap_or(old_middle);
        Ok(())
    }

    /// Gives up the acquired slot without publishing it.
    pub fn abandon(&mut self) {
        if self.writing {
            self.writing = false;
            self.shared.slots[self.back].set_state(SlotState::Idle);
            if let Some(next) = self.spares.pop_front() {
                self.spares.push_back(self.back);
                self.back = next;
            }
        }
    }

    pub fn last_published(&self) -> u64 {
        self.shared.last_published.load(Ordering::Relaxed)
    }

    fn check_acquired(&self, index: usize) -> Result<()> {
        if !self.writing || index != self.back {
            return Err(BridgeError::Texture(format!(
                "slot {index} is not the acquired write slot"
            )));
        }
        Ok(())
    }
}

/// A slot the reader currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSlot {
    pub index: usize,
    pub sequence: u64,
    pub handle: TextureHandle,
    pub width: u32,
    pub height: u32,
    /// False when this is the same frame the previous read returned.
    pub fresh: bool,
}

/// Render-side end. Shared by reference; calls never block.
pub struct SlotReader {
    shared: Arc<Shared>,
    front: AtomicU64,
    loaded: AtomicBool,
    busy: AtomicBool,
}

impl SlotReader {
    /// The newest published slot, or the one held since the last read when
    /// nothing new arrived. `None` before the first publish or after release.
    pub fn acquire_read_slot(&self) -> Option<ReadSlot> {
        if self.shared.released.load(Ordering::Acquire) {
            return None;
        }
        // a concurrent reader is mid-swap; hand out what is held
        if self.busy.swap(true, Ordering::Acquire) {
            return self.held(false);
        }

        let mut fresh = false;
        let (_, _, pending) = unpack(self.shared.latest.load(Ordering::Acquire));
        if pending {
            let front = self.front.load(Ordering::Relaxed) as usize;
            let front_sequence = self.shared.slots[front].sequence.load(Ordering::Relaxed);
            // still ours until the swap hands it to the writer
            self.shared.slots[front].set_state(SlotState::Idle);
            let previous = self
                .shared
                .latest
                .swap(pack(front, front_sequence, false), Ordering::AcqRel);
            let (index, _, _) = unpack(previous);

            self.front.store(index as u64, Ordering::Relaxed);
            self.loaded.store(true, Ordering::Release);
            fresh = true;
        }
        if self.loaded.load(Ordering::Acquire) {
            let front = self.front.load(Ordering::Relaxed) as usize;
            self.shared.slots[front].set_state(SlotState::Reading);
        }
        self.busy.store(false, Ordering::Release);
        self.held(fresh)
    }

    /// Ends the render pass on `index`. The slot stays held for frame hold.
    pub fn release_read_slot(&self, index: usize) {
        let front = self.front.load(Ordering::Relaxed) as usize;
        if index == front && self.loaded.load(Ordering::Acquire) {
            let slot = &self.shared.slots[index];
            let _ = slot.state.compare_exchange(
                SlotState::Reading as u8,
                SlotState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// The held slot without looking for a newer one.
    pub fn current(&self) -> Option<ReadSlot> {
        self.held(false)
    }

    fn held(&self, fresh: bool) -> Option<ReadSlot> {
        if !self.loaded.load(Ordering::Acquire) || self.shared.released.load(Ordering::Acquire) {
            return None;
        }
        let index = self.front.load(Ordering::Relaxed) as usize;
        let slot = &self.shared.slots[index];
        Some(ReadSlot {
            index,
            sequence: slot.sequence.load(Ordering::Relaxed),
            handle: slot.handle,
            width: slot.width.load(Ordering::Relaxed),
            height: slot.height.load(Ordering::Relaxed),
            fresh,
        })
    }

    /// Releases every texture. Idempotent; later reads return `None` and
    /// later uploads fail.
    pub fn release_textures(&self) {
        if self.shared.release_all() {
            debug!("Released {} texture slots", self.shared.slots.len());
        }
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    /// Most recent sequence the writer published, read or not.
    pub fn published_sequence(&self) -> u64 {
        self.shared.last_published.load(Ordering::Relaxed)
    }

    pub fn slot_count(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.shared.slots.iter().map(Slot::state).collect()
    }

    pub fn backend(&self) -> &Arc<dyn TextureBackend> {
        &self.shared.backend
    }
}

impl Drop for SlotReader {
    fn drop(&mut self) {
        if !self.is_released() {
            warn!("Texture slots dropped without an explicit release");
            self.release_textures();
        }
    }
}
