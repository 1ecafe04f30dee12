//! Bridge Surface: what the host render loop calls once per host frame
//!
//! Every call is a handful of atomic loads and at most one swap. Nothing here
//! touches the camera, allocates on the per-frame path, or waits on the
//! capture thread.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::stats::PipelineStats;
use crate::texture::{SlotReader, TextureHandle};

const NOT_READING: usize = usize::MAX;

#[inline]
fn pack_dims(width: u32, height: u32) -> u64 {
    (width as u64) << 32 | height as u64
}

pub struct BridgeSurface {
    reader: ArcSwapOption<SlotReader>,
    reading: AtomicUsize,
    last_handle: AtomicU64,
    last_sequence: AtomicU64,
    dimensions: AtomicU64,
    stats: Arc<PipelineStats>,
}

impl BridgeSurface {
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self {
            reader: ArcSwapOption::empty(),
            reading: AtomicUsize::new(NOT_READING),
            last_handle: AtomicU64::new(0),
            last_sequence: AtomicU64::new(0),
            dimensions: AtomicU64::new(0),
            stats,
        }
    }

    /// Texture holding the newest frame, or the one from the previous call if
    /// nothing new arrived. [`TextureHandle::NULL`] while no stream is enabled
    /// or before its first frame.
    pub fn get_current_texture_handle(&self) -> TextureHandle {
        let guard = self.reader.load();
        let Some(reader) = guard.as_ref() else {
            return TextureHandle::NULL;
        };
        self.stats.record_read();

        match reader.acquire_read_slot() {
            Some(slot) => {
                self.reading.store(slot.index, Ordering::Release);
                if slot.fresh {
                    self.last_handle.store(slot.handle.raw(), Ordering::Release);
                    self.last_sequence.store(slot.sequence, Ordering::Release);
                    self.dimensions
                        .store(pack_dims(slot.width, slot.height), Ordering::Release);
                }
                slot.handle
            }
            None => TextureHandle::NULL,
        }
    }

    /// The host finished rendering with the last handle.
    pub fn notify_host_frame_rendered(&self) {
        let index = self.reading.swap(NOT_READING, Ordering::AcqRel);
        if index == NOT_READING {
            return;
        }
        if let Some(reader) = self.reader.load().as_ref() {
            reader.release_read_slot(index);
        }
        self.stats.record_rendered();
    }

    /// Releases every texture handle and detaches from the stream. The
    /// session keeps running until the controller stops it, but nothing more
    /// reaches the host.
    pub fn shutdown(&self) {
        if let Some(reader) = self.disable() {
            reader.release_textures();
            info!("Bridge shut down, texture handles released");
        }
    }

    /// Size of the frames the host receives, `(0, 0)` when disabled.
    pub fn stream_dimensions(&self) -> (u32, u32) {
        let packed = self.dimensions.load(Ordering::Acquire);
        ((packed >> 32) as u32, packed as u32)
    }

    /// Sequence of the frame behind the last handle returned.
    pub fn current_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Last handle returned to the host, without looking for a newer one.
    pub fn last_handle(&self) -> TextureHandle {
        TextureHandle(self.last_handle.load(Ordering::Acquire))
    }

    pub fn is_enabled(&self) -> bool {
        self.reader.load().is_some()
    }

    /// Encodes the frame the host currently holds as PNG.
    ///
    /// `Ok(None)` when no frame has been read yet. Reads only the reader's
    /// slot, so capture is never blocked.
    pub fn snapshot_png(&self) -> Result<Option<Bytes>> {
        let guard = self.reader.load();
        let Some(reader) = guard.as_ref() else {
            return Ok(None);
        };
        let Some(slot) = reader.current() else {
            return Ok(None);
        };
        let pixels = reader
            .backend()
            .read_back(slot.handle)
            .ok_or_else(|| BridgeError::Texture("backend cannot read textures back".into()))?;

        let mut png = Cursor::new(Vec::new());
        PngEncoder::new(&mut png)
            .write_image(&pixels, slot.width, slot.height, ExtendedColorType::Rgba8)
            .map_err(|e| BridgeError::Texture(format!("PNG encode: {e}")))?;
        debug!(sequence = slot.sequence, "Encoded snapshot");
        Ok(Some(Bytes::from(png.into_inner())))
    }

    pub(crate) fn enable(&self, reader: Arc<SlotReader>, width: u32, height: u32) {
        self.reading.store(NOT_READING, Ordering::Release);
        self.last_handle.store(0, Ordering::Release);
        self.last_sequence.store(0, Ordering::Release);
        self.dimensions
            .store(pack_dims(width, height), Ordering::Release);
        self.reader.store(Some(reader));
    }

    pub(crate) fn disable(&self) -> Option<Arc<SlotReader>> {
        let reader = self.reader.swap(None);
        self.reading.store(NOT_READING, Ordering::Release);
        self.last_handle.store(0, Ordering::Release);
        self.dimensions.store(0, Ordering::Release);
        reader
    }
}
