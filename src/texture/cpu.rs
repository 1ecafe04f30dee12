//! In-memory texture backend for tests, the demo, and hosts that sample from CPU memory

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use arc_swap::ArcSwap;
use tracing::trace;

use super::backend::{TextureBackend, TextureDesc, TextureHandle};
use crate::convert::{ConvertedImage, RGBA_BYTES};
use crate::error::{BridgeError, Result};

struct CpuTexture {
    width: u32,
    height: u32,
    pixels: Mutex<Vec<u8>>,
}

/// Textures as plain RGBA byte vectors.
///
/// The handle table is swapped atomically so `upload` never contends with
/// `create`/`release`. Each texture's pixels sit behind their own mutex; the
/// slot protocol keeps writer and reader on different textures, so any lock
/// contention is counted as a handoff violation.
pub struct CpuTextureBackend {
    textures: ArcSwap<HashMap<u64, Arc<CpuTexture>>>,
    next_id: AtomicU64,
    uploads: AtomicU64,
    contended: AtomicU64,
}

impl CpuTextureBackend {
    pub fn new() -> Self {
        Self {
            textures: ArcSwap::from_pointee(HashMap::new()),
            next_id: AtomicU64::new(1),
            uploads: AtomicU64::new(0),
            contended: AtomicU64::new(0),
        }
    }

    pub fn uploads(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Times a reader and a writer met on the same texture.
    pub fn contended(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }

    pub fn dimensions(&self, handle: TextureHandle) -> Option<(u32, u32)> {
        self.textures
            .load()
            .get(&handle.0)
            .map(|t| (t.width, t.height))
    }

    fn lock<'a>(&self, texture: &'a CpuTexture) -> std::sync::MutexGuard<'a, Vec<u8>> {
        match texture.pixels.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                texture
                    .pixels
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        }
    }
}

impl Default for CpuTextureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureBackend for CpuTextureBackend {
    fn create(&self, desc: &TextureDesc) -> Result<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BridgeError::Texture(format!(
                "{}: empty {}x{} texture",
                desc.label, desc.width, desc.height
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let texture = Arc::new(CpuTexture {
            width: desc.width,
            height: desc.height,
            pixels: Mutex::new(vec![0; desc.width as usize * desc.height as usize * RGBA_BYTES]),
        });
        self.textures.rcu(|map| {
            let mut map = HashMap::clone(map);
            map.insert(id, Arc::clone(&texture));
            map
        });
        trace!(id, label = %desc.label, "created CPU texture");
        Ok(TextureHandle(id))
    }

    fn upload(&self, handle: TextureHandle, image: &ConvertedImage) -> Result<()> {
        let textures = self.textures.load();
        let texture = textures
            .get(&handle.0)
            .ok_or_else(|| BridgeError::Texture(format!("{handle} is not live")))?;
        if (image.width, image.height) != (texture.width, texture.height) {
            return Err(BridgeError::Texture(format!(
                "{}x{} image does not fit {}x{} {handle}",
                image.width, image.height, texture.width, texture.height
            )));
        }

        let row = texture.width as usize * RGBA_BYTES;
        let mut pixels = self.lock(texture);
        for (dst, src) in pixels
            .chunks_exact_mut(row)
            .zip(image.data.chunks(image.stride))
        {
            dst.copy_from_slice(&src[..row]);
        }
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_back(&self, handle: TextureHandle) -> Option<Vec<u8>> {
        let textures = self.textures.load();
        let texture = textures.get(&handle.0)?;
        let pixels = self.lock(texture);
        Some(pixels.clone())
    }

    fn release(&self, handle: TextureHandle) {
        let mut removed = false;
        self.textures.rcu(|map| {
            let mut map = HashMap::clone(map);
            removed = map.remove(&handle.0).is_some();
            map
        });
        if removed {
            trace!(id = handle.0, "released CPU texture");
        }
    }

    fn live_handles(&self) -> usize {
        self.textures.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(width: u32, height: u32) -> TextureDesc {
        TextureDesc {
            label: "test".into(),
            width,
            height,
        }
    }

    fn image(width: u32, height: u32, value: u8) -> ConvertedImage {
        ConvertedImage {
            data: vec![value; width as usize * height as usize * RGBA_BYTES],
            width,
            height,
            stride: width as usize * RGBA_BYTES,
            sequence: 1,
        }
    }

    #[test]
    fn upload_and_read_back() {
        let backend = CpuTextureBackend::new();
        let handle = backend.create(&desc(2, 2)).unwrap();
        assert!(!handle.is_null());
        backend.upload(handle, &image(2, 2, 42)).unwrap();
        assert_eq!(backend.read_back(handle).unwrap(), vec![42; 16]);
        assert_eq!(backend.uploads(), 1);
        assert_eq!(backend.contended(), 0);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let backend = CpuTextureBackend::new();
        let handle = backend.create(&desc(2, 2)).unwrap();
        assert!(matches!(
            backend.upload(handle, &image(4, 2, 1)),
            Err(BridgeError::Texture(_))
        ));
    }

    #[test]
    fn release_is_idempotent() {
        let backend = CpuTextureBackend::new();
        let a = backend.create(&desc(1, 1)).unwrap();
        let b = backend.create(&desc(1, 1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.live_handles(), 2);

        backend.release(a);
        backend.release(a);
        assert_eq!(backend.live_handles(), 1);
        assert!(backend.read_back(a).is_none());
        assert!(backend.upload(a, &image(1, 1, 0)).is_err());
    }
}
