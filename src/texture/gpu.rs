//! WebGPU texture backend over a host-provided device and queue

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::{debug, info, instrument};
use wgpu::*;

use super::backend::{TextureBackend, TextureDesc, TextureHandle};
use crate::convert::{ConvertedImage, RGBA_BYTES};
use crate::error::{BridgeError, Result};

/// Uploads converted frames straight into `Rgba8Unorm` textures.
///
/// Handles are this backend's own ids; the host resolves them with
/// [`texture`](Self::texture) to bind the underlying `wgpu::Texture`.
pub struct WgpuTextureBackend {
    device: Arc<Device>,
    queue: Arc<Queue>,
    textures: ArcSwap<HashMap<u64, Arc<Texture>>>,
    next_id: AtomicU64,
}

impl WgpuTextureBackend {
    pub fn new(device: Arc<Device>, queue: Arc<Queue>) -> Self {
        Self {
            device,
            queue,
            textures: ArcSwap::from_pointee(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Requests a device without a surface, for hosts that render offscreen.
    #[instrument]
    pub async fn headless() -> Result<Self> {
        let instance = Instance::new(InstanceDescriptor {
            backends: Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BridgeError::Texture("no suitable GPU adapter found".into()))?;

        info!("GPU: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("camtex device"),
                    required_features: Features::empty(),
                    required_limits: Limits::downlevel_defaults(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| BridgeError::Texture(format!("request device: {e}")))?;

        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// The texture behind `handle`, while it is live.
    pub fn texture(&self, handle: TextureHandle) -> Option<Arc<Texture>> {
        self.textures.load().get(&handle.0).cloned()
    }
}

impl TextureBackend for WgpuTextureBackend {
    fn create(&self, desc: &TextureDesc) -> Result<TextureHandle> {
        let limit = self.device.limits().max_texture_dimension_2d;
        if desc.width == 0 || desc.height == 0 || desc.width > limit || desc.height > limit {
            return Err(BridgeError::Texture(format!(
                "{}: {}x{} outside 1..={limit}",
                desc.label, desc.width, desc.height
            )));
        }

        let texture = Arc::new(self.device.create_texture(&TextureDescriptor {
            label: Some(&desc.label),
            size: Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsages::TEXTURE_BINDING
                | TextureUsages::COPY_DST
                | TextureUsages::COPY_SRC,
            view_formats: &[],
        }));

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.textures.rcu(|map| {
            let mut map = HashMap::clone(map);
            map.insert(id, Arc::clone(&texture));
            map
        });
        debug!(id, label = %desc.label, "created {}x{} texture", desc.width, desc.height);
        Ok(TextureHandle(id))
    }

    fn upload(&self, handle: TextureHandle, image: &ConvertedImage) -> Result<()> {
        let texture = self
            .texture(handle)
            .ok_or_else(|| BridgeError::Texture(format!("{handle} is not live")))?;
        let size = texture.size();
        if (image.width, image.height) != (size.width, size.height) {
            return Err(BridgeError::Texture(format!(
                "{}x{} image does not fit {}x{} {handle}",
                image.width, image.height, size.width, size.height
            )));
        }

        self.queue.write_texture(
            ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: Origin3d::ZERO,
                aspect: TextureAspect::All,
            },
            &image.data,
            ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(image.stride as u32),
                rows_per_image: Some(image.height),
            },
            size,
        );
        Ok(())
    }

    fn read_back(&self, _handle: TextureHandle) -> Option<Vec<u8>> {
        // mapping a readback buffer would stall the caller on the GPU
        None
    }

    fn release(&self, handle: TextureHandle) {
        let mut removed = None;
        self.textures.rcu(|map| {
            let mut map = HashMap::clone(map);
            removed = map.remove(&handle.0);
            map
        });
        if let Some(texture) = removed {
            texture.destroy();
            debug!(id = handle.0, "destroyed texture");
        }
    }

    fn live_handles(&self) -> usize {
        self.textures.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Needs a GPU adapter; skipped where none is available.
    #[tokio::test]
    async fn create_upload_release() {
        let Ok(backend) = WgpuTextureBackend::headless().await else {
            return;
        };
        let handle = backend
            .create(&TextureDesc {
                label: "test".into(),
                width: 4,
                height: 2,
            })
            .unwrap();
        assert!(backend.texture(handle).is_some());

        let image = ConvertedImage {
            data: vec![255; 4 * 2 * RGBA_BYTES],
            width: 4,
            height: 2,
            stride: 4 * RGBA_BYTES,
            sequence: 1,
        };
        backend.upload(handle, &image).unwrap();
        assert!(backend.read_back(handle).is_none());

        backend.release(handle);
        backend.release(handle);
        assert_eq!(backend.live_handles(), 0);
        assert!(backend.upload(handle, &image).is_err());
    }
}
