use std::fmt;

use crate::convert::ConvertedImage;
use crate::error::Result;

/// Opaque texture id handed to the host engine. `0` means "no texture".
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

impl TextureHandle {
    pub const NULL: TextureHandle = TextureHandle(0);

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tex#{}", self.0)
    }
}

/// RGBA8 texture to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
}

/// Where converted frames end up: GPU textures in production, memory in tests.
///
/// `upload` runs on the capture thread, everything else on the controller or
/// the render thread; implementations must not block on each other.
pub trait TextureBackend: Send + Sync {
    fn create(&self, desc: &TextureDesc) -> Result<TextureHandle>;

    /// Replaces the whole texture with `image`, which must match its size.
    fn upload(&self, handle: TextureHandle, image: &ConvertedImage) -> Result<()>;

    /// Tightly packed RGBA bytes, when the backend can read them on the CPU.
    fn read_back(&self, handle: TextureHandle) -> Option<Vec<u8>>;

    /// Releases the texture. Unknown or already released handles are ignored.
    fn release(&self, handle: TextureHandle);

    fn live_handles(&self) -> usize;
}
