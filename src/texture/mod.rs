//! Texture Slot: pre-allocated textures and the triple-buffer handoff between
//! the capture thread and the host render thread

pub mod backend;
pub mod cpu;
pub mod gpu;
pub mod slots;

pub use backend::{TextureBackend, TextureDesc, TextureHandle};
pub use cpu::CpuTextureBackend;
pub use gpu::WgpuTextureBackend;
pub use slots::{ReadSlot, SlotReader, SlotState, SlotWriter, TextureSlots};

/// Fewer slots cannot keep writer and reader apart while one frame is pending.
pub const MIN_SLOTS: usize = 3;
/// The slot index is packed into eight bits of the shared word.
pub const MAX_SLOTS: usize = 8;
