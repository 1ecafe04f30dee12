pub mod driver;
pub mod frame;
pub mod pool;
pub mod source;
pub mod synthetic;
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub mod v4l2;

pub use driver::{
    CameraDescriptor, CameraDriver, Facing, FaultHook, FrameSink, NegotiatedFormat, SourceEvent,
    StreamRequest,
};
pub use frame::{Frame, FrameMetadata, Orientation, PixelFormat, PlaneLayout};
pub use pool::{FramePool, InFlightQueue, PooledBuffer};
pub use source::FrameSource;
pub use synthetic::{SyntheticConfig, SyntheticControl, SyntheticDriver};
#[cfg(all(feature = "v4l2", target_os = "linux"))]
pub use v4l2::V4l2Driver;
