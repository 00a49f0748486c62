pub mod frame;
pub mod pool;
pub mod synthetic;

pub use frame::{CapturedFrame, FrameBuffer, FrameMetadata, PixelFormat};
pub use pool::{FramePool, PoolStats};
pub use synthetic::SyntheticCamera;
