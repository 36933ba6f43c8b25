pub mod backoff;
pub mod buffer;
pub mod capture_loop;
pub mod processing;
pub mod state;

pub use backoff::Backoff;
pub use buffer::{BufferStats, FrameBuffer};
pub use capture_loop::CaptureLoop;
pub use processing::{build_stage, Grayscale, Passthrough, ProcessingStage, ResizeToWidth, StageChain};
pub use state::{ConnectionState, StatusEvent, StatusObserver};
