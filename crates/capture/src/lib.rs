pub mod cancel;
pub mod capture_loop;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod sink;
pub mod sys;

pub use cancel::CancellationFlag;
pub use capture_loop::{CaptureLoop, LoopStats};
pub use channel::{Backend, ControlChannel, MappedRegion};
pub use config::{CaptureConfig, PixelFormat};
pub use device::{V4l2Backend, V4l2Device};
pub use error::CaptureError;
pub use lifecycle::CaptureSession;
pub use pool::{BufferPool, Owner};
pub use sink::{FileSink, FrameSink, ProgressSink};
