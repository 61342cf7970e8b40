use crate::config::PixelFormat;
use crate::pool::Owner;
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("cannot open capture device {}: {source}", path.display())]
    DeviceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("not a usable video capture device: {0}")]
    UnsupportedDevice(String),

    #[error("device rejected format {format} at {width}x{height}: {detail}")]
    UnsupportedFormat {
        format: PixelFormat,
        width: u32,
        height: u32,
        detail: String,
    },

    #[error("failed to allocate {requested} device buffer(s): {detail}")]
    BufferAllocationFailed { requested: u32, detail: String },

    #[error("failed to map buffer {index}: {detail}")]
    MappingFailed { index: u32, detail: String },

    #[error("failed to queue buffer {index}: {detail}")]
    QueueFailed { index: u32, detail: String },

    #[error("buffer {index} is {owner}-owned, cannot {operation}")]
    OwnershipViolation {
        index: u32,
        owner: Owner,
        operation: &'static str,
    },

    #[error("stream state error: {0}")]
    StreamStateError(String),

    #[error("no frame ready")]
    TemporaryUnavailable,

    #[error("teardown failed in {failures} step(s), first: {first}")]
    TeardownError {
        failures: usize,
        #[source]
        first: Box<CaptureError>,
    },
}

impl CaptureError {
    /// Lifecycle stage the error belongs to, for operator-facing messages.
    pub fn stage(&self) -> &'static str {
        match self {
            CaptureError::DeviceUnavailable { .. } => "open",
            CaptureError::UnsupportedDevice(_) => "capability query",
            CaptureError::UnsupportedFormat { .. } => "format negotiation",
            CaptureError::BufferAllocationFailed { .. } => "buffer allocation",
            CaptureError::MappingFailed { .. } => "buffer mapping",
            CaptureError::QueueFailed { .. } | CaptureError::OwnershipViolation { .. } => {
                "buffer queueing"
            }
            CaptureError::StreamStateError(_) => "stream control",
            CaptureError::TemporaryUnavailable => "capture",
            CaptureError::TeardownError { .. } => "teardown",
        }
    }

    /// Recoverable by waiting and trying again.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::TemporaryUnavailable)
    }
}
