use crate::config::PixelFormat;
use crate::error::CaptureError;
use std::{path::Path, time::Duration};
use v4l::{FourCC, capability::Flags};

/// What the device reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    /// Raw capability bits of the opened node (device caps when the driver
    /// reports them).
    pub capabilities: u32,
}

impl DeviceCapabilities {
    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.capabilities)
    }

    pub fn can_capture(&self) -> bool {
        self.flags().contains(Flags::VIDEO_CAPTURE)
    }

    pub fn can_stream(&self) -> bool {
        self.flags().contains(Flags::STREAMING)
    }
}

/// Format the caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

/// Format the device actually applied, which may differ from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
    pub size_image: u32,
}

impl Format {
    pub fn matches(&self, request: &FormatRequest) -> bool {
        self.fourcc == request.pixel_format.fourcc()
            && self.width == request.width
            && self.height == request.height
    }
}

/// Where a device buffer lives in the device's mmap space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPlacement {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

/// A filled buffer handed back by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
    pub timestamp: Duration,
    /// The driver flagged the frame data as corrupt.
    pub corrupted: bool,
}

/// Outcome of one bounded readiness wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Timeout,
    /// A signal arrived before anything else happened.
    Interrupted,
    Failed(String),
}

/// A device buffer mapped into the process.
pub trait MappedRegion {
    fn as_slice(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the mapping. Consumes the region so it cannot be read after.
    fn unmap(self) -> Result<(), CaptureError>;
}

/// Request/response control of an open capture device.
///
/// Implementations retry EINTR internally; callers never see it.
pub trait ControlChannel {
    type Region: MappedRegion;

    fn query_capabilities(&mut self) -> Result<DeviceCapabilities, CaptureError>;

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<Format, CaptureError>;

    /// Returns the number of buffers the device actually allocated.
    fn request_buffers(&mut self, count: u32) -> Result<u32, CaptureError>;

    fn query_buffer(&mut self, index: u32) -> Result<BufferPlacement, CaptureError>;

    fn map_buffer(&mut self, placement: &BufferPlacement) -> Result<Self::Region, CaptureError>;

    fn enqueue_buffer(&mut self, index: u32) -> Result<(), CaptureError>;

    /// Fails with [`CaptureError::TemporaryUnavailable`] when no frame is ready.
    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer, CaptureError>;

    fn set_streaming(&mut self, on: bool) -> Result<(), CaptureError>;

    fn wait_ready(&self, timeout: Duration) -> Readiness;

    /// Releases the handle. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), CaptureError>;
}

/// Opens control channels; the seam between the lifecycle and real hardware.
pub trait Backend {
    type Channel: ControlChannel;

    fn open(&self, path: &Path) -> Result<Self::Channel, CaptureError>;
}
