use crate::channel::{
    Backend, BufferPlacement, ControlChannel, DequeuedBuffer, DeviceCapabilities, Format,
    FormatRequest, MappedRegion, Readiness,
};
use crate::error::CaptureError;
use crate::sys;
use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::mman::{MapFlags, ProtFlags, mmap, munmap},
    unistd,
};
use std::{
    ffi::c_void,
    fs::OpenOptions,
    io,
    mem::{self, ManuallyDrop},
    num::NonZeroUsize,
    os::{
        fd::{AsFd, AsRawFd, OwnedFd, RawFd},
        unix::fs::{FileTypeExt, OpenOptionsExt},
    },
    path::{Path, PathBuf},
    ptr::NonNull,
    time::Duration,
};
use v4l::{
    FourCC, buffer::Flags as BufferFlags, capability::Flags as CapabilityFlags,
    timestamp::Timestamp, v4l_sys::v4l2_pix_format,
};

/// Opens real `/dev/video*` nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Backend;

impl Backend for V4l2Backend {
    type Channel = V4l2Device;

    fn open(&self, path: &Path) -> Result<V4l2Device, CaptureError> {
        V4l2Device::open(path)
    }
}

/// An open V4L2 capture node driven through raw ioctls.
pub struct V4l2Device {
    path: PathBuf,
    fd: Option<OwnedFd>,
}

fn unavailable(path: &Path, source: io::Error) -> CaptureError {
    CaptureError::DeviceUnavailable {
        path: path.to_path_buf(),
        source,
    }
}

impl V4l2Device {
    /// Opens the node read-write and non-blocking.
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| unavailable(path, e))?;

        let metadata = file.metadata().map_err(|e| unavailable(path, e))?;
        if !metadata.file_type().is_char_device() {
            return Err(unavailable(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a character device"),
            ));
        }

        tracing::debug!("Opened {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            fd: Some(OwnedFd::from(file)),
        })
    }

    fn raw_fd(&self) -> Result<RawFd, CaptureError> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| self.closed())
    }

    fn closed(&self) -> CaptureError {
        CaptureError::StreamStateError(format!("{} is closed", self.path.display()))
    }
}

impl ControlChannel for V4l2Device {
    type Region = MmapRegion;

    fn query_capabilities(&mut self) -> Result<DeviceCapabilities, CaptureError> {
        let fd = self.raw_fd()?;
        let caps = sys::querycap(fd).map_err(|e| {
            CaptureError::UnsupportedDevice(format!(
                "{}: VIDIOC_QUERYCAP failed: {}",
                self.path.display(),
                e
            ))
        })?;

        let reported = CapabilityFlags::from(caps.capabilities);
        let capabilities = if reported.contains(CapabilityFlags::DEVICE_CAPS) {
            caps.device_caps
        } else {
            caps.capabilities
        };

        Ok(DeviceCapabilities {
            driver: sys::c_str_field(&caps.driver),
            card: sys::c_str_field(&caps.card),
            bus_info: sys::c_str_field(&caps.bus_info),
            capabilities,
        })
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<Format, CaptureError> {
        let fd = self.raw_fd()?;
        let mut format = sys::capture_format(v4l2_pix_format {
            width: request.width,
            height: request.height,
            pixelformat: request.pixel_format.fourcc().into(),
            field: request.pixel_format.field() as u32,
            // SAFETY: plain C data; the driver fills in the rest.
            ..unsafe { mem::zeroed() }
        });

        sys::s_fmt(fd, &mut format).map_err(|e| CaptureError::UnsupportedFormat {
            format: request.pixel_format,
            width: request.width,
            height: request.height,
            detail: format!("VIDIOC_S_FMT: {}", e),
        })?;

        // SAFETY: S_FMT on a capture buffer type fills the `pix` member.
        let pix = unsafe { format.fmt.pix };
        Ok(Format {
            fourcc: FourCC::from(pix.pixelformat),
            width: pix.width,
            height: pix.height,
            size_image: pix.sizeimage,
        })
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, CaptureError> {
        let fd = self.raw_fd()?;
        let mut request = sys::capture_request(count);

        sys::reqbufs(fd, &mut request).map_err(|e| CaptureError::BufferAllocationFailed {
            requested: count,
            detail: format!("VIDIOC_REQBUFS: {}", e),
        })?;

        Ok(request.count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferPlacement, CaptureError> {
        let fd = self.raw_fd()?;
        let mut buffer = sys::capture_buffer(index);

        sys::querybuf(fd, &mut buffer).map_err(|e| CaptureError::MappingFailed {
            index,
            detail: format!("VIDIOC_QUERYBUF: {}", e),
        })?;

        Ok(BufferPlacement {
            index,
            // SAFETY: the mmap memory type reports its placement in `offset`.
            offset: unsafe { buffer.m.offset },
            length: buffer.length,
        })
    }

    fn map_buffer(&mut self, placement: &BufferPlacement) -> Result<MmapRegion, CaptureError> {
        let index = placement.index;
        let fd = self.fd.as_ref().ok_or_else(|| self.closed())?;
        let length =
            NonZeroUsize::new(placement.length as usize).ok_or_else(|| {
                CaptureError::MappingFailed {
                    index,
                    detail: "device reported a zero-length buffer".to_string(),
                }
            })?;

        // SAFETY: maps a fresh region chosen by the kernel; nothing else aliases it.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                placement.offset as libc::off_t,
            )
        }
        .map_err(|e| CaptureError::MappingFailed {
            index,
            detail: format!("mmap: {}", e),
        })?;

        Ok(MmapRegion {
            index,
            ptr,
            len: length.get(),
        })
    }

    fn enqueue_buffer(&mut self, index: u32) -> Result<(), CaptureError> {
        let fd = self.raw_fd()?;
        let mut buffer = sys::capture_buffer(index);

        sys::qbuf(fd, &mut buffer).map_err(|e| CaptureError::QueueFailed {
            index,
            detail: format!("VIDIOC_QBUF: {}", e),
        })
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer, CaptureError> {
        let fd = self.raw_fd()?;
        let mut buffer = sys::capture_buffer(0);

        sys::dqbuf(fd, &mut buffer).map_err(|e| match e {
            Errno::EAGAIN => CaptureError::TemporaryUnavailable,
            e => CaptureError::StreamStateError(format!("VIDIOC_DQBUF: {}", e)),
        })?;

        let stamp = Timestamp::from(buffer.timestamp);
        let secs = stamp.sec.max(0) as u64;
        let micros = stamp.usec.clamp(0, 999_999) as u32;

        Ok(DequeuedBuffer {
            index: buffer.index,
            bytes_used: buffer.bytesused,
            sequence: buffer.sequence,
            timestamp: Duration::new(secs, micros * 1_000),
            corrupted: BufferFlags::from(buffer.flags).contains(BufferFlags::ERROR),
        })
    }

    fn set_streaming(&mut self, on: bool) -> Result<(), CaptureError> {
        let fd = self.raw_fd()?;
        let (name, result) = if on {
            ("VIDIOC_STREAMON", sys::streamon(fd))
        } else {
            ("VIDIOC_STREAMOFF", sys::streamoff(fd))
        };

        result.map_err(|e| CaptureError::StreamStateError(format!("{}: {}", name, e)))
    }

    fn wait_ready(&self, timeout: Duration) -> Readiness {
        let Some(fd) = self.fd.as_ref() else {
            return Readiness::Failed(format!("{} is closed", self.path.display()));
        };

        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        let Ok(poll_timeout) = PollTimeout::try_from(timeout) else {
            return Readiness::Failed(format!("wait timeout {:?} is out of range", timeout));
        };

        match poll(&mut fds, poll_timeout) {
            Ok(0) => Readiness::Timeout,
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.contains(PollFlags::POLLIN) {
                    Readiness::Ready
                } else {
                    Readiness::Failed(format!("poll returned {:?}", revents))
                }
            }
            Err(Errno::EINTR) => Readiness::Interrupted,
            Err(e) => Readiness::Failed(e.to_string()),
        }
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };

        unistd::close(fd).map_err(|e| {
            CaptureError::StreamStateError(format!("closing {}: {}", self.path.display(), e))
        })?;

        tracing::debug!("Closed {}", self.path.display());
        Ok(())
    }
}

/// One device buffer mapped shared and read-write into this process.
pub struct MmapRegion {
    index: u32,
    ptr: NonNull<c_void>,
    len: usize,
}

impl MappedRegion for MmapRegion {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping stays valid until `unmap` or drop consumes `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    fn unmap(self) -> Result<(), CaptureError> {
        let region = ManuallyDrop::new(self);
        // SAFETY: `ptr`/`len` came from a successful mmap and are unmapped once.
        unsafe { munmap(region.ptr, region.len) }.map_err(|e| CaptureError::MappingFailed {
            index: region.index,
            detail: format!("munmap: {}", e),
        })
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!("Failed to unmap buffer {}: {}", self.index, e);
        }
    }
}
