//! Typed V4L2 control calls over the `v4l` kernel bindings.
//!
//! Every request is issued through [`v4l2::ioctl`] and reissued on EINTR.

use nix::errno::Errno;
use std::{ffi::c_void, io, mem, os::fd::RawFd};
use v4l::{
    buffer::Type,
    memory::Memory,
    v4l_sys::{
        v4l2_buffer, v4l2_capability, v4l2_format, v4l2_format__bindgen_ty_1, v4l2_pix_format,
        v4l2_requestbuffers,
    },
    v4l2::{self, vidioc},
};

/// Runs a control call, reissuing it for as long as it is interrupted by a
/// signal (EINTR).
pub fn retry_interrupted<F>(mut call: F) -> nix::Result<()>
where
    F: FnMut() -> nix::Result<()>,
{
    loop {
        match call() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

fn errno(e: io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(0))
}

/// # Safety
///
/// `request` must be a VIDIOC code whose argument type is `T`.
unsafe fn control<T>(fd: RawFd, request: vidioc::_IOC_TYPE, arg: &mut T) -> nix::Result<()> {
    let argp = arg as *mut T as *mut c_void;
    retry_interrupted(|| unsafe { v4l2::ioctl(fd, request, argp) }.map_err(errno))
}

/// A capture/mmap buffer descriptor, as QUERYBUF, QBUF and DQBUF expect.
pub fn capture_buffer(index: u32) -> v4l2_buffer {
    v4l2_buffer {
        index,
        type_: Type::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: plain C data; all-zero is the documented initial state.
        ..unsafe { mem::zeroed() }
    }
}

pub fn capture_request(count: u32) -> v4l2_requestbuffers {
    v4l2_requestbuffers {
        count,
        type_: Type::VideoCapture as u32,
        memory: Memory::Mmap as u32,
        // SAFETY: as above.
        ..unsafe { mem::zeroed() }
    }
}

pub fn capture_format(pix: v4l2_pix_format) -> v4l2_format {
    v4l2_format {
        type_: Type::VideoCapture as u32,
        fmt: v4l2_format__bindgen_ty_1 { pix },
    }
}

pub fn querycap(fd: RawFd) -> nix::Result<v4l2_capability> {
    // SAFETY: as above.
    let mut caps: v4l2_capability = unsafe { mem::zeroed() };
    // SAFETY: QUERYCAP fills a v4l2_capability.
    unsafe { control(fd, vidioc::VIDIOC_QUERYCAP, &mut caps) }?;
    Ok(caps)
}

pub fn s_fmt(fd: RawFd, format: &mut v4l2_format) -> nix::Result<()> {
    // SAFETY: S_FMT reads and writes a v4l2_format.
    unsafe { control(fd, vidioc::VIDIOC_S_FMT, format) }
}

pub fn reqbufs(fd: RawFd, request: &mut v4l2_requestbuffers) -> nix::Result<()> {
    // SAFETY: REQBUFS reads and writes a v4l2_requestbuffers.
    unsafe { control(fd, vidioc::VIDIOC_REQBUFS, request) }
}

pub fn querybuf(fd: RawFd, buffer: &mut v4l2_buffer) -> nix::Result<()> {
    // SAFETY: QUERYBUF reads and writes a single-planar v4l2_buffer.
    unsafe { control(fd, vidioc::VIDIOC_QUERYBUF, buffer) }
}

pub fn qbuf(fd: RawFd, buffer: &mut v4l2_buffer) -> nix::Result<()> {
    // SAFETY: as QUERYBUF.
    unsafe { control(fd, vidioc::VIDIOC_QBUF, buffer) }
}

pub fn dqbuf(fd: RawFd, buffer: &mut v4l2_buffer) -> nix::Result<()> {
    // SAFETY: as QUERYBUF.
    unsafe { control(fd, vidioc::VIDIOC_DQBUF, buffer) }
}

pub fn streamon(fd: RawFd) -> nix::Result<()> {
    let mut buffer_type = Type::VideoCapture as libc::c_int;
    // SAFETY: STREAMON reads the buffer type as an int.
    unsafe { control(fd, vidioc::VIDIOC_STREAMON, &mut buffer_type) }
}

pub fn streamoff(fd: RawFd) -> nix::Result<()> {
    let mut buffer_type = Type::VideoCapture as libc::c_int;
    // SAFETY: as STREAMON.
    unsafe { control(fd, vidioc::VIDIOC_STREAMOFF, &mut buffer_type) }
}

/// Decodes a NUL-padded fixed-size C string field.
pub fn c_str_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
