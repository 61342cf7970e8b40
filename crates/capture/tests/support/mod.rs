#![allow(dead_code)]

use capture::{
    CancellationFlag, CaptureConfig, CaptureError, PixelFormat,
    channel::{
        Backend, BufferPlacement, ControlChannel, DequeuedBuffer, DeviceCapabilities, Format,
        FormatRequest, MappedRegion, Readiness,
    },
    sink::{Frame, FrameSink},
};
use std::{
    cell::{Ref, RefCell},
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};
use v4l::capability::Flags;

pub const BUFFER_LEN: u32 = 64;
pub const BYTES_USED: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Open,
    QueryCapabilities,
    SetFormat,
    RequestBuffers(u32),
    Map(u32),
    Unmap(u32),
    Enqueue(u32),
    Dequeue(u32),
    StreamOn,
    StreamOff,
    Close,
}

/// Scripted device behaviour plus everything the device observed.
pub struct FakeState {
    pub capabilities: u32,
    pub formats: Vec<PixelFormat>,
    /// Frame size the device applies instead of the requested one.
    pub substitute_size: Option<(u32, u32)>,
    /// Buffers granted regardless of the request.
    pub grant: Option<u32>,
    pub fail_map_at: Option<u32>,
    /// Enqueue of this index fails while the stream is still off.
    pub fail_priming_enqueue_at: Option<u32>,
    pub fail_stream_on: bool,
    /// Stream off fails and leaves the device streaming.
    pub fail_stream_off: bool,
    /// Upcoming enqueue calls that fail while streaming.
    pub fail_next_enqueues: u32,
    pub open_failures: u32,
    /// Sequence numbers the driver flags as corrupt.
    pub corrupt_sequences: Vec<u32>,
    /// Readiness results, `Timeout` once exhausted.
    pub readiness: VecDeque<Readiness>,
    /// Set the flag during the n-th readiness wait (1-based).
    pub cancel_on_wait: Option<(usize, CancellationFlag)>,

    pub events: Vec<Event>,
    pub violations: Vec<String>,
    pub waits: usize,
    pub streaming: bool,
    queued: VecDeque<u32>,
    mapped: Vec<u32>,
    sequence: u32,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            capabilities: (Flags::VIDEO_CAPTURE | Flags::STREAMING).bits(),
            formats: vec![PixelFormat::Mjpeg, PixelFormat::Yuyv],
            substitute_size: None,
            grant: None,
            fail_map_at: None,
            fail_priming_enqueue_at: None,
            fail_stream_on: false,
            fail_stream_off: false,
            fail_next_enqueues: 0,
            open_failures: 0,
            corrupt_sequences: Vec::new(),
            readiness: VecDeque::new(),
            cancel_on_wait: None,
            events: Vec::new(),
            violations: Vec::new(),
            waits: 0,
            streaming: false,
            queued: VecDeque::new(),
            mapped: Vec::new(),
            sequence: 0,
        }
    }
}

impl FakeState {
    pub fn count(&self, wanted: impl Fn(&Event) -> bool) -> usize {
        self.events.iter().filter(|e| wanted(e)).count()
    }

    pub fn dequeues(&self) -> usize {
        self.count(|e| matches!(e, Event::Dequeue(_)))
    }

    pub fn enqueues(&self) -> usize {
        self.count(|e| matches!(e, Event::Enqueue(_)))
    }

    pub fn closes(&self) -> usize {
        self.count(|e| *e == Event::Close)
    }

    pub fn stream_ons(&self) -> usize {
        self.count(|e| *e == Event::StreamOn)
    }

    pub fn stream_offs(&self) -> usize {
        self.count(|e| *e == Event::StreamOff)
    }

    pub fn maps(&self) -> Vec<u32> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Map(i) => Some(*i),
                _ => None,
            })
            .collect()
    }

    pub fn unmaps(&self) -> Vec<u32> {
        let mut unmaps: Vec<u32> = self
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Unmap(i) => Some(*i),
                _ => None,
            })
            .collect();
        unmaps.sort_unstable();
        unmaps
    }

    pub fn position(&self, event: Event) -> Option<usize> {
        self.events.iter().position(|e| *e == event)
    }

    pub fn still_mapped(&self) -> &[u32] {
        &self.mapped
    }
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Rc<RefCell<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(configure: impl FnOnce(&mut FakeState)) -> Self {
        let backend = Self::new();
        configure(&mut backend.state.borrow_mut());
        backend
    }

    pub fn state(&self) -> Ref<'_, FakeState> {
        self.state.borrow()
    }
}

impl Backend for FakeBackend {
    type Channel = FakeChannel;

    fn open(&self, path: &Path) -> Result<FakeChannel, CaptureError> {
        let mut state = self.state.borrow_mut();
        state.events.push(Event::Open);
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(CaptureError::DeviceUnavailable {
                path: path.to_path_buf(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        Ok(FakeChannel {
            state: Rc::clone(&self.state),
        })
    }
}

pub struct FakeChannel {
    state: Rc<RefCell<FakeState>>,
}

impl ControlChannel for FakeChannel {
    type Region = FakeRegion;

    fn query_capabilities(&mut self) -> Result<DeviceCapabilities, CaptureError> {
        let mut state = self.state.borrow_mut();
        state.events.push(Event::QueryCapabilities);
        Ok(DeviceCapabilities {
            driver: "fakecam".to_string(),
            card: "Fake Camera".to_string(),
            bus_info: "platform:fakecam".to_string(),
            capabilities: state.capabilities,
        })
    }

    fn negotiate_format(&mut self, request: &FormatRequest) -> Result<Format, CaptureError> {
        let mut state = self.state.borrow_mut();
        state.events.push(Event::SetFormat);
        if !state.formats.contains(&request.pixel_format) {
            return Err(CaptureError::UnsupportedFormat {
                format: request.pixel_format,
                width: request.width,
                height: request.height,
                detail: "EINVAL: Invalid argument".to_string(),
            });
        }
        let (width, height) = state
            .substitute_size
            .unwrap_or((request.width, request.height));
        Ok(Format {
            fourcc: request.pixel_format.fourcc(),
            width,
            height,
            size_image: BUFFER_LEN,
        })
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, CaptureError> {
        let mut state = self.state.borrow_mut();
        state.events.push(Event::RequestBuffers(count));
        Ok(state.grant.unwrap_or(count))
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferPlacement, CaptureError> {
        Ok(BufferPlacement {
            index,
            offset: index * BUFFER_LEN,
            length: BUFFER_LEN,
        })
    }

    fn map_buffer(&mut self, placement: &BufferPlacement) -> Result<FakeRegion, CaptureError> {
        let mut state = self.state.borrow_mut();
        if state.fail_map_at == Some(placement.index) {
            return Err(CaptureError::MappingFailed {
                index: placement.index,
                detail: "mmap: ENOMEM: Cannot allocate memory".to_string(),
            });
        }
        state.events.push(Event::Map(placement.index));
        state.mapped.push(placement.index);
        Ok(FakeRegion {
            index: placement.index,
            data: vec![placement.index as u8; placement.length as usize],
            state: Rc::clone(&self.state),
        })
    }

    fn enqueue_buffer(&mut self, index: u32) -> Result<(), CaptureError> {
        let mut state = self.state.borrow_mut();
        if !state.streaming && state.fail_priming_enqueue_at == Some(index) {
            return Err(CaptureError::QueueFailed {
                index,
                detail: "VIDIOC_QBUF: EINVAL: Invalid argument".to_string(),
            });
        }
        if state.streaming && state.fail_next_enqueues > 0 {
            state.fail_next_enqueues -= 1;
            return Err(CaptureError::QueueFailed {
                index,
                detail: "VIDIOC_QBUF: EIO: Input/output error".to_string(),
            });
        }
        if state.queued.contains(&index) {
            state
                .violations
                .push(format!("buffer {} enqueued twice", index));
        }
        state.events.push(Event::Enqueue(index));
        state.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<DequeuedBuffer, CaptureError> {
        let mut state = self.state.borrow_mut();
        if !state.streaming {
            return Err(CaptureError::StreamStateError(
                "VIDIOC_DQBUF: EINVAL: Invalid argument".to_string(),
            ));
        }
        let index = state
            .queued
            .pop_front()
            .ok_or(CaptureError::TemporaryUnavailable)?;
        let sequence = state.sequence;
        state.sequence += 1;
        state.events.push(Event::Dequeue(index));
        Ok(DequeuedBuffer {
            index,
            bytes_used: BYTES_USED,
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33),
            corrupted: state.corrupt_sequences.contains(&sequence),
        })
    }

    fn set_streaming(&mut self, on: bool) -> Result<(), CaptureError> {
        let mut state = self.state.borrow_mut();
        state.events.push(if on { Event::StreamOn } else { Event::StreamOff });
        if on && state.fail_stream_on {
            return Err(CaptureError::StreamStateError(
                "VIDIOC_STREAMON: EIO: Input/output error".to_string(),
            ));
        }
        if !on && state.fail_stream_off {
            return Err(CaptureError::StreamStateError(
                "VIDIOC_STREAMOFF: EBUSY: Device or resource busy".to_string(),
            ));
        }
        state.streaming = on;
        if !on {
            state.queued.clear();
        }
        Ok(())
    }

    fn wait_ready(&self, _timeout: Duration) -> Readiness {
        let mut state = self.state.borrow_mut();
        state.waits += 1;
        if let Some((n, flag)) = &state.cancel_on_wait
            && *n == state.waits
        {
            flag.cancel();
        }
        state.readiness.pop_front().unwrap_or(Readiness::Timeout)
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        self.state.borrow_mut().events.push(Event::Close);
        Ok(())
    }
}

pub struct FakeRegion {
    index: u32,
    data: Vec<u8>,
    state: Rc<RefCell<FakeState>>,
}

impl MappedRegion for FakeRegion {
    fn as_slice(&self) -> &[u8] {
        let mut state = self.state.borrow_mut();
        if state.queued.contains(&self.index) {
            let violation = format!("buffer {} read while queued on the device", self.index);
            state.violations.push(violation);
        }
        &self.data
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn unmap(self) -> Result<(), CaptureError> {
        let mut state = self.state.borrow_mut();
        if state.streaming {
            let violation = format!("buffer {} unmapped while streaming", self.index);
            state.violations.push(violation);
        }
        if state.queued.contains(&self.index) {
            let violation = format!("buffer {} unmapped while queued on the device", self.index);
            state.violations.push(violation);
        }
        state.events.push(Event::Unmap(self.index));
        state.mapped.retain(|i| *i != self.index);
        Ok(())
    }
}

/// Keeps a copy of every frame it is handed.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Vec<(u32, u32, Vec<u8>)>,
    pub fail: bool,
    pub flushed: bool,
}

impl FrameSink for RecordingSink {
    fn consume(&mut self, frame: &Frame<'_>) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::other("sink is full"));
        }
        self.frames
            .push((frame.index, frame.sequence, frame.data.to_vec()));
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushed = true;
        Ok(())
    }
}

pub fn config(pixel_format: PixelFormat) -> CaptureConfig {
    CaptureConfig {
        device: PathBuf::from("/dev/video-fake"),
        pixel_format,
        width: 320,
        height: 240,
        buffer_count: 4,
        wait_timeout: Duration::from_millis(10),
        open_attempts: 1,
    }
}

pub fn ready(times: usize) -> VecDeque<Readiness> {
    std::iter::repeat_n(Readiness::Ready, times).collect()
}
