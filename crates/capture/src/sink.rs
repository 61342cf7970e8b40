use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
    time::Duration,
};

/// A dequeued frame, borrowed from the device buffer until it is re-queued.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub index: u32,
    pub sequence: u32,
    pub timestamp: Duration,
    pub data: &'a [u8],
}

/// Downstream consumer of captured frames.
///
/// Called synchronously between dequeue and re-queue, so the frame data must
/// be copied out if it is needed afterwards.
pub trait FrameSink {
    fn consume(&mut self, frame: &Frame<'_>) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn consume(&mut self, frame: &Frame<'_>) -> io::Result<()> {
        (**self).consume(frame)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Prints one `.` per frame, for interactive runs.
pub struct ProgressSink<W: Write> {
    out: W,
}

impl ProgressSink<io::Stderr> {
    pub fn stderr() -> Self {
        Self { out: io::stderr() }
    }
}

impl<W: Write> ProgressSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> FrameSink for ProgressSink<W> {
    fn consume(&mut self, _frame: &Frame<'_>) -> io::Result<()> {
        self.out.write_all(b".")?;
        self.out.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// Appends raw frame payloads to a file. Concatenated MJPEG frames play back
/// as-is; H264 output is an Annex-B elementary stream.
pub struct FileSink {
    writer: BufWriter<File>,
    bytes_written: u64,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl FrameSink for FileSink {
    fn consume(&mut self, frame: &Frame<'_>) -> io::Result<()> {
        self.writer.write_all(frame.data)?;
        self.bytes_written += frame.data.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
