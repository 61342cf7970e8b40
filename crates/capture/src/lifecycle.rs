use crate::cancel::CancellationFlag;
use crate::capture_loop::{CaptureLoop, LoopStats};
use crate::channel::{Backend, ControlChannel, Format, FormatRequest};
use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::pool::BufferPool;
use crate::sink::FrameSink;
use common::{RetryPolicy, retry_with_backoff};
use std::time::Duration;

/// Base delay between two attempts to open the device.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

/// An open, configured and streaming capture device.
///
/// Teardown stops the stream, unmaps every buffer and closes the handle, in
/// that order. It runs at most once: explicitly through
/// [`CaptureSession::shutdown`], otherwise on drop. A failed open tears down
/// whatever was acquired before returning the error. The stream is stopped
/// whenever any buffer is still queued, even if streaming never started, and
/// buffers the device did not give back stay mapped.
pub struct CaptureSession<C: ControlChannel> {
    channel: C,
    pool: BufferPool<C::Region>,
    format: Option<Format>,
    wait_timeout: Duration,
    streaming: bool,
    torn_down: bool,
}

impl<C: ControlChannel> CaptureSession<C> {
    pub fn open<B>(backend: &B, config: &CaptureConfig) -> Result<Self, CaptureError>
    where
        B: Backend<Channel = C>,
    {
        let _s = common::span!("open_capture_device");

        let policy = RetryPolicy {
            max_attempts: config.open_attempts,
            base_delay: OPEN_RETRY_DELAY,
        };
        let channel = retry_with_backoff(
            || backend.open(&config.device),
            &policy,
            "Opening capture device",
            |e| matches!(e, CaptureError::DeviceUnavailable { .. }),
        )?;

        let mut session = Self {
            channel,
            pool: BufferPool::empty(),
            format: None,
            wait_timeout: config.wait_timeout,
            streaming: false,
            torn_down: false,
        };

        // On error the session is dropped here, which releases what was acquired.
        session.configure(config)?;
        Ok(session)
    }

    fn configure(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        let caps = self.channel.query_capabilities()?;
        tracing::info!(
            "Device {}: {} (driver {}, bus {})",
            config.device.display(),
            caps.card,
            caps.driver,
            caps.bus_info
        );
        if !caps.can_capture() {
            return Err(CaptureError::UnsupportedDevice(format!(
                "{} ({}) does not support video capture",
                caps.card, caps.driver
            )));
        }
        if !caps.can_stream() {
            return Err(CaptureError::UnsupportedDevice(format!(
                "{} ({}) does not support streaming I/O",
                caps.card, caps.driver
            )));
        }

        let request = FormatRequest {
            pixel_format: config.pixel_format,
            width: config.width,
            height: config.height,
        };
        let format = self.channel.negotiate_format(&request)?;
        if !format.matches(&request) {
            tracing::warn!(
                "Device substituted {} {}x{} for requested {} {}x{}",
                format.fourcc,
                format.width,
                format.height,
                request.pixel_format,
                request.width,
                request.height
            );
        }
        self.format = Some(format);

        if config.buffer_count == 0 {
            return Err(CaptureError::BufferAllocationFailed {
                requested: 0,
                detail: "at least one buffer is required".to_string(),
            });
        }
        let granted = self.channel.request_buffers(config.buffer_count)?;
        if granted == 0 {
            return Err(CaptureError::BufferAllocationFailed {
                requested: config.buffer_count,
                detail: "device granted no buffers".to_string(),
            });
        }
        if granted != config.buffer_count {
            tracing::info!(
                "Requested {} buffers, device granted {}",
                config.buffer_count,
                granted
            );
        }

        self.pool = BufferPool::establish(&mut self.channel, granted)?;
        self.pool.enqueue_all(&mut self.channel)?;

        self.channel.set_streaming(true)?;
        self.streaming = true;

        tracing::info!(
            "Streaming {} {}x{} ({} bytes/frame) with {} buffers",
            format.fourcc,
            format.width,
            format.height,
            format.size_image,
            self.pool.len()
        );
        Ok(())
    }

    /// The format the device applied.
    pub fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    pub fn pool(&self) -> &BufferPool<C::Region> {
        &self.pool
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Runs the capture loop until `cancel` is set.
    pub fn run_capture<S: FrameSink>(
        &mut self,
        sink: &mut S,
        cancel: &CancellationFlag,
    ) -> Result<LoopStats, CaptureError> {
        if !self.streaming {
            return Err(CaptureError::StreamStateError(
                "capture session is not streaming".to_string(),
            ));
        }

        let mut capture_loop = CaptureLoop::new(self.wait_timeout);
        Ok(capture_loop.run(&mut self.channel, &mut self.pool, sink, cancel))
    }

    /// Tears the session down and reports the first failure, if any.
    ///
    /// Every step is attempted even when an earlier one fails.
    pub fn shutdown(mut self) -> Result<(), CaptureError> {
        let failures = self.teardown();
        let count = failures.len();

        match failures.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(CaptureError::TeardownError {
                failures: count,
                first: Box::new(first),
            }),
        }
    }

    fn teardown(&mut self) -> Vec<CaptureError> {
        if self.torn_down {
            return Vec::new();
        }
        self.torn_down = true;

        let mut failures = Vec::new();

        let queued = self.pool.device_owned();
        if self.streaming || !queued.is_empty() {
            self.streaming = false;
            match self.channel.set_streaming(false) {
                Ok(()) => {
                    tracing::debug!("Stream stopped, {} buffer(s) returned", queued.len());
                    self.pool.reclaim_all();
                }
                Err(e) => {
                    tracing::warn!("Failed to stop stream: {}", e);
                    failures.push(e);
                }
            }
        }

        failures.extend(self.pool.release());

        if let Err(e) = self.channel.close() {
            tracing::warn!("Failed to close capture device: {}", e);
            failures.push(e);
        }

        failures
    }
}

impl<C: ControlChannel> Drop for CaptureSession<C> {
    fn drop(&mut self) {
        if !self.torn_down {
            tracing::debug!("Tearing down capture session on drop");
            self.teardown();
        }
    }
}

/// Opens the configured device, captures until cancelled and tears down.
///
/// A capture error takes precedence over a teardown error.
pub fn run<B, S>(
    backend: &B,
    config: &CaptureConfig,
    sink: &mut S,
    cancel: &CancellationFlag,
) -> Result<LoopStats, CaptureError>
where
    B: Backend,
    S: FrameSink,
{
    let mut session = CaptureSession::open(backend, config)?;
    let stats = session.run_capture(sink, cancel);
    let teardown = session.shutdown();

    let stats = stats?;
    teardown?;
    Ok(stats)
}
