use crate::cancel::CancellationFlag;
use crate::channel::{ControlChannel, DequeuedBuffer, Readiness};
use crate::pool::BufferPool;
use crate::sink::{Frame, FrameSink};
use opentelemetry::{global, metrics::Counter};
use std::time::Duration;

/// Frames between two status lines.
const STATUS_INTERVAL: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

/// Counters for one capture session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    /// Frames handed to the sink successfully.
    pub frames: u64,
    pub timeouts: u64,
    pub interrupted_waits: u64,
    pub wait_failures: u64,
    pub dequeue_failures: u64,
    pub enqueue_failures: u64,
    pub sink_failures: u64,
    pub corrupt_frames: u64,
    /// Stranded buffers successfully handed back to the device.
    pub reclaimed: u64,
}

impl LoopStats {
    pub fn dropped(&self) -> u64 {
        self.dequeue_failures + self.sink_failures + self.corrupt_frames
    }
}

struct LoopMetrics {
    frames: Counter<u64>,
    timeouts: Counter<u64>,
    dropped: Counter<u64>,
}

impl LoopMetrics {
    fn new() -> Self {
        let meter = global::meter("capture");
        Self {
            frames: meter
                .u64_counter("capture.frames")
                .with_description("Frames delivered to the sink")
                .build(),
            timeouts: meter
                .u64_counter("capture.wait_timeouts")
                .with_description("Readiness waits that timed out")
                .build(),
            dropped: meter
                .u64_counter("capture.dropped")
                .with_description("Frames lost to dequeue, sink or driver errors")
                .build(),
        }
    }
}

/// The wait → dequeue → deliver → re-queue cycle.
///
/// Stops only when the cancellation flag is seen at the top of an iteration;
/// every per-iteration failure is logged and the loop carries on.
pub struct CaptureLoop {
    wait_timeout: Duration,
    stats: LoopStats,
    metrics: LoopMetrics,
}

impl CaptureLoop {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            wait_timeout,
            stats: LoopStats::default(),
            metrics: LoopMetrics::new(),
        }
    }

    pub fn run<C, S>(
        &mut self,
        channel: &mut C,
        pool: &mut BufferPool<C::Region>,
        sink: &mut S,
        cancel: &CancellationFlag,
    ) -> LoopStats
    where
        C: ControlChannel,
        S: FrameSink,
    {
        let _s = common::span_debug!("capture_loop");

        while self.step(channel, pool, sink, cancel) == LoopState::Running {}

        if let Err(e) = sink.flush() {
            tracing::warn!("Failed to flush frame sink: {}", e);
        }

        tracing::info!(
            "Shutdown: {} frames captured, {} dropped, {} wait timeouts.",
            self.stats.frames,
            self.stats.dropped(),
            self.stats.timeouts
        );
        self.stats
    }

    /// Runs a single iteration.
    pub fn step<C, S>(
        &mut self,
        channel: &mut C,
        pool: &mut BufferPool<C::Region>,
        sink: &mut S,
        cancel: &CancellationFlag,
    ) -> LoopState
    where
        C: ControlChannel,
        S: FrameSink,
    {
        if cancel.is_cancelled() {
            return LoopState::Stopped;
        }
        self.stats.iterations += 1;

        self.reclaim_stranded(channel, pool);

        match channel.wait_ready(self.wait_timeout) {
            Readiness::Ready => {}
            Readiness::Timeout => {
                self.stats.timeouts += 1;
                self.metrics.timeouts.add(1, &[]);
                tracing::trace!("No frame within {:?}", self.wait_timeout);
                return LoopState::Running;
            }
            Readiness::Interrupted => {
                self.stats.interrupted_waits += 1;
                return LoopState::Running;
            }
            Readiness::Failed(reason) => {
                self.stats.wait_failures += 1;
                tracing::warn!("Error waiting on video frame: {}", reason);
                return LoopState::Running;
            }
        }

        let buffer = match pool.dequeue(channel) {
            Ok(buffer) => buffer,
            Err(e) if e.is_transient() => {
                tracing::debug!("Woken without a frame: {}", e);
                return LoopState::Running;
            }
            Err(e) => {
                self.stats.dequeue_failures += 1;
                self.metrics.dropped.add(1, &[]);
                tracing::warn!("Failed to retrieve frame from device: {}", e);
                return LoopState::Running;
            }
        };

        self.deliver(pool, sink, &buffer);

        if let Err(e) = pool.enqueue(channel, buffer.index) {
            self.stats.enqueue_failures += 1;
            tracing::warn!("Error queueing buffer {}: {}", buffer.index, e);
        }

        LoopState::Running
    }

    fn deliver<R, S>(&mut self, pool: &BufferPool<R>, sink: &mut S, buffer: &DequeuedBuffer)
    where
        R: crate::channel::MappedRegion,
        S: FrameSink,
    {
        let span = tracing::debug_span!(
            "capture_frame",
            index = buffer.index,
            sequence = buffer.sequence
        );
        let _enter = span.enter();

        if buffer.corrupted {
            self.stats.corrupt_frames += 1;
            self.metrics.dropped.add(1, &[]);
            tracing::debug!("Driver flagged frame #{} as corrupt", buffer.sequence);
            return;
        }

        let Some(data) = pool.frame(buffer.index, buffer.bytes_used) else {
            return;
        };

        let frame = Frame {
            index: buffer.index,
            sequence: buffer.sequence,
            timestamp: buffer.timestamp,
            data,
        };

        match sink.consume(&frame) {
            Ok(()) => {
                self.stats.frames += 1;
                self.metrics.frames.add(1, &[]);
            }
            Err(e) => {
                self.stats.sink_failures += 1;
                self.metrics.dropped.add(1, &[]);
                tracing::warn!("Frame #{} sink error: {}", buffer.sequence, e);
            }
        }

        if self.stats.frames > 0 && self.stats.frames % STATUS_INTERVAL == 0 {
            tracing::debug!(
                "Status: [Frames: {}] [Dropped: {}] [Timeouts: {}] [V4L seq: {}]",
                self.stats.frames,
                self.stats.dropped(),
                self.stats.timeouts,
                buffer.sequence
            );
        }
    }

    /// Retries buffers whose re-queue failed so the device does not run dry.
    fn reclaim_stranded<C>(&mut self, channel: &mut C, pool: &mut BufferPool<C::Region>)
    where
        C: ControlChannel,
    {
        for index in pool.consumer_owned() {
            match pool.enqueue(channel, index) {
                Ok(()) => {
                    self.stats.reclaimed += 1;
                    tracing::info!("Re-queued stranded buffer {}", index);
                }
                Err(e) => tracing::debug!("Buffer {} still stranded: {}", index, e),
            }
        }
    }
}
