use clap::Parser;
use std::{fmt, path::PathBuf, str::FromStr, time::Duration};
use v4l::{FourCC, format::FieldOrder};

pub use common::Environment;

const FOURCC_MJPG: FourCC = FourCC { repr: *b"MJPG" };
const FOURCC_H264: FourCC = FourCC { repr: *b"H264" };
const FOURCC_YUYV: FourCC = FourCC { repr: *b"YUYV" };

pub const DEFAULT_DEVICE: &str = "/dev/video0";
pub const DEFAULT_BUFFER_COUNT: u32 = 4;
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
/// Longest wait a single poll(2) call can express.
pub const MAX_WAIT_TIMEOUT_MS: u64 = i32::MAX as u64;

/// Capture formats the tool knows how to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Mjpeg,
    H264,
    Yuyv,
}

impl PixelFormat {
    pub fn fourcc(&self) -> FourCC {
        match self {
            PixelFormat::Mjpeg => FOURCC_MJPG,
            PixelFormat::H264 => FOURCC_H264,
            PixelFormat::Yuyv => FOURCC_YUYV,
        }
    }

    /// Field order requested alongside the format.
    pub fn field(&self) -> FieldOrder {
        match self {
            PixelFormat::H264 => FieldOrder::Interlaced,
            PixelFormat::Mjpeg | PixelFormat::Yuyv => FieldOrder::Progressive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::H264 => "h264",
            PixelFormat::Yuyv => "yuyv",
        }
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mjpeg" | "mjpg" => Ok(PixelFormat::Mjpeg),
            "h264" => Ok(PixelFormat::H264),
            "yuyv" => Ok(PixelFormat::Yuyv),
            other => Err(format!(
                "pixel format {} is unsupported (expected mjpeg, h264 or yuyv)",
                other
            )),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame geometry in pixels, written `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FromStr for FrameSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("frame size {} is not of the form WIDTHxHEIGHT", s))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| format!("invalid frame dimension {:?} in {}", v, s))
        };
        Ok(Self {
            width: parse(w)?,
            height: parse(h)?,
        })
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Everything the device lifecycle needs to run a capture session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device: PathBuf,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
    pub wait_timeout: Duration,
    pub open_attempts: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            pixel_format: PixelFormat::H264,
            width: 320,
            height: 240,
            buffer_count: DEFAULT_BUFFER_COUNT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            open_attempts: 1,
        }
    }
}

/// Capture raw frames from a V4L2 device until interrupted (Ctrl+C).
#[derive(Debug, Parser)]
#[command(name = "capture", version, about)]
pub struct Cli {
    /// Where the video camera is mounted, typically /dev/videoN
    #[arg(short, long, env = "CAPTURE_DEVICE", default_value = DEFAULT_DEVICE)]
    pub device: PathBuf,

    /// Capture format: mjpeg, h264 or yuyv
    #[arg(short, long, env = "CAPTURE_FORMAT", default_value = "h264")]
    pub format: PixelFormat,

    /// Frame size as WIDTHxHEIGHT
    #[arg(short = 's', long, env = "CAPTURE_FRAME_SIZE", default_value = "320x240")]
    pub frame_size: FrameSize,

    /// Number of device buffers to request (the device may grant fewer)
    #[arg(long, env = "CAPTURE_BUFFERS", default_value_t = DEFAULT_BUFFER_COUNT)]
    pub buffers: u32,

    /// Readiness wait timeout in milliseconds
    #[arg(
        long,
        env = "CAPTURE_WAIT_TIMEOUT_MS",
        default_value_t = 2000,
        value_parser = clap::value_parser!(u64).range(1..=MAX_WAIT_TIMEOUT_MS)
    )]
    pub wait_timeout_ms: u64,

    /// Attempts to open the device before giving up
    #[arg(long, env = "CAPTURE_OPEN_ATTEMPTS", default_value_t = 1)]
    pub open_attempts: u32,

    /// Append raw frames to this file instead of printing progress dots
    #[arg(short, long, env = "CAPTURE_OUTPUT")]
    pub output: Option<PathBuf>,

    /// OTLP collector endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,
}

impl Cli {
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.device.clone(),
            pixel_format: self.format,
            width: self.frame_size.width,
            height: self.frame_size.height,
            buffer_count: self.buffers,
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            open_attempts: self.open_attempts,
        }
    }
}
