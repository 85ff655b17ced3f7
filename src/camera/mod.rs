//! Camera Service
//!
//! One capture session at a time, fanned out to any number of HTTP viewers
//! through a single latest-frame cell.

mod discovery;
mod driver;
mod frame;
mod service;
mod stream;
mod yuyv;

pub use discovery::{CameraDevice, DeviceRegistry};
pub use driver::{default_driver, CaptureDriver, FrameSource};
#[cfg(feature = "v4l2")]
pub use driver::V4lDriver;
pub use frame::{Frame, LatestFrame};
pub use service::{CameraService, CaptureConfig, SessionState};
pub use stream::{encode_part, StreamViewer, BOUNDARY, CONTENT_TYPE, FRAME_INTERVAL};
pub use yuyv::{encode_yuyv_jpeg, yuyv_to_rgb};

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Capture resolution
pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;

/// JPEG quality for software-encoded frames
pub const JPEG_QUALITY: u8 = 75;

/// Errors from the camera subsystem
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("No camera devices found")]
    NoDevices,

    #[error("Failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Format negotiation failed on {path:?}: requested {requested} {width}x{height}, device offers {actual}")]
    Format {
        path: PathBuf,
        requested: PixelFormat,
        width: u32,
        height: u32,
        actual: String,
    },

    #[error("Unknown pixel format '{0}' (expected mjpeg or yuyv)")]
    UnknownFormat(String),

    #[error("Short YUYV frame: {got} bytes, expected {expected}")]
    ShortFrame { got: usize, expected: usize },

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Camera capture not available: {0}")]
    Unsupported(&'static str),
}

/// Pixel format negotiated with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// Frames are already JPEG and are passed through
    #[default]
    Mjpeg,
    /// Packed 4:2:2, encoded to JPEG in software
    Yuyv,
}

impl PixelFormat {
    /// V4L2 FourCC code
    pub fn fourcc(&self) -> &'static [u8; 4] {
        match self {
            Self::Mjpeg => b"MJPG",
            Self::Yuyv => b"YUYV",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mjpeg => write!(f, "mjpeg"),
            Self::Yuyv => write!(f, "yuyv"),
        }
    }
}

impl FromStr for PixelFormat {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mjpeg" | "mjpg" | "" => Ok(Self::Mjpeg),
            "yuyv" => Ok(Self::Yuyv),
            other => Err(CameraError::UnknownFormat(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_parse() {
        assert_eq!("yuyv".parse::<PixelFormat>().unwrap(), PixelFormat::Yuyv);
        assert_eq!("YUYV".parse::<PixelFormat>().unwrap(), PixelFormat::Yuyv);
        assert_eq!("mjpeg".parse::<PixelFormat>().unwrap(), PixelFormat::Mjpeg);
        assert!(matches!(
            "h264".parse::<PixelFormat>(),
            Err(CameraError::UnknownFormat(_))
        ));
        assert_eq!(PixelFormat::Yuyv.fourcc(), b"YUYV");
    }
}
