//! Capture device drivers
//!
//! A [`CaptureDriver`] opens a device node and negotiates the format; the
//! resulting [`FrameSource`] is read on a blocking thread until dropped.
//! Dropping the source releases the device.

use std::io;
use std::path::Path;
use std::sync::Arc;

use super::service::CaptureConfig;
use super::CameraError;

/// An open, streaming device
pub trait FrameSource: Send {
    /// Block until the next frame is available and return its bytes
    fn next_frame(&mut self) -> io::Result<Vec<u8>>;
}

/// Opens devices
pub trait CaptureDriver: Send + Sync {
    /// Open `device`, negotiate `config.format` at the configured size and
    /// start streaming. Blocking.
    fn open(&self, device: &Path, config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CameraError>;

    /// Human-readable name for this driver
    fn name(&self) -> &'static str;
}

/// Driver used when the binary is built without V4L2 support
#[cfg(not(feature = "v4l2"))]
struct UnavailableDriver;

#[cfg(not(feature = "v4l2"))]
impl CaptureDriver for UnavailableDriver {
    fn open(&self, _device: &Path, _config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CameraError> {
        Err(CameraError::Unsupported("built without the v4l2 feature"))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

/// The platform driver
pub fn default_driver() -> Arc<dyn CaptureDriver> {
    #[cfg(feature = "v4l2")]
    {
        Arc::new(V4lDriver)
    }
    #[cfg(not(feature = "v4l2"))]
    {
        Arc::new(UnavailableDriver)
    }
}

#[cfg(feature = "v4l2")]
pub use v4l2::V4lDriver;

#[cfg(feature = "v4l2")]
mod v4l2 {
    use std::io;
    use std::path::Path;
    use std::time::Duration;

    use tracing::info;
    use v4l::buffer::Type;
    use v4l::io::mmap::Stream;
    use v4l::io::traits::CaptureStream;
    use v4l::video::Capture;
    use v4l::{Device, FourCC};

    use super::{CaptureDriver, FrameSource};
    use crate::camera::service::CaptureConfig;
    use crate::camera::CameraError;

    /// Upper bound on waiting for one frame
    const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

    /// V4L2 driver using memory-mapped streaming
    pub struct V4lDriver;

    struct V4lSource {
        // Field order matters: the stream must be dropped before the device
        stream: Stream<'static>,
        _device: Device,
    }

    impl FrameSource for V4lSource {
        fn next_frame(&mut self) -> io::Result<Vec<u8>> {
            let (buf, meta) = self.stream.next()?;
            let used = (meta.bytesused as usize).min(buf.len());
            Ok(buf[..used].to_vec())
        }
    }

    impl CaptureDriver for V4lDriver {
        fn open(&self, path: &Path, config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CameraError> {
            let open_err = |source: io::Error| CameraError::Open {
                path: path.to_path_buf(),
                source,
            };

            let device = Device::with_path(path).map_err(open_err)?;

            let requested = FourCC::new(config.format.fourcc());
            let mut format = device.format().map_err(open_err)?;
            format.width = config.width;
            format.height = config.height;
            format.fourcc = requested;
            let actual = device.set_format(&format).map_err(open_err)?;

            if actual.fourcc != requested || actual.width != config.width || actual.height != config.height {
                return Err(CameraError::Format {
                    path: path.to_path_buf(),
                    requested: config.format,
                    width: config.width,
                    height: config.height,
                    actual: format!("{} {}x{}", actual.fourcc, actual.width, actual.height),
                });
            }

            let mut stream = Stream::with_buffers(&device, Type::VideoCapture, config.buffers)
                .map_err(open_err)?;
            stream.set_timeout(FRAME_TIMEOUT);

            info!(
                "Opened {:?}: {} {}x{} with {} buffers",
                path, actual.fourcc, actual.width, actual.height, config.buffers
            );

            Ok(Box::new(V4lSource {
                stream,
                _device: device,
            }))
        }

        fn name(&self) -> &'static str {
            "v4l2"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "v4l2"))]
    #[test]
    fn test_default_driver_without_v4l2() {
        let driver = default_driver();
        assert_eq!(driver.name(), "unavailable");
        let err = driver
            .open(Path::new("/dev/video0"), &CaptureConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, CameraError::Unsupported(_)));
    }

    #[cfg(feature = "v4l2")]
    #[test]
    fn test_default_driver_is_v4l2() {
        let driver = default_driver();
        assert_eq!(driver.name(), "v4l2");

        let dir = tempfile::tempdir().unwrap();
        let err = driver
            .open(&dir.path().join("video9"), &CaptureConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, CameraError::Open { .. }));
    }
}
