//! Capture session management
//!
//! The service owns at most one capture session. Start/stop transitions are
//! serialised by the session lock; frame reads and writes only touch the
//! [`LatestFrame`] cell, so viewers never wait on a start or stop.

use bytes::Bytes;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::discovery::{CameraDevice, DeviceRegistry};
use super::driver::{CaptureDriver, FrameSource};
use super::frame::LatestFrame;
use super::yuyv::encode_yuyv_jpeg;
use super::{CameraError, PixelFormat, HEIGHT, JPEG_QUALITY, WIDTH};

/// Frames logged individually after a session starts
const LOGGED_FIRST_FRAMES: u64 = 5;

/// Interval between periodic frame-count logs
const LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Frames buffered between the blocking reader and the acquisition loop
const RAW_FRAME_QUEUE: usize = 2;

/// Capture parameters
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Number of mmap buffers requested from the driver
    pub buffers: u32,
    pub jpeg_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::Mjpeg,
            width: WIDTH,
            height: HEIGHT,
            buffers: 4,
            jpeg_quality: JPEG_QUALITY,
        }
    }
}

/// Lifecycle of the capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Running,
    Stopping,
}

struct ActiveSession {
    device: CameraDevice,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    driver: Arc<dyn CaptureDriver>,
    registry: DeviceRegistry,
    config: CaptureConfig,
    latest: LatestFrame,
    session: Mutex<Option<ActiveSession>>,
    state: watch::Sender<SessionState>,
    active: watch::Sender<Option<CameraDevice>>,
    shutdown: CancellationToken,
}

/// Shared handle to the camera service
#[derive(Clone)]
pub struct CameraService {
    inner: Arc<Inner>,
}

impl CameraService {
    pub fn new(driver: Arc<dyn CaptureDriver>, registry: DeviceRegistry, config: CaptureConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (active, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                driver,
                registry,
                config,
                latest: LatestFrame::new(),
                session: Mutex::new(None),
                state,
                active,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Enumerate capture devices
    pub fn discover(&self) -> io::Result<Vec<CameraDevice>> {
        self.inner.registry.discover()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.inner.config
    }

    /// The shared latest-frame cell
    pub fn latest(&self) -> &LatestFrame {
        &self.inner.latest
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch session state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Cancelled once the service is shutting down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Device of the running session, if any. Never waits on a start or stop.
    pub fn active_device(&self) -> Option<CameraDevice> {
        self.inner.active.borrow().clone()
    }

    /// Start capturing from `device`, or from the first discovered device.
    ///
    /// A no-op when a session is already running. On failure no session is
    /// left behind, so the call can simply be retried.
    pub async fn start_capture(&self, device: Option<&Path>) -> Result<(), CameraError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CameraError::Unsupported("camera service is shut down"));
        }

        let mut session = self.inner.session.lock().await;
        if let Some(active) = session.as_ref() {
            if !active.task.is_finished() {
                return Ok(());
            }
            debug!("Clearing finished capture session on {:?}", active.device.path);
        }
        *session = None;

        // Discovery reads sysfs
        let lookup = {
            let registry = self.inner.registry.clone();
            let requested = device.map(Path::to_path_buf);
            tokio::task::spawn_blocking(move || match requested {
                Some(path) => Ok(Some(registry.describe(&path))),
                None => registry.discover().map(|devices| devices.into_iter().next()),
            })
            .await
        };
        let device = match lookup {
            Ok(Ok(Some(device))) => device,
            Ok(Ok(None)) => return Err(CameraError::NoDevices),
            Ok(Err(source)) => {
                return Err(CameraError::Open {
                    path: "video4linux".into(),
                    source,
                })
            }
            Err(join_err) => {
                return Err(CameraError::Open {
                    path: "video4linux".into(),
                    source: io::Error::new(io::ErrorKind::Other, join_err.to_string()),
                })
            }
        };

        self.inner.state.send_replace(SessionState::Opening);
        info!(
            "Opening camera {} ({:?}) as {} {}x{}",
            device.name, device.path, self.inner.config.format, self.inner.config.width, self.inner.config.height
        );

        let opened = {
            let driver = self.inner.driver.clone();
            let path = device.path.clone();
            let config = self.inner.config.clone();
            tokio::task::spawn_blocking(move || driver.open(&path, &config)).await
        };

        let source = match opened {
            Ok(Ok(source)) => source,
            Ok(Err(e)) => {
                self.inner.state.send_replace(SessionState::Idle);
                return Err(e);
            }
            Err(join_err) => {
                self.inner.state.send_replace(SessionState::Idle);
                return Err(CameraError::Open {
                    path: device.path.clone(),
                    source: io::Error::new(io::ErrorKind::Other, join_err.to_string()),
                });
            }
        };

        let cancel = self.inner.shutdown.child_token();
        let task = tokio::spawn(acquisition_loop(self.inner.clone(), source, cancel.clone()));

        self.inner.active.send_replace(Some(device.clone()));
        self.inner.state.send_replace(SessionState::Running);
        info!("Camera {} running", device.name);

        *session = Some(ActiveSession {
            device,
            cancel,
            task,
        });
        Ok(())
    }

    /// Stop the running session and wait until the device is released
    pub async fn stop_capture(&self) {
        let mut session = self.inner.session.lock().await;
        let Some(active) = session.take() else {
            return;
        };

        self.inner.state.send_replace(SessionState::Stopping);
        active.cancel.cancel();
        if let Err(e) = active.task.await {
            warn!("Acquisition task for {:?} failed: {}", active.device.path, e);
        }
        self.inner.active.send_replace(None);
        self.inner.state.send_replace(SessionState::Idle);
        info!("Camera {} stopped", active.device.name);
    }

    /// End every viewer and stop capturing
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.stop_capture().await;
    }
}

/// Logs the first few frames, then a count every [`LOG_INTERVAL`]
struct FrameLog {
    frames: u64,
    skipped: u64,
    last_log: Instant,
}

impl FrameLog {
    fn new() -> Self {
        Self {
            frames: 0,
            skipped: 0,
            last_log: Instant::now(),
        }
    }

    fn stored(&mut self, bytes: usize) {
        self.frames += 1;
        if self.frames <= LOGGED_FIRST_FRAMES {
            info!("Captured frame {} ({} bytes)", self.frames, bytes);
        } else if self.last_log.elapsed() >= LOG_INTERVAL {
            info!("Captured {} frames ({} skipped)", self.frames, self.skipped);
            self.last_log = Instant::now();
        }
    }

    fn skipped(&mut self, err: &CameraError) {
        self.skipped += 1;
        if self.skipped == 1 || self.last_log.elapsed() >= LOG_INTERVAL {
            warn!("Skipping frame: {} ({} skipped so far)", err, self.skipped);
            self.last_log = Instant::now();
        }
    }
}

async fn acquisition_loop(inner: Arc<Inner>, source: Box<dyn FrameSource>, cancel: CancellationToken) {
    let (tx, mut rx) = mpsc::channel::<io::Result<Vec<u8>>>(RAW_FRAME_QUEUE);

    let reader_cancel = cancel.clone();
    let reader = tokio::task::spawn_blocking(move || {
        let mut source = source;
        while !reader_cancel.is_cancelled() {
            let frame = source.next_frame();
            let failed = frame.is_err();
            if tx.blocking_send(frame).is_err() || failed {
                break;
            }
        }
        // Dropping the source releases the device
    });

    let config = inner.config.clone();
    let mut log = FrameLog::new();

    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            raw = rx.recv() => raw,
        };

        let data = match raw {
            Some(Ok(data)) => data,
            Some(Err(e)) => {
                warn!("Frame capture failed: {}", e);
                break;
            }
            None => break,
        };

        let jpeg = match config.format {
            PixelFormat::Mjpeg => Bytes::from(data),
            PixelFormat::Yuyv => {
                match encode_yuyv_jpeg(&data, config.width, config.height, config.jpeg_quality) {
                    Ok(jpeg) => Bytes::from(jpeg),
                    Err(e) => {
                        log.skipped(&e);
                        continue;
                    }
                }
            }
        };

        let len = jpeg.len();
        inner.latest.store(jpeg).await;
        log.stored(len);
    }

    let stopped_by_request = cancel.is_cancelled();
    cancel.cancel();
    drop(rx);
    if let Err(e) = reader.await {
        warn!("Frame reader thread failed: {}", e);
    }

    info!("Acquisition loop exited after {} frames", log.frames);

    // Viewers must not be served a frame from a session that has ended
    inner.latest.clear().await;

    // Ended on its own: the session is finished and a later start may
    // replace it. A requested stop reports Idle from stop_capture.
    if !stopped_by_request {
        inner.active.send_replace(None);
        inner.state.send_replace(SessionState::Idle);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Produces a fixed frame every few milliseconds
    pub(crate) struct FakeSource {
        frame: Vec<u8>,
        interval: Duration,
        remaining: Option<usize>,
    }

    impl FrameSource for FakeSource {
        fn next_frame(&mut self) -> io::Result<Vec<u8>> {
            if let Some(remaining) = self.remaining.as_mut() {
                if *remaining == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "device unplugged"));
                }
                *remaining -= 1;
            }
            std::thread::sleep(self.interval);
            Ok(self.frame.clone())
        }
    }

    /// Counts opens; fails the first `fail_first` of them
    pub(crate) struct FakeDriver {
        pub opens: AtomicUsize,
        pub fail_first: usize,
        pub frame: Vec<u8>,
        pub frames_per_session: Option<usize>,
        pub opened_paths: StdMutex<Vec<std::path::PathBuf>>,
        pub open_delay: Duration,
    }

    impl FakeDriver {
        pub(crate) fn new(frame: Vec<u8>) -> Self {
            Self {
                opens: AtomicUsize::new(0),
                fail_first: 0,
                frame,
                frames_per_session: None,
                opened_paths: StdMutex::new(Vec::new()),
                open_delay: Duration::ZERO,
            }
        }
    }

    impl CaptureDriver for FakeDriver {
        fn open(&self, device: &Path, _config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CameraError> {
            std::thread::sleep(self.open_delay);
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(CameraError::Open {
                    path: device.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "busy"),
                });
            }
            self.opened_paths.lock().unwrap().push(device.to_path_buf());
            Ok(Box::new(FakeSource {
                frame: self.frame.clone(),
                interval: Duration::from_millis(5),
                remaining: self.frames_per_session,
            }))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    /// A sysfs tree with one camera, `/dev/video0`
    pub(crate) fn one_camera_registry(dir: &Path) -> DeviceRegistry {
        let node = dir.join("class/video4linux/video0");
        fs::create_dir_all(&node).unwrap();
        fs::write(node.join("name"), "Test Camera\n").unwrap();
        DeviceRegistry::new(dir, "/dev")
    }

    async fn wait_for_frame(service: &CameraService) -> crate::camera::Frame {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(frame) = service.latest().get().await {
                    return frame;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frame should arrive")
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(b"\xff\xd8jpeg".to_vec()));
        let service = CameraService::new(driver.clone(), one_camera_registry(dir.path()), CaptureConfig::default());

        service.start_capture(None).await.unwrap();
        service.start_capture(None).await.unwrap();
        assert_eq!(driver.opens.load(Ordering::SeqCst), 1);
        assert_eq!(service.state(), SessionState::Running);
        assert_eq!(
            service.active_device().map(|d| d.name),
            Some("Test Camera".to_string())
        );

        let frame = wait_for_frame(&service).await;
        assert_eq!(&frame.data[..], b"\xff\xd8jpeg");

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_starts_open_once() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![1, 2, 3]));
        let service = CameraService::new(driver.clone(), one_camera_registry(dir.path()), CaptureConfig::default());

        let (a, b) = tokio::join!(service.start_capture(None), service.start_capture(None));
        a.unwrap();
        b.unwrap();
        assert_eq!(driver.opens.load(Ordering::SeqCst), 1);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_then_restart() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![0xff, 0xd8]));
        let service = CameraService::new(driver.clone(), one_camera_registry(dir.path()), CaptureConfig::default());

        service.start_capture(None).await.unwrap();
        wait_for_frame(&service).await;

        tokio::time::timeout(Duration::from_secs(1), service.stop_capture())
            .await
            .expect("stop should finish promptly");
        assert_eq!(service.state(), SessionState::Idle);
        assert!(service.active_device().is_none());

        service.start_capture(None).await.unwrap();
        assert_eq!(driver.opens.load(Ordering::SeqCst), 2);
        assert_eq!(service.state(), SessionState::Running);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_clears_latest_frame() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![0xff, 0xd8]));
        let service = CameraService::new(driver, one_camera_registry(dir.path()), CaptureConfig::default());

        service.start_capture(None).await.unwrap();
        wait_for_frame(&service).await;
        service.stop_capture().await;

        assert!(service.latest().get().await.is_none());
        let mut viewer = crate::camera::StreamViewer::new(service.clone(), None);
        let waited = tokio::time::timeout(Duration::from_millis(150), viewer.next_part()).await;
        assert!(waited.is_err(), "a viewer after stop must not get the old frame");

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_active_device_readable_while_opening() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = FakeDriver::new(vec![0xff]);
        driver.open_delay = Duration::from_millis(300);
        let service = CameraService::new(Arc::new(driver), one_camera_registry(dir.path()), CaptureConfig::default());

        let starting = {
            let service = service.clone();
            tokio::spawn(async move { service.start_capture(None).await })
        };
        let mut state = service.subscribe_state();
        state.wait_for(|s| *s == SessionState::Opening).await.unwrap();

        // The open holds the session lock; these reads must not wait for it
        let read = tokio::time::timeout(Duration::from_millis(50), async {
            (service.active_device(), service.state())
        })
        .await
        .expect("lock-free read");
        assert_eq!(read, (None, SessionState::Opening));

        starting.await.unwrap().unwrap();
        assert!(service.active_device().is_some());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_failure_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = FakeDriver::new(vec![0xff, 0xd8]);
        driver.fail_first = 1;
        let driver = Arc::new(driver);
        let service = CameraService::new(driver.clone(), one_camera_registry(dir.path()), CaptureConfig::default());

        assert!(service.start_capture(None).await.is_err());
        assert_eq!(service.state(), SessionState::Idle);
        assert!(service.active_device().is_none());

        service.start_capture(None).await.unwrap();
        assert_eq!(driver.opens.load(Ordering::SeqCst), 2);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_devices() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![]));
        let service = CameraService::new(driver.clone(), DeviceRegistry::new(dir.path(), "/dev"), CaptureConfig::default());

        assert!(matches!(service.start_capture(None).await, Err(CameraError::NoDevices)));
        assert_eq!(driver.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_explicit_device() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![0xff]));
        let service = CameraService::new(driver.clone(), one_camera_registry(dir.path()), CaptureConfig::default());

        service.start_capture(Some(Path::new("/dev/video7"))).await.unwrap();
        assert_eq!(
            driver.opened_paths.lock().unwrap().as_slice(),
            &[std::path::PathBuf::from("/dev/video7")]
        );

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_source_failure_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = FakeDriver::new(vec![0xff, 0xd8]);
        driver.frames_per_session = Some(2);
        let driver = Arc::new(driver);
        let service = CameraService::new(driver.clone(), one_camera_registry(dir.path()), CaptureConfig::default());

        let mut state = service.subscribe_state();
        service.start_capture(None).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == SessionState::Idle))
            .await
            .expect("session should end")
            .unwrap();
        assert!(service.active_device().is_none());
        assert!(service.latest().get().await.is_none(), "stale frame must be cleared");

        // The finished session does not block a new one
        service.start_capture(None).await.unwrap();
        assert_eq!(driver.opens.load(Ordering::SeqCst), 2);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_yuyv_frames_are_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let (width, height) = (64u32, 48u32);
        let yuyv = [90u8, 128, 90, 128].repeat((width * height / 2) as usize);

        let driver = Arc::new(FakeDriver::new(yuyv));
        let config = CaptureConfig {
            format: PixelFormat::Yuyv,
            width,
            height,
            ..Default::default()
        };
        let service = CameraService::new(driver, one_camera_registry(dir.path()), config);

        service.start_capture(None).await.unwrap();
        let frame = wait_for_frame(&service).await;
        let decoded = image::load_from_memory_with_format(&frame.data, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (width, height));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_short_yuyv_frames_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(FakeDriver::new(vec![0u8; 100]));
        let config = CaptureConfig {
            format: PixelFormat::Yuyv,
            ..Default::default()
        };
        let service = CameraService::new(driver, one_camera_registry(dir.path()), config);

        service.start_capture(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(service.latest().get().await.is_none());
        assert_eq!(service.state(), SessionState::Running);

        service.shutdown().await;
    }
}
