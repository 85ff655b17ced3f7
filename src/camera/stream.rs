//! Multipart MJPEG streaming
//!
//! Each viewer polls the latest-frame cell on a fixed cadence and sends a
//! frame only when its capture time differs from the last one sent.

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info};

use super::service::CameraService;

/// Multipart boundary token
pub const BOUNDARY: &str = "frame";

/// Response content type for the stream
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Poll cadence (~25 fps)
pub const FRAME_INTERVAL: Duration = Duration::from_millis(40);

/// One multipart part: boundary, headers, JPEG bytes, trailing CRLF
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Per-connection streaming state
pub struct StreamViewer {
    service: CameraService,
    peer: Option<SocketAddr>,
    ticker: Interval,
    last_sent: Option<Instant>,
    parts: u64,
}

impl StreamViewer {
    pub fn new(service: CameraService, peer: Option<SocketAddr>) -> Self {
        let mut ticker = interval(FRAME_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Stream viewer {:?} connected", peer);

        Self {
            service,
            peer,
            ticker,
            last_sent: None,
            parts: 0,
        }
    }

    /// Wait for the next unseen frame and return it as a multipart part.
    /// `None` once the camera service shuts down.
    pub async fn next_part(&mut self) -> Option<Bytes> {
        let shutdown = self.service.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = self.ticker.tick() => {}
            }

            let Some(frame) = self.service.latest().get().await else {
                continue;
            };
            if self.last_sent == Some(frame.captured_at) {
                continue;
            }

            self.last_sent = Some(frame.captured_at);
            self.parts += 1;
            return Some(encode_part(&frame.data));
        }
    }

    /// Parts sent so far
    pub fn parts_sent(&self) -> u64 {
        self.parts
    }

    /// Adapt into a body stream; the viewer is dropped when the client goes away
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        futures::stream::unfold(self, |mut viewer| async move {
            let part = viewer.next_part().await?;
            Some((Ok(part), viewer))
        })
    }
}

impl Drop for StreamViewer {
    fn drop(&mut self) {
        debug!("Stream viewer {:?} disconnected after {} parts", self.peer, self.parts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::service::tests::{one_camera_registry, FakeDriver};
    use crate::camera::{CaptureConfig, DeviceRegistry};
    use futures::StreamExt;
    use std::sync::Arc;

    #[test]
    fn test_part_layout() {
        let part = encode_part(b"JPEG");
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4\r\n\r\nJPEG\r\n"
        );
    }

    #[tokio::test]
    async fn test_no_part_before_first_frame() {
        let dir = tempfile::tempdir().unwrap();
        let service = CameraService::new(
            Arc::new(FakeDriver::new(vec![])),
            DeviceRegistry::new(dir.path(), "/dev"),
            CaptureConfig::default(),
        );
        let mut viewer = StreamViewer::new(service, None);

        let waited = tokio::time::timeout(Duration::from_millis(150), viewer.next_part()).await;
        assert!(waited.is_err(), "no part may be sent before any frame exists");
        assert_eq!(viewer.parts_sent(), 0);
    }

    #[tokio::test]
    async fn test_unchanged_frame_not_resent() {
        let dir = tempfile::tempdir().unwrap();
        let service = CameraService::new(
            Arc::new(FakeDriver::new(vec![])),
            DeviceRegistry::new(dir.path(), "/dev"),
            CaptureConfig::default(),
        );
        service.latest().store(Bytes::from_static(b"A")).await;

        let mut viewer = StreamViewer::new(service.clone(), None);
        let first = viewer.next_part().await.unwrap();
        assert!(first.ends_with(b"A\r\n"));

        // Same frame: nothing new within several ticks
        let waited = tokio::time::timeout(Duration::from_millis(150), viewer.next_part()).await;
        assert!(waited.is_err());

        service.latest().store(Bytes::from_static(b"B")).await;
        let second = tokio::time::timeout(Duration::from_secs(1), viewer.next_part())
            .await
            .unwrap()
            .unwrap();
        assert!(second.ends_with(b"B\r\n"));
        assert_eq!(viewer.parts_sent(), 2);
    }

    #[tokio::test]
    async fn test_parts_never_repeat_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let service = CameraService::new(
            Arc::new(FakeDriver::new(b"\xff\xd8".to_vec())),
            one_camera_registry(dir.path()),
            CaptureConfig::default(),
        );
        service.start_capture(None).await.unwrap();

        let mut viewer = StreamViewer::new(service.clone(), None);
        let mut seen = Vec::new();
        for _ in 0..5 {
            tokio::time::timeout(Duration::from_secs(1), viewer.next_part())
                .await
                .unwrap()
                .unwrap();
            seen.push(viewer.last_sent.unwrap());
        }
        for pair in seen.windows(2) {
            assert!(pair[1] > pair[0]);
        }

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_ends_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let service = CameraService::new(
            Arc::new(FakeDriver::new(vec![])),
            DeviceRegistry::new(dir.path(), "/dev"),
            CaptureConfig::default(),
        );
        let mut stream = Box::pin(StreamViewer::new(service.clone(), None).into_stream());

        service.shutdown().await;
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
