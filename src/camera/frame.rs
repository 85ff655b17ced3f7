//! Latest-frame cell
//!
//! Single writer (the acquisition loop), many readers (stream viewers).
//! Readers only ever see the newest frame; nothing is queued.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// An encoded JPEG frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub captured_at: Instant,
}

/// Shared slot for the most recent frame
#[derive(Debug, Clone, Default)]
pub struct LatestFrame {
    inner: Arc<RwLock<Option<Frame>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame, stamping it with the current time
    pub async fn store(&self, data: Bytes) -> Instant {
        let captured_at = Instant::now();
        *self.inner.write().await = Some(Frame { data, captured_at });
        captured_at
    }

    /// Cheap copy of the current frame (the payload is reference counted)
    pub async fn get(&self) -> Option<Frame> {
        self.inner.read().await.clone()
    }

    pub async fn clear(&self) {
        *self.inner.write().await = None;
    }
}
