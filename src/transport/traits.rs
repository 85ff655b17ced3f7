//! Link trait abstraction for pluggable telemetry transports

use async_trait::async_trait;
use std::io;

/// Receiving half of a telemetry link
#[async_trait]
pub trait LinkReader: Send {
    /// Read the next chunk of bytes. `Ok(0)` means the link closed.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Sending half of a telemetry link
#[async_trait]
pub trait LinkWriter: Send {
    /// Write one complete encoded frame
    async fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// An open link, split into halves so reads never wait behind writes
pub struct Link {
    pub reader: Box<dyn LinkReader>,
    pub writer: Box<dyn LinkWriter>,
    /// Human-readable description for logs
    pub name: String,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("name", &self.name).finish()
    }
}
