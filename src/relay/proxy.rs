//! Raw byte forwarding from the overlay listener to the local broker

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Which side ended a forwarding pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    /// The client stopped sending (or its socket failed)
    Client,
    /// The backend stopped sending (or its socket failed)
    Backend,
    /// The relay is shutting down
    Shutdown,
}

/// Outcome of one forwarding pairing
#[derive(Debug)]
pub struct ForwardStats {
    pub closed_by: ClosedBy,
    /// Bytes copied by the direction that finished first
    pub bytes: u64,
}

/// Accept overlay connections until cancelled, pairing each with a fresh
/// connection to `target`.
pub async fn proxy_listener(
    listener: TcpListener,
    target: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let local = listener.local_addr().ok();
    info!("Proxy accepting on {:?} -> {}", local, target);

    loop {
        let (src, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Proxy accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let cancel = cancel.child_token();
        tracker.spawn(async move {
            let dst = match TcpStream::connect(target).await {
                Ok(dst) => dst,
                Err(e) => {
                    warn!("Failed to connect to broker backend {}: {}", target, e);
                    return;
                }
            };
            let _ = src.set_nodelay(true);
            let _ = dst.set_nodelay(true);

            match forward(src, dst, cancel).await {
                Ok(stats) => debug!(
                    "Proxy pairing for {} closed by {:?} after {} bytes",
                    peer, stats.closed_by, stats.bytes
                ),
                Err(e) => debug!("Proxy pairing for {} failed: {}", peer, e),
            }
        });
    }

    info!("Proxy on {:?} stopped", local);
}

/// Copy bytes in both directions until either direction finishes, errors, or
/// `cancel` fires; then shut down both write halves.
///
/// Both copy futures live in this task, so nothing outlives the pairing.
pub async fn forward<A, B>(src: A, dst: B, cancel: CancellationToken) -> io::Result<ForwardStats>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut src_rd, mut src_wr) = tokio::io::split(src);
    let (mut dst_rd, mut dst_wr) = tokio::io::split(dst);

    let outcome = {
        let upstream = tokio::io::copy(&mut src_rd, &mut dst_wr);
        let downstream = tokio::io::copy(&mut dst_rd, &mut src_wr);
        tokio::pin!(upstream, downstream);

        tokio::select! {
            result = &mut upstream => result.map(|bytes| ForwardStats { closed_by: ClosedBy::Client, bytes }),
            result = &mut downstream => result.map(|bytes| ForwardStats { closed_by: ClosedBy::Backend, bytes }),
            _ = cancel.cancelled() => Ok(ForwardStats { closed_by: ClosedBy::Shutdown, bytes: 0 }),
        }
    };

    let _ = src_wr.shutdown().await;
    let _ = dst_wr.shutdown().await;

    outcome
}
