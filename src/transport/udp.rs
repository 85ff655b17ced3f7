//! UDP server link
//!
//! Binds a local address and learns peers from inbound datagrams. Outbound
//! frames go to every peer heard from recently; with no peers they are
//! dropped.

use crate::transport::traits::{Link, LinkReader, LinkWriter};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 65_507;

/// Most peers kept at once; the least recently heard is evicted
const MAX_PEERS: usize = 16;

/// Peers silent for longer than this stop receiving frames
const PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Peers learned from inbound datagrams, with when each was last heard
#[derive(Debug, Default)]
struct PeerTable {
    peers: Vec<(SocketAddr, Instant)>,
}

impl PeerTable {
    fn seen(&mut self, addr: SocketAddr, now: Instant) {
        if let Some(entry) = self.peers.iter_mut().find(|(peer, _)| *peer == addr) {
            entry.1 = now;
            return;
        }

        info!("UDP peer {} joined", addr);
        if self.peers.len() >= MAX_PEERS {
            if let Some(oldest) = self
                .peers
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, last))| *last)
                .map(|(i, _)| i)
            {
                let (evicted, _) = self.peers.swap_remove(oldest);
                debug!("UDP peer table full, evicted {}", evicted);
            }
        }
        self.peers.push((addr, now));
    }

    /// Drop expired peers and return the rest
    fn active(&mut self, now: Instant) -> Vec<SocketAddr> {
        self.peers.retain(|(peer, last)| {
            let live = now.saturating_duration_since(*last) <= PEER_TIMEOUT;
            if !live {
                info!("UDP peer {} expired", peer);
            }
            live
        });
        self.peers.iter().map(|(peer, _)| *peer).collect()
    }
}

type Peers = Arc<RwLock<PeerTable>>;

struct UdpReader {
    socket: Arc<UdpSocket>,
    peers: Peers,
    scratch: Vec<u8>,
}

struct UdpWriter {
    socket: Arc<UdpSocket>,
    peers: Peers,
}

#[async_trait]
impl LinkReader for UdpReader {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (n, from) = self.socket.recv_from(&mut self.scratch).await?;
            self.peers.write().await.seen(from, Instant::now());

            // Empty datagrams would read as end-of-link
            if n == 0 {
                continue;
            }

            let len = n.min(buf.len());
            buf[..len].copy_from_slice(&self.scratch[..len]);
            if len < n {
                debug!("Truncated {}-byte datagram from {} to {}", n, from, len);
            }
            return Ok(len);
        }
    }
}

#[async_trait]
impl LinkWriter for UdpWriter {
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let peers = self.peers.write().await.active(Instant::now());
        for peer in peers {
            if let Err(e) = self.socket.send_to(frame, peer).await {
                debug!("UDP send to {} failed: {}", peer, e);
            }
        }
        Ok(())
    }
}

/// Bind a UDP server link
pub async fn bind_udp(address: &str) -> io::Result<Link> {
    let socket = Arc::new(UdpSocket::bind(address).await?);
    let local = socket.local_addr()?;
    let peers: Peers = Arc::new(RwLock::new(PeerTable::default()));

    Ok(Link {
        reader: Box::new(UdpReader {
            socket: socket.clone(),
            peers: peers.clone(),
            scratch: vec![0u8; MAX_DATAGRAM],
        }),
        writer: Box::new(UdpWriter { socket, peers }),
        name: format!("udp:{}", local),
    })
}
