//! Individual bus client session handling

use bytes::Bytes;
use rover_shared::codec::{self, ClientOp, ProtocolDecoder, ServerInfo};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{ClientId, Delivery, Registry};

/// Outbound frames buffered per client before it counts as a slow consumer
pub(super) const OUTBOUND_CAPACITY: usize = 1024;

/// Serve one socket client until it disconnects, violates the protocol, or
/// the broker shuts down.
pub async fn serve_client<S>(
    stream: S,
    peer: SocketAddr,
    registry: Arc<Registry>,
    info: ServerInfo,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (mut session, mut rx) = ClientSession::attach(registry, info, peer).await;

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!("Bus write error: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut read_buf = vec![0u8; 4096];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read(&mut read_buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Bus read error from {}: {}", peer, e);
                    break;
                }
            },
        };

        if !session.receive(&read_buf[..n]).await {
            break;
        }
    }

    let id = session.id();
    session.detach().await;
    let _ = writer_task.await;
    info!("Bus client {} ({}) disconnected", id, peer);
}

/// Protocol state of one attached client, independent of its transport
pub(super) struct ClientSession {
    id: ClientId,
    peer: SocketAddr,
    registry: Arc<Registry>,
    outbound: mpsc::Sender<Bytes>,
    decoder: ProtocolDecoder,
    verbose: bool,
}

impl ClientSession {
    /// Register with the registry and queue the INFO greeting. The receiver
    /// yields every frame to write to the client.
    pub(super) async fn attach(
        registry: Arc<Registry>,
        mut info: ServerInfo,
        peer: SocketAddr,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);

        let id = registry.register(Delivery::Remote(tx.clone())).await;
        info.client_id = id;
        let _ = tx.send(codec::encode_info(&info)).await;
        debug!("Bus client {} connected from {}", id, peer);

        let session = Self {
            id,
            peer,
            registry,
            outbound: tx,
            decoder: ProtocolDecoder::new(),
            verbose: false,
        };
        (session, rx)
    }

    pub(super) fn id(&self) -> ClientId {
        self.id
    }

    /// Handle received bytes. Returns `false` when the connection must close.
    pub(super) async fn receive(&mut self, data: &[u8]) -> bool {
        self.decoder.extend(data);

        loop {
            match self.decoder.decode_next() {
                Ok(Some(op)) => self.handle(op).await,
                Ok(None) => return true,
                Err(e) => {
                    let _ = self.outbound.send(codec::encode_err(&e.to_string())).await;
                    if e.is_fatal() {
                        warn!("Protocol error from {}: {}", self.peer, e);
                        return false;
                    }
                    debug!("Rejected operation from {}: {}", self.peer, e);
                }
            }
        }
    }

    /// Drop every subscription and release the outbound queue
    pub(super) async fn detach(self) {
        self.registry.unregister(self.id).await;
    }

    async fn handle(&mut self, op: ClientOp) {
        match op {
            ClientOp::Connect(connect) => {
                self.verbose = connect.verbose;
                self.registry.set_echo(self.id, connect.echo()).await;
                if let Some(name) = &connect.name {
                    debug!("Bus client {} identified as {}", self.id, name);
                }
                self.ack().await;
            }
            ClientOp::Pub {
                subject,
                reply,
                payload,
            } => {
                let n = self
                    .registry
                    .publish(Some(self.id), &subject, reply.as_deref(), &payload)
                    .await;
                debug!("PUB {} ({} bytes) -> {} deliveries", subject, payload.len(), n);
                self.ack().await;
            }
            ClientOp::Sub { subject, queue, sid } => {
                self.registry.subscribe(self.id, &sid, &subject, queue).await;
                self.ack().await;
            }
            ClientOp::Unsub { sid, max } => {
                self.registry.unsubscribe(self.id, &sid, max).await;
                self.ack().await;
            }
            ClientOp::Ping => {
                let _ = self.outbound.send(Bytes::from_static(codec::PONG)).await;
            }
            ClientOp::Pong => {}
        }
    }

    async fn ack(&self) {
        if self.verbose {
            let _ = self.outbound.send(Bytes::from_static(codec::OK)).await;
        }
    }
}
