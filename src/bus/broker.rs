//! In-process publish/subscribe broker
//!
//! Listens on a TCP address (and optionally a WebSocket address) and serves
//! every accepted connection with the bus text protocol. In-process publishers
//! and subscribers attach through [`BusHandle`](super::BusHandle) without going
//! through a socket.

use anyhow::{Context, Result};
use rover_shared::codec::{ServerInfo, MAX_PAYLOAD};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::client::serve_client;
use super::registry::Registry;
use super::ws::{self, WsState};
use super::BusHandle;

/// Configuration for the broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the broker listens on
    pub bind: SocketAddr,
    /// Address for WebSocket clients, if enabled
    pub ws_bind: Option<SocketAddr>,
    /// Name advertised to clients in INFO
    pub server_name: String,
}

/// A running broker instance
pub struct Broker {
    local_addr: SocketAddr,
    ws_addr: Option<SocketAddr>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
    ws_task: Option<JoinHandle<()>>,
}

impl Broker {
    /// Bind the listener and start accepting clients
    pub async fn start(config: BrokerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind)
            .await
            .with_context(|| format!("Failed to bind broker to {}", config.bind))?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(Registry::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let info = ServerInfo {
            server_id: format!("{:016x}", rover_shared::now_ms() ^ u64::from(std::process::id())),
            server_name: config.server_name,
            version: env!("CARGO_PKG_VERSION").to_string(),
            proto: 1,
            host: local_addr.ip().to_string(),
            port: local_addr.port(),
            max_payload: MAX_PAYLOAD,
            headers: false,
            client_id: 0,
        };

        let (ws_addr, ws_task) = match config.ws_bind {
            Some(bind) => {
                let listener = TcpListener::bind(bind)
                    .await
                    .with_context(|| format!("Failed to bind broker WebSocket to {}", bind))?;
                let ws_addr = listener.local_addr()?;
                let state = WsState {
                    registry: registry.clone(),
                    info: ServerInfo {
                        port: ws_addr.port(),
                        ..info.clone()
                    },
                    cancel: cancel.clone(),
                    tracker: tracker.clone(),
                };
                let shutdown = cancel.clone();
                let task = tokio::spawn(async move {
                    let app = ws::router(state).into_make_service_with_connect_info::<SocketAddr>();
                    if let Err(e) = axum::serve(listener, app)
                        .with_graceful_shutdown(shutdown.cancelled_owned())
                        .await
                    {
                        warn!("Broker WebSocket server error: {}", e);
                    }
                });
                info!("Broker WebSocket listening on {}", ws_addr);
                (Some(ws_addr), Some(task))
            }
            None => (None, None),
        };

        let accept_task = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            info,
            cancel.clone(),
            tracker.clone(),
        ));

        info!("Broker listening on {}", local_addr);

        Ok(Self {
            local_addr,
            ws_addr,
            registry,
            cancel,
            tracker,
            accept_task,
            ws_task,
        })
    }

    /// Address the broker is actually bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address WebSocket clients connect to, if enabled
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    /// Handle for in-process publishing and subscribing
    pub fn handle(&self) -> BusHandle {
        BusHandle::new(self.registry.clone())
    }

    /// Stop accepting, disconnect every client and wait for their tasks
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.accept_task.await;
        if let Some(task) = self.ws_task {
            let _ = task.await;
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("Broker on {} shut down", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    info: ServerInfo,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Broker accept error: {}", e);
                    continue;
                }
            },
        };

        debug!("Broker accepted {}", peer);
        let _ = stream.set_nodelay(true);
        tracker.spawn(serve_client(
            stream,
            peer,
            registry.clone(),
            info.clone(),
            cancel.child_token(),
        ));
    }
}
