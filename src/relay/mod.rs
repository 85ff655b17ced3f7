//! Overlay Relay
//!
//! Makes the local broker reachable only through the private overlay network:
//! the broker binds to loopback on `port + 10000` and an overlay listener on
//! `port` forwards raw bytes to it. The WebSocket port is relayed the same way.
//! In local-only mode the broker binds directly to both ports on all interfaces
//! and no overlay is joined.

mod overlay;
mod proxy;

pub use overlay::{LoopbackOverlay, Overlay, OverlayConfig, OverlaySession, TailscaleOverlay};
pub use proxy::{forward, proxy_listener, ClosedBy, ForwardStats};

use anyhow::{anyhow, Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::bus::{Broker, BrokerConfig, BusHandle};

/// Offset between the public port and the broker's private loopback port
pub const BROKER_PORT_OFFSET: u16 = 10000;

/// Configuration for the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Hostname on the overlay network
    pub hostname: String,
    /// Public-facing bus port
    pub port: u16,
    /// Public-facing bus WebSocket port
    pub ws_port: u16,
    /// Where overlay identity is persisted
    pub state_dir: PathBuf,
    /// Register as an ephemeral overlay node
    pub ephemeral: bool,
    /// Skip the overlay and bind the broker on all interfaces
    pub local_only: bool,
    pub verbose: bool,
    /// Upper bound on waiting for the overlay join
    pub join_timeout: Duration,
    pub auth_key: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hostname: "rover-1".into(),
            port: 4222,
            ws_port: 4223,
            state_dir: PathBuf::from(".rover-edge"),
            ephemeral: false,
            local_only: false,
            verbose: false,
            join_timeout: Duration::from_secs(60),
            auth_key: None,
        }
    }
}

impl RelayConfig {
    fn overlay_config(&self) -> OverlayConfig {
        OverlayConfig {
            hostname: self.hostname.clone(),
            state_dir: self.state_dir.clone(),
            ephemeral: self.ephemeral,
            auth_key: self.auth_key.clone(),
            join_timeout: self.join_timeout,
            verbose: self.verbose,
        }
    }
}

/// Private broker port for a public port.
///
/// Port 0 (OS-assigned) maps to 0 so tests never collide.
pub fn broker_port(port: u16) -> Result<u16> {
    if port == 0 {
        return Ok(0);
    }
    port.checked_add(BROKER_PORT_OFFSET)
        .ok_or_else(|| anyhow!("Port {} too large: broker port {} + {} overflows", port, port, BROKER_PORT_OFFSET))
}

/// A running relay: broker plus (optionally) overlay and proxy
pub struct Relay {
    broker: Broker,
    overlay: Option<(Arc<dyn Overlay>, OverlaySession)>,
    public_addr: SocketAddr,
    public_ws_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    proxy_tasks: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Start the relay. Any error here is fatal for the process.
    pub async fn start(config: &RelayConfig, overlay: Arc<dyn Overlay>) -> Result<Self> {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        if config.local_only {
            let broker = Broker::start(BrokerConfig {
                bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)),
                ws_bind: Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.ws_port))),
                server_name: config.hostname.clone(),
            })
            .await
            .context("Failed to start broker")?;

            let public_addr = broker.local_addr();
            info!("Broker started on {} (local only)", public_addr);

            return Ok(Self {
                public_ws_addr: broker.ws_addr(),
                broker,
                overlay: None,
                public_addr,
                cancel,
                tracker,
                proxy_tasks: Vec::new(),
            });
        }

        info!("Joining {} overlay as {}...", overlay.name(), config.hostname);
        let session = overlay
            .up(&config.overlay_config())
            .await
            .context("Failed to connect to overlay network")?;

        let broker = Broker::start(BrokerConfig {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, broker_port(config.port)?)),
            ws_bind: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, broker_port(config.ws_port)?))),
            server_name: config.hostname.clone(),
        })
        .await
        .context("Failed to start broker")?;

        let listener = overlay.listen(&session, config.port).await?;
        let public_addr = listener.local_addr()?;
        let mut proxy_tasks = vec![tokio::spawn(proxy_listener(
            listener,
            broker.local_addr(),
            cancel.clone(),
            tracker.clone(),
        ))];

        let mut public_ws_addr = None;
        if let Some(ws_addr) = broker.ws_addr() {
            let listener = overlay.listen(&session, config.ws_port).await?;
            public_ws_addr = Some(listener.local_addr()?);
            proxy_tasks.push(tokio::spawn(proxy_listener(
                listener,
                ws_addr,
                cancel.clone(),
                tracker.clone(),
            )));
        }

        info!(
            "Bus reachable at {}:{} via overlay (broker on {})",
            session.display_name(),
            public_addr.port(),
            broker.local_addr()
        );

        Ok(Self {
            broker,
            overlay: Some((overlay, session)),
            public_addr,
            public_ws_addr,
            cancel,
            tracker,
            proxy_tasks,
        })
    }

    /// Handle for in-process bus access
    pub fn bus(&self) -> BusHandle {
        self.broker.handle()
    }

    /// Address operators connect to
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// Address browser clients connect to over WebSocket
    pub fn public_ws_addr(&self) -> Option<SocketAddr> {
        self.public_ws_addr
    }

    /// Address the broker itself is bound to
    pub fn broker_addr(&self) -> SocketAddr {
        self.broker.local_addr()
    }

    /// Address the broker's WebSocket listener is bound to
    pub fn bus_ws_addr(&self) -> Option<SocketAddr> {
        self.broker.ws_addr()
    }

    /// Overlay identity, if joined
    pub fn session(&self) -> Option<&OverlaySession> {
        self.overlay.as_ref().map(|(_, session)| session)
    }

    /// Open another listener on the same network surface as the bus: the overlay
    /// address when joined, all interfaces otherwise.
    pub async fn listen(&self, port: u16) -> Result<TcpListener> {
        match &self.overlay {
            Some((overlay, session)) => overlay.listen(session, port).await,
            None => TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
                .await
                .with_context(|| format!("Failed to bind port {}", port)),
        }
    }

    /// Tear down proxy, broker and overlay, in that order
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.proxy_tasks {
            let _ = task.await;
        }
        self.tracker.close();
        self.tracker.wait().await;

        self.broker.shutdown().await;

        if let Some((overlay, _)) = self.overlay {
            if let Err(e) = overlay.down().await {
                error!("Failed to leave overlay: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_port_offset() {
        assert_eq!(broker_port(4222).unwrap(), 14222);
        assert_eq!(broker_port(0).unwrap(), 0);
        assert!(broker_port(60000).is_err());
    }

    #[tokio::test]
    async fn test_local_only_binds_broker_directly() {
        let config = RelayConfig {
            port: 0,
            ws_port: 0,
            local_only: true,
            ..Default::default()
        };
        let relay = Relay::start(&config, Arc::new(LoopbackOverlay)).await.unwrap();

        assert_eq!(relay.public_addr(), relay.broker_addr());
        assert!(relay.session().is_none());
        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_overlay_mode_separates_public_and_broker_ports() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig {
            port: 0,
            ws_port: 0,
            state_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let relay = Relay::start(&config, Arc::new(LoopbackOverlay)).await.unwrap();

        assert!(relay.broker_addr().ip().is_loopback());
        assert_ne!(relay.public_addr(), relay.broker_addr());
        assert!(relay.public_ws_addr().is_some());
        assert_ne!(relay.public_ws_addr(), relay.bus_ws_addr());
        assert_eq!(relay.session().map(|s| s.hostname.as_str()), Some("rover-1"));
        relay.shutdown().await;
    }
}
