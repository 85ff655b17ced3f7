//! Telemetry Bridge
//!
//! Consumes node events from the flight-controller link and forwards the
//! message kinds operators care about as [`TelemetryEvent`]s on an observer
//! channel. Everything else is accepted and dropped.

use anyhow::{Context, Result};
use mavlink::common::{
    MavMessage, ATTITUDE_DATA, COMMAND_ACK_DATA, GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA,
    STATUSTEXT_DATA,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::MavCommandSender;
use super::endpoint::{EndpointError, MavlinkEndpoint};
use super::frame::DecodedFrame;
use super::node::{MavlinkNode, MavlinkWriter, NodeConfig, NodeEvent};

/// First delay before redialling a dropped link
const RECONNECT_INITIAL: Duration = Duration::from_millis(500);

/// Upper bound for the redial delay
const RECONNECT_MAX: Duration = Duration::from_secs(10);

/// Decoded payload of a forwarded message
#[derive(Debug, Clone)]
pub enum TelemetryMessage {
    Heartbeat(HEARTBEAT_DATA),
    CommandAck(COMMAND_ACK_DATA),
    StatusText(STATUSTEXT_DATA),
    GlobalPosition(GLOBAL_POSITION_INT_DATA),
    Attitude(ATTITUDE_DATA),
}

impl TelemetryMessage {
    /// MAVLink message name, e.g. `HEARTBEAT`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heartbeat(_) => "HEARTBEAT",
            Self::CommandAck(_) => "COMMAND_ACK",
            Self::StatusText(_) => "STATUSTEXT",
            Self::GlobalPosition(_) => "GLOBAL_POSITION_INT",
            Self::Attitude(_) => "ATTITUDE",
        }
    }
}

/// A typed telemetry event
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub system_id: u8,
    pub component_id: u8,
    /// Unix time in milliseconds
    pub received_at_ms: u64,
    pub message: TelemetryMessage,
}

impl TelemetryEvent {
    /// Pick out forwarded message kinds
    pub fn from_frame(frame: &DecodedFrame) -> Option<Self> {
        let message = match &frame.message {
            MavMessage::HEARTBEAT(data) => TelemetryMessage::Heartbeat(data.clone()),
            MavMessage::COMMAND_ACK(data) => TelemetryMessage::CommandAck(data.clone()),
            MavMessage::STATUSTEXT(data) => TelemetryMessage::StatusText(data.clone()),
            MavMessage::GLOBAL_POSITION_INT(data) => TelemetryMessage::GlobalPosition(data.clone()),
            MavMessage::ATTITUDE(data) => TelemetryMessage::Attitude(data.clone()),
            _ => return None,
        };

        Some(Self {
            system_id: frame.header.system_id,
            component_id: frame.header.component_id,
            received_at_ms: rover_shared::now_ms(),
            message,
        })
    }

    pub fn kind(&self) -> &'static str {
        self.message.kind()
    }
}

/// Counters for one bridge
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub frames: AtomicU64,
    pub parse_errors: AtomicU64,
    pub forwarded: AtomicU64,
    pub dropped: AtomicU64,
    pub reconnects: AtomicU64,
}

/// Bridge between a flight-controller link and an observer channel
pub struct TelemetryBridge {
    endpoint: MavlinkEndpoint,
    node_config: NodeConfig,
    events: mpsc::Sender<TelemetryEvent>,
    writer: Arc<RwLock<Option<MavlinkWriter>>>,
    stats: Arc<BridgeStats>,
    cancel: CancellationToken,
}

impl TelemetryBridge {
    /// Parse the endpoint and prepare a bridge; nothing is opened yet
    pub fn configure(endpoint: &str, events: mpsc::Sender<TelemetryEvent>) -> Result<Self, EndpointError> {
        let endpoint: MavlinkEndpoint = endpoint.parse()?;
        Ok(Self {
            endpoint,
            node_config: NodeConfig::default(),
            events,
            writer: Arc::new(RwLock::new(None)),
            stats: Arc::new(BridgeStats::default()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_node_config(mut self, config: NodeConfig) -> Self {
        self.node_config = config;
        self
    }

    pub fn endpoint(&self) -> &MavlinkEndpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Command sender bound to this bridge's link. Commands fail while the
    /// link is not open.
    pub fn commands(&self) -> MavCommandSender {
        MavCommandSender::new(self.writer.clone())
    }

    /// Open the endpoint and consume events until [`close`](Self::close) is
    /// called. Failing the first open is an error; a link that drops after
    /// that is redialled with backoff.
    pub async fn start(&self) -> Result<()> {
        info!("Connecting to MAVLink endpoint {}", self.endpoint);
        let mut node = MavlinkNode::open(&self.endpoint, self.node_config.clone())
            .await
            .with_context(|| format!("Failed to open MAVLink endpoint {}", self.endpoint))?;

        loop {
            self.run(node).await;
            match self.reopen().await {
                Some(reopened) => node = reopened,
                None => break,
            }
        }

        info!("MAVLink bridge on {} stopped", self.endpoint);
        Ok(())
    }

    /// Redial until the endpoint opens again; `None` once closed
    async fn reopen(&self) -> Option<MavlinkNode> {
        let mut delay = RECONNECT_INITIAL;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                opened = MavlinkNode::open(&self.endpoint, self.node_config.clone()) => opened,
            };
            match opened {
                Ok(node) => {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!("Reconnected to MAVLink endpoint {}", self.endpoint);
                    return Some(node);
                }
                Err(e) => {
                    delay = (delay * 2).min(RECONNECT_MAX);
                    warn!(
                        "Reconnect to {} failed: {:#}, retrying in {:?}",
                        self.endpoint, e, delay
                    );
                }
            }
        }
    }

    /// Consume events from an already open node
    pub async fn run(&self, mut node: MavlinkNode) {
        *self.writer.write().await = Some(node.writer());

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = node.next_event() => event,
            };
            let Some(event) = event else {
                break;
            };

            match event {
                NodeEvent::Frame(frame) => {
                    self.stats.frames.fetch_add(1, Ordering::Relaxed);
                    if let Some(event) = TelemetryEvent::from_frame(&frame) {
                        self.dispatch(event);
                    }
                }
                NodeEvent::ParseError(e) => {
                    self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("MAVLink parse error: {}", e);
                }
                NodeEvent::StreamRequested { system_id, .. } => {
                    info!("Requested telemetry streams from system {}", system_id);
                }
                NodeEvent::ChannelOpen { link } => info!("MAVLink channel open: {}", link),
                NodeEvent::ChannelClose { link, reason } => match reason {
                    Some(reason) => warn!("MAVLink channel {} closed: {}", link, reason),
                    None => info!("MAVLink channel {} closed", link),
                },
            }
        }

        *self.writer.write().await = None;
        if !self.cancel.is_cancelled() {
            warn!("MAVLink link to {} lost", self.endpoint);
        }
    }

    /// Release the endpoint and unblock the event loop
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn dispatch(&self, event: TelemetryEvent) {
        match self.events.try_send(event) {
            Ok(()) => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(event)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Telemetry observer full, dropped {}", event.kind());
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
