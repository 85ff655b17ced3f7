//! MAVLink node
//!
//! Owns one open link and turns its byte stream into a sequence of
//! [`NodeEvent`]s. Outbound messages go through a cloneable [`MavlinkWriter`]
//! that stamps this node's system/component id and a running sequence number.

use anyhow::{anyhow, Result};
use mavlink::common::{MavAutopilot, MavMessage, REQUEST_DATA_STREAM_DATA};
use mavlink::MavHeader;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::endpoint::MavlinkEndpoint;
use super::frame::{DecodedFrame, FrameError, MavFrameDecoder};
use crate::transport::{Link, LinkReader, LinkWriter};

/// Size of a single link read
const READ_CHUNK: usize = 2048;

/// MAV_DATA_STREAM_ALL
const DATA_STREAM_ALL: u8 = 0;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// System id stamped on outbound messages
    pub system_id: u8,
    /// Component id stamped on outbound messages
    pub component_id: u8,
    /// Ask ArduPilot systems to start streaming telemetry
    pub stream_requests: bool,
    /// Requested stream rate (Hz)
    pub stream_rate_hz: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            system_id: 10,
            component_id: 1,
            stream_requests: false,
            stream_rate_hz: 4,
        }
    }
}

/// Events produced by a node
#[derive(Debug)]
pub enum NodeEvent {
    /// The link is open and being read
    ChannelOpen { link: String },
    /// A frame was decoded
    Frame(DecodedFrame),
    /// Bytes on the wire did not form a valid frame
    ParseError(FrameError),
    /// Streams were requested from a remote system
    StreamRequested { system_id: u8, component_id: u8 },
    /// The link closed; no further events follow
    ChannelClose { link: String, reason: Option<String> },
}

/// Cloneable sender for outbound messages
#[derive(Clone)]
pub struct MavlinkWriter {
    writer: Arc<Mutex<Box<dyn LinkWriter>>>,
    system_id: u8,
    component_id: u8,
    sequence: Arc<AtomicU8>,
}

impl MavlinkWriter {
    /// Encode as MAVLink v2 and write to the link
    pub async fn send(&self, message: &MavMessage) -> Result<()> {
        let header = MavHeader {
            system_id: self.system_id,
            component_id: self.component_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };

        let mut buf = Vec::with_capacity(280);
        mavlink::write_v2_msg(&mut buf, header, message)
            .map_err(|e| anyhow!("Failed to encode MAVLink message: {:?}", e))?;

        self.writer.lock().await.send(&buf).await?;
        Ok(())
    }
}

/// A node reading from one link
pub struct MavlinkNode {
    reader: Box<dyn LinkReader>,
    writer: MavlinkWriter,
    link_name: String,
    decoder: MavFrameDecoder,
    pending: VecDeque<NodeEvent>,
    config: NodeConfig,
    requested: HashSet<u8>,
    read_buf: Vec<u8>,
    closed: bool,
}

impl MavlinkNode {
    /// Open the endpoint and wrap it in a node
    pub async fn open(endpoint: &MavlinkEndpoint, config: NodeConfig) -> std::io::Result<Self> {
        let link = endpoint.open().await?;
        Ok(Self::from_link(link, config))
    }

    /// Wrap an already open link
    pub fn from_link(link: Link, config: NodeConfig) -> Self {
        let writer = MavlinkWriter {
            writer: Arc::new(Mutex::new(link.writer)),
            system_id: config.system_id,
            component_id: config.component_id,
            sequence: Arc::new(AtomicU8::new(0)),
        };

        let mut pending = VecDeque::new();
        pending.push_back(NodeEvent::ChannelOpen {
            link: link.name.clone(),
        });

        Self {
            reader: link.reader,
            writer,
            link_name: link.name,
            decoder: MavFrameDecoder::new(),
            pending,
            config,
            requested: HashSet::new(),
            read_buf: vec![0u8; READ_CHUNK],
            closed: false,
        }
    }

    /// Writer sharing this node's link
    pub fn writer(&self) -> MavlinkWriter {
        self.writer.clone()
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    /// Wait for the next event. Returns `None` once the channel has closed
    /// and every buffered event has been handed out.
    pub async fn next_event(&mut self) -> Option<NodeEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            match self.decoder.decode_next() {
                Ok(Some(frame)) => {
                    self.maybe_request_streams(&frame).await;
                    return Some(NodeEvent::Frame(frame));
                }
                Err(e) => return Some(NodeEvent::ParseError(e)),
                Ok(None) => {}
            }

            if self.closed {
                return None;
            }

            match self.reader.recv(&mut self.read_buf).await {
                Ok(0) => {
                    self.closed = true;
                    self.pending.push_back(NodeEvent::ChannelClose {
                        link: self.link_name.clone(),
                        reason: None,
                    });
                }
                Ok(n) => self.decoder.extend(&self.read_buf[..n]),
                Err(e) => {
                    self.closed = true;
                    self.pending.push_back(NodeEvent::ChannelClose {
                        link: self.link_name.clone(),
                        reason: Some(e.to_string()),
                    });
                }
            }
        }
    }

    /// On the first heartbeat from an ArduPilot system, ask it to stream
    async fn maybe_request_streams(&mut self, frame: &DecodedFrame) {
        if !self.config.stream_requests {
            return;
        }
        let MavMessage::HEARTBEAT(hb) = &frame.message else {
            return;
        };
        if hb.autopilot != MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA
            || !self.requested.insert(frame.header.system_id)
        {
            return;
        }

        let request = MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
            req_message_rate: self.config.stream_rate_hz,
            target_system: frame.header.system_id,
            target_component: frame.header.component_id,
            req_stream_id: DATA_STREAM_ALL,
            start_stop: 1,
        });

        match self.writer.send(&request).await {
            Ok(()) => {
                debug!("Requested data streams from system {}", frame.header.system_id);
                self.pending.push_back(NodeEvent::StreamRequested {
                    system_id: frame.header.system_id,
                    component_id: frame.header.component_id,
                });
            }
            Err(e) => warn!("Stream request to system {} failed: {:#}", frame.header.system_id, e),
        }
    }
}
