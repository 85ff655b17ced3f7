//! MAVLink Telemetry Bridge
//!
//! Connects to the flight controller over serial, UDP or TCP, decodes the
//! common dialect and forwards typed events. Also sends arm/disarm/mode
//! commands back over the same link.

mod bridge;
mod commands;
mod endpoint;
mod frame;
mod node;
mod telemetry;

pub use bridge::{BridgeStats, TelemetryBridge, TelemetryEvent, TelemetryMessage};
pub use commands::{custom_mode, MavCommandSender};
pub use endpoint::{EndpointError, MavlinkEndpoint};
pub use frame::{DecodedFrame, FrameError, MavFrameDecoder};
pub use node::{MavlinkNode, MavlinkWriter, NodeConfig, NodeEvent};
pub use telemetry::{publish_events, serve_commands, subject_for, to_json, RoverCommand};
