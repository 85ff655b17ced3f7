//! Rover Shared Protocol Types
//!
//! This crate provides the wire protocol codec and subject matching used by the
//! rover message bus, shared between the in-process broker and Rust clients.

pub mod codec;
pub mod subject;

use std::time::{SystemTime, UNIX_EPOCH};

pub use codec::{ClientOp, CodecError, ConnectInfo, ProtocolDecoder, ServerInfo};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Well-known bus subjects
pub mod subjects {
    /// Flight controller heartbeats
    pub const MAVLINK_HEARTBEAT: &str = "mavlink.heartbeat";

    /// Command acknowledgements from the flight controller
    pub const MAVLINK_ACK: &str = "mavlink.ack";

    /// Human-readable status messages from the autopilot
    pub const MAVLINK_STATUSTEXT: &str = "mavlink.statustext";

    /// Fused global position
    pub const MAVLINK_GLOBAL_POSITION: &str = "mavlink.global_position_int";

    /// Vehicle attitude
    pub const MAVLINK_ATTITUDE: &str = "mavlink.attitude";

    /// Operator commands for the vehicle
    pub const ROVER_COMMAND: &str = "rover.command";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_is_after_2020() {
        assert!(now_ms() > 1_577_836_800_000);
    }

    #[test]
    fn test_subjects_are_valid_literals() {
        for s in [
            subjects::MAVLINK_HEARTBEAT,
            subjects::MAVLINK_ACK,
            subjects::MAVLINK_STATUSTEXT,
            subjects::MAVLINK_GLOBAL_POSITION,
            subjects::MAVLINK_ATTITUDE,
            subjects::ROVER_COMMAND,
        ] {
            assert!(subject::is_valid(s, false), "{} should be valid", s);
        }
    }
}
