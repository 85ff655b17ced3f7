//! MAVLink Command Sender
//!
//! Builds COMMAND_LONG messages for the vehicle and writes them on the
//! bridge's link.

use anyhow::{anyhow, bail, Result};
use mavlink::common::{MavCmd, MavMessage, COMMAND_LONG_DATA};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use super::node::MavlinkWriter;

/// ArduPilot Rover custom mode numbers
const MODE_MANUAL: u32 = 0;
const MODE_GUIDED: u32 = 15;

/// MAV_MODE_FLAG_CUSTOM_MODE_ENABLED, as DO_SET_MODE expects it in param1
const CUSTOM_MODE_ENABLED: f32 = 1.0;

/// Commands are broadcast to every system and component on the link
const BROADCAST: u8 = 0;

/// Map a mode name to its ArduPilot Rover custom mode number
pub fn custom_mode(name: &str) -> Result<u32> {
    match name.to_ascii_uppercase().as_str() {
        "MANUAL" => Ok(MODE_MANUAL),
        "GUIDED" => Ok(MODE_GUIDED),
        other => bail!("Unsupported mode: {}", other),
    }
}

/// Sends commands to the vehicle via MAVLink
#[derive(Clone)]
pub struct MavCommandSender {
    writer: Arc<RwLock<Option<MavlinkWriter>>>,
}

impl MavCommandSender {
    pub(crate) fn new(writer: Arc<RwLock<Option<MavlinkWriter>>>) -> Self {
        Self { writer }
    }

    /// Arm the vehicle
    pub async fn arm(&self) -> Result<()> {
        info!("Sending ARM command");
        self.send(self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, 1.0, 0.0))
            .await
    }

    /// Disarm the vehicle
    pub async fn disarm(&self) -> Result<()> {
        info!("Sending DISARM command");
        self.send(self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, 0.0, 0.0))
            .await
    }

    /// Switch flight mode by name (`MANUAL`, `GUIDED`)
    pub async fn set_mode(&self, mode: &str) -> Result<()> {
        let number = custom_mode(mode)?;
        info!("Sending SET_MODE {} ({})", mode, number);
        self.send(self.command_long(
            MavCmd::MAV_CMD_DO_SET_MODE,
            CUSTOM_MODE_ENABLED,
            number as f32,
        ))
        .await
    }

    fn command_long(&self, command: MavCmd, param1: f32, param2: f32) -> MavMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: BROADCAST,
            target_component: BROADCAST,
            command,
            confirmation: 0,
            param1,
            param2,
            param3: 0.0,
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
        })
    }

    async fn send(&self, message: MavMessage) -> Result<()> {
        let guard = self.writer.read().await;
        let writer = guard
            .as_ref()
            .ok_or_else(|| anyhow!("MAVLink link is not open"))?;
        writer.send(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mavlink::frame::MavFrameDecoder;
    use crate::mavlink::node::{MavlinkNode, NodeConfig};
    use crate::transport::stream_link;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_custom_mode_mapping() {
        assert_eq!(custom_mode("MANUAL").unwrap(), 0);
        assert_eq!(custom_mode("guided").unwrap(), 15);
        assert!(custom_mode("AUTO").is_err());
    }

    #[tokio::test]
    async fn test_commands_fail_without_link() {
        let sender = MavCommandSender::new(Arc::new(RwLock::new(None)));
        assert!(sender.arm().await.is_err());
    }

    #[tokio::test]
    async fn test_set_mode_encodes_do_set_mode() {
        let (mut fc, ours) = tokio::io::duplex(1024);
        let node = MavlinkNode::from_link(stream_link(ours, "test"), NodeConfig::default());
        let sender = MavCommandSender::new(Arc::new(RwLock::new(Some(node.writer()))));

        sender.set_mode("GUIDED").await.unwrap();

        let mut buf = [0u8; 512];
        let n = fc.read(&mut buf).await.unwrap();
        let mut decoder = MavFrameDecoder::new();
        decoder.extend(&buf[..n]);
        let frame = decoder.decode_next().unwrap().expect("frame");

        assert_eq!(frame.header.system_id, 10);
        assert_eq!(frame.header.component_id, 1);
        match frame.message {
            MavMessage::COMMAND_LONG(cmd) => {
                assert_eq!(cmd.command, MavCmd::MAV_CMD_DO_SET_MODE);
                assert_eq!(cmd.param1, 1.0);
                assert_eq!(cmd.param2, 15.0);
                assert_eq!(cmd.target_system, 0);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_arm_and_disarm_params() {
        let (mut fc, ours) = tokio::io::duplex(1024);
        let node = MavlinkNode::from_link(stream_link(ours, "test"), NodeConfig::default());
        let sender = MavCommandSender::new(Arc::new(RwLock::new(Some(node.writer()))));

        sender.arm().await.unwrap();
        sender.disarm().await.unwrap();

        let mut decoder = MavFrameDecoder::new();
        let mut params = Vec::new();
        let mut buf = [0u8; 512];
        while params.len() < 2 {
            let n = fc.read(&mut buf).await.unwrap();
            decoder.extend(&buf[..n]);
            while let Some(frame) = decoder.decode_next().unwrap() {
                if let MavMessage::COMMAND_LONG(cmd) = frame.message {
                    assert_eq!(cmd.command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
                    params.push(cmd.param1);
                }
            }
        }
        assert_eq!(params, vec![1.0, 0.0]);
    }
}
