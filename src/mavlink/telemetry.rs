//! Telemetry <-> bus wiring
//!
//! Publishes forwarded telemetry as JSON on `mavlink.*` subjects and turns
//! `rover.command` messages into vehicle commands.

use anyhow::{bail, Result};
use rover_shared::subjects;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bridge::{TelemetryEvent, TelemetryMessage};
use super::commands::MavCommandSender;
use crate::bus::BusHandle;

/// Bus subject for an event
pub fn subject_for(event: &TelemetryEvent) -> &'static str {
    match event.message {
        TelemetryMessage::Heartbeat(_) => subjects::MAVLINK_HEARTBEAT,
        TelemetryMessage::CommandAck(_) => subjects::MAVLINK_ACK,
        TelemetryMessage::StatusText(_) => subjects::MAVLINK_STATUSTEXT,
        TelemetryMessage::GlobalPosition(_) => subjects::MAVLINK_GLOBAL_POSITION,
        TelemetryMessage::Attitude(_) => subjects::MAVLINK_ATTITUDE,
    }
}

/// JSON body published for an event.
///
/// Fields are flat and in display units: degrees for position, metres for
/// altitude, m/s for velocity and degrees for heading. `t_raw` is when the
/// frame arrived and `t_pub` when it is handed to the bus, both Unix ms.
pub fn to_json(event: &TelemetryEvent, published_at_ms: u64) -> Value {
    let mut body = match &event.message {
        TelemetryMessage::Heartbeat(hb) => json!({
            "mav_type": hb.mavtype as u32,
            "autopilot": hb.autopilot as u32,
            "base_mode": hb.base_mode.bits(),
            "custom_mode": hb.custom_mode,
            "system_status": hb.system_status as u32,
            "timestamp": published_at_ms,
        }),
        TelemetryMessage::CommandAck(ack) => json!({
            "command": ack.command as u32,
            "result": ack.result as u32,
        }),
        TelemetryMessage::StatusText(status) => json!({
            "severity": status.severity as u32,
            "text": status_text(&status.text),
        }),
        TelemetryMessage::GlobalPosition(pos) => json!({
            "lat": f64::from(pos.lat) / 1e7,
            "lon": f64::from(pos.lon) / 1e7,
            "alt": f64::from(pos.alt) / 1000.0,
            "relative_alt": f64::from(pos.relative_alt) / 1000.0,
            "vx": f64::from(pos.vx) / 100.0,
            "vy": f64::from(pos.vy) / 100.0,
            "vz": f64::from(pos.vz) / 100.0,
            "hdg": f64::from(pos.hdg) / 100.0,
        }),
        TelemetryMessage::Attitude(att) => json!({
            "roll": att.roll,
            "pitch": att.pitch,
            "yaw": att.yaw,
            "rollspeed": att.rollspeed,
            "pitchspeed": att.pitchspeed,
            "yawspeed": att.yawspeed,
        }),
    };

    if let Value::Object(fields) = &mut body {
        fields.insert("type".into(), event.kind().into());
        fields.insert("system_id".into(), event.system_id.into());
        fields.insert("t_raw".into(), event.received_at_ms.into());
        fields.insert("t_pub".into(), published_at_ms.into());
    }
    body
}

/// Fixed-size text field up to the first NUL
fn status_text(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Drain the bridge's observer channel onto the bus until cancelled or the
/// bridge goes away
pub async fn publish_events(
    bus: BusHandle,
    mut events: mpsc::Receiver<TelemetryEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let subject = subject_for(&event);
        let body = to_json(&event, rover_shared::now_ms()).to_string();
        match bus.publish(subject, body).await {
            Ok(n) => debug!("Published {} to {} subscriber(s)", event.kind(), n),
            Err(e) => warn!("Failed to publish {}: {:#}", event.kind(), e),
        }
    }
}

/// A command received on `rover.command`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoverCommand {
    Arm,
    Disarm,
    SetMode(String),
}

#[derive(Deserialize)]
struct RawCommand {
    #[serde(rename = "type", alias = "cmd")]
    kind: String,
    #[serde(default)]
    mode: Option<String>,
}

impl RoverCommand {
    /// Parse a JSON command body
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawCommand = serde_json::from_slice(payload)?;
        match raw.kind.to_ascii_lowercase().as_str() {
            "arm" => Ok(Self::Arm),
            "disarm" => Ok(Self::Disarm),
            "mode" => match raw.mode {
                Some(mode) if !mode.is_empty() => Ok(Self::SetMode(mode)),
                _ => bail!("mode command requires a mode"),
            },
            other => bail!("Unknown command type: {}", other),
        }
    }
}

/// Execute `rover.command` messages until cancelled
pub async fn serve_commands(
    bus: BusHandle,
    commands: MavCommandSender,
    cancel: CancellationToken,
) -> Result<()> {
    let mut subscription = bus.subscribe(subjects::ROVER_COMMAND).await?;
    info!("Listening for commands on {}", subjects::ROVER_COMMAND);

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = subscription.next() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let command = match RoverCommand::parse(&message.payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring malformed command: {:#}", e);
                continue;
            }
        };

        let result = match &command {
            RoverCommand::Arm => commands.arm().await,
            RoverCommand::Disarm => commands.disarm().await,
            RoverCommand::SetMode(mode) => commands.set_mode(mode).await,
        };
        if let Err(e) = result {
            warn!("Command {:?} failed: {:#}", command, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Registry;
    use crate::mavlink::frame::tests::heartbeat;
    use mavlink::common::{
        MavCmd, MavMessage, MavResult, MavSeverity, MavType, COMMAND_ACK_DATA,
        GLOBAL_POSITION_INT_DATA, STATUSTEXT_DATA,
    };
    use std::sync::Arc;

    fn event(message: TelemetryMessage) -> TelemetryEvent {
        TelemetryEvent {
            system_id: 1,
            component_id: 1,
            received_at_ms: 1_700_000_000_000,
            message,
        }
    }

    fn heartbeat_event() -> TelemetryEvent {
        let MavMessage::HEARTBEAT(data) = heartbeat() else {
            unreachable!()
        };
        event(TelemetryMessage::Heartbeat(data))
    }

    #[test]
    fn test_heartbeat_json() {
        let event = heartbeat_event();
        assert_eq!(subject_for(&event), "mavlink.heartbeat");

        let body = to_json(&event, 1_700_000_000_050);
        assert_eq!(body["type"], "HEARTBEAT");
        assert_eq!(body["system_id"], 1);
        assert_eq!(body["custom_mode"], 4);
        assert_eq!(body["mav_type"], MavType::MAV_TYPE_GROUND_ROVER as u32);
        assert_eq!(body["t_raw"], 1_700_000_000_000u64);
        assert_eq!(body["t_pub"], 1_700_000_000_050u64);
        assert_eq!(body["timestamp"], 1_700_000_000_050u64);
        assert!(body.get("data").is_none());
    }

    #[test]
    fn test_global_position_is_scaled() {
        let event = event(TelemetryMessage::GlobalPosition(GLOBAL_POSITION_INT_DATA {
            lat: 473_977_418,
            lon: 85_455_939,
            alt: 488_250,
            relative_alt: 1_500,
            vx: 125,
            vy: -50,
            vz: 0,
            hdg: 27_000,
            ..Default::default()
        }));
        assert_eq!(subject_for(&event), "mavlink.global_position_int");

        let body = to_json(&event, 0);
        let field = |name: &str| body[name].as_f64().unwrap();
        assert!((field("lat") - 47.3977418).abs() < 1e-9);
        assert!((field("lon") - 8.5455939).abs() < 1e-9);
        assert_eq!(field("alt"), 488.25);
        assert_eq!(field("relative_alt"), 1.5);
        assert_eq!(field("vx"), 1.25);
        assert_eq!(field("vy"), -0.5);
        assert_eq!(field("vz"), 0.0);
        assert_eq!(field("hdg"), 270.0);
    }

    #[test]
    fn test_statustext_stops_at_nul() {
        let mut text = [0u8; 50];
        text[..13].copy_from_slice(b"PreArm: Gyros");
        let event = event(TelemetryMessage::StatusText(STATUSTEXT_DATA {
            severity: MavSeverity::MAV_SEVERITY_CRITICAL,
            text,
            ..Default::default()
        }));
        assert_eq!(subject_for(&event), "mavlink.statustext");

        let body = to_json(&event, 0);
        assert_eq!(body["type"], "STATUSTEXT");
        assert_eq!(body["text"], "PreArm: Gyros");
        assert_eq!(body["severity"], MavSeverity::MAV_SEVERITY_CRITICAL as u32);

        // A full-width message has no terminator
        assert_eq!(status_text(&[b'x'; 50]).len(), 50);
    }

    #[test]
    fn test_command_ack_is_numeric() {
        let event = event(TelemetryMessage::CommandAck(COMMAND_ACK_DATA {
            command: MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            result: MavResult::MAV_RESULT_ACCEPTED,
            ..Default::default()
        }));
        let body = to_json(&event, 0);
        assert_eq!(body["command"], 400);
        assert_eq!(body["result"], 0);
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(RoverCommand::parse(br#"{"type":"arm"}"#).unwrap(), RoverCommand::Arm);
        assert_eq!(RoverCommand::parse(br#"{"cmd":"DISARM"}"#).unwrap(), RoverCommand::Disarm);
        assert_eq!(
            RoverCommand::parse(br#"{"type":"mode","mode":"GUIDED"}"#).unwrap(),
            RoverCommand::SetMode("GUIDED".into())
        );
        assert!(RoverCommand::parse(br#"{"type":"mode"}"#).is_err());
        assert!(RoverCommand::parse(br#"{"type":"fly"}"#).is_err());
        assert!(RoverCommand::parse(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_publish_events_reaches_bus() {
        let bus = BusHandle::new(Arc::new(Registry::new()));
        let mut sub = bus.subscribe("mavlink.>").await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let publisher = tokio::spawn(publish_events(bus.clone(), rx, cancel.clone()));

        tx.send(heartbeat_event()).await.unwrap();
        let msg = sub.next().await.unwrap();
        assert_eq!(msg.subject, "mavlink.heartbeat");
        let body: Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(body["type"], "HEARTBEAT");

        drop(tx);
        publisher.await.unwrap();
    }
}
