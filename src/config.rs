//! Process configuration
//!
//! Every flag can also be set through the environment (`ROVER_*`). The
//! overlay auth key is only read from `TS_AUTHKEY`.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::camera::{CaptureConfig, PixelFormat};
use crate::relay::RelayConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "rover-edge")]
#[command(about = "Edge runtime: overlay message bus, MAVLink telemetry bridge and camera stream")]
#[command(version)]
pub struct Config {
    /// Hostname on the overlay network
    #[arg(long, env = "ROVER_HOSTNAME", default_value = "rover-1")]
    pub hostname: String,

    /// Public bus port (the broker itself binds port + 10000 on loopback)
    #[arg(long, env = "ROVER_PORT", default_value = "4222")]
    pub port: u16,

    /// Public bus WebSocket port for browser clients
    #[arg(long, env = "ROVER_WS_PORT", default_value = "4223")]
    pub ws_port: u16,

    /// Camera HTTP port
    #[arg(long, env = "ROVER_WEB_PORT", default_value = "8080")]
    pub web_port: u16,

    /// Overlay identity directory (default: $HOME/.config/rover-edge)
    #[arg(long, env = "ROVER_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Register as an ephemeral overlay node
    #[arg(long, env = "ROVER_EPHEMERAL")]
    pub ephemeral: bool,

    /// Skip the overlay; bind the broker on all interfaces
    #[arg(long, env = "ROVER_LOCAL_ONLY")]
    pub local_only: bool,

    /// Debug logging and verbose overlay output
    #[arg(short, long, env = "ROVER_VERBOSE")]
    pub verbose: bool,

    /// Flight controller link: serial:<device>:<baud>, udp:<bind>, tcp:<address>
    #[arg(long, env = "ROVER_MAVLINK")]
    pub mavlink: Option<String>,

    /// Ask ArduPilot to start streaming telemetry on first heartbeat
    #[arg(long, env = "ROVER_MAVLINK_STREAM_REQUEST")]
    pub stream_request: bool,

    /// Camera pixel format: mjpeg or yuyv
    #[arg(long, env = "ROVER_CAMERA_FORMAT", default_value = "mjpeg")]
    pub camera_format: PixelFormat,

    /// Disable the camera service
    #[arg(long, env = "ROVER_NO_CAMERA")]
    pub no_camera: bool,

    /// Root of sysfs, for device discovery
    #[arg(long, env = "ROVER_SYSFS_ROOT", default_value = "/sys", hide = true)]
    pub sysfs_root: PathBuf,

    /// Tun device name for the overlay daemon
    #[arg(long, env = "ROVER_TUN", default_value = "rover-ts0")]
    pub tun: String,

    /// Seconds to wait for the overlay join
    #[arg(long, env = "ROVER_JOIN_TIMEOUT", default_value = "60")]
    pub join_timeout_secs: u64,

    /// Overlay pre-auth key
    #[arg(long, env = "TS_AUTHKEY", hide_env_values = true)]
    pub auth_key: Option<String>,
}

impl Config {
    /// State directory, defaulting under the user's config dir
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".config").join("rover-edge"),
            None => PathBuf::from(".rover-edge"),
        }
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            hostname: self.hostname.clone(),
            port: self.port,
            ws_port: self.ws_port,
            state_dir: self.state_dir(),
            ephemeral: self.ephemeral,
            local_only: self.local_only,
            verbose: self.verbose,
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            auth_key: self.auth_key.clone().filter(|k| !k.is_empty()),
        }
    }

    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            format: self.camera_format,
            ..Default::default()
        }
    }
}
