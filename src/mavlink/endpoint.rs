//! Telemetry endpoint configuration
//!
//! Parsed once from a `kind:param[:param]` string:
//! `serial:<device>:<baud>`, `udp:<bind-address>` or `tcp:<address>`.

use std::fmt;
use std::io;
use std::str::FromStr;
use thiserror::Error;

use crate::transport::{self, Link};

/// Errors from parsing an endpoint string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid serial endpoint format. Expected serial:<device>:<baud>, got {0}")]
    SerialFormat(String),
    #[error("invalid baud rate '{value}': {reason}")]
    InvalidBaud { value: String, reason: String },
    #[error("{kind} endpoint requires an address, got {input}")]
    MissingAddress { kind: &'static str, input: String },
    #[error("unsupported or invalid endpoint: {0}")]
    Unsupported(String),
}

/// Link to the flight controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MavlinkEndpoint {
    /// Serial port (e.g. `/dev/ttyACM0` at 57600)
    Serial { device: String, baud: u32 },
    /// UDP server bound locally (e.g. `0.0.0.0:14550`)
    UdpServer { address: String },
    /// TCP client (e.g. SITL on `127.0.0.1:5760`)
    TcpClient { address: String },
}

impl FromStr for MavlinkEndpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(rest) = s.strip_prefix("serial:") {
            let parts: Vec<&str> = rest.split(':').collect();
            if parts.len() != 2 || parts[0].is_empty() {
                return Err(EndpointError::SerialFormat(s.to_string()));
            }
            let baud: u32 = parts[1].parse().map_err(|e: std::num::ParseIntError| {
                EndpointError::InvalidBaud {
                    value: parts[1].to_string(),
                    reason: e.to_string(),
                }
            })?;
            if baud == 0 {
                return Err(EndpointError::InvalidBaud {
                    value: parts[1].to_string(),
                    reason: "must be positive".into(),
                });
            }
            return Ok(Self::Serial {
                device: parts[0].to_string(),
                baud,
            });
        }

        if let Some(address) = s.strip_prefix("udp:") {
            if address.is_empty() {
                return Err(EndpointError::MissingAddress { kind: "udp", input: s.to_string() });
            }
            return Ok(Self::UdpServer { address: address.to_string() });
        }

        if let Some(address) = s.strip_prefix("tcp:") {
            if address.is_empty() {
                return Err(EndpointError::MissingAddress { kind: "tcp", input: s.to_string() });
            }
            return Ok(Self::TcpClient { address: address.to_string() });
        }

        Err(EndpointError::Unsupported(s.to_string()))
    }
}

impl fmt::Display for MavlinkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { device, baud } => write!(f, "serial:{}:{}", device, baud),
            Self::UdpServer { address } => write!(f, "udp:{}", address),
            Self::TcpClient { address } => write!(f, "tcp:{}", address),
        }
    }
}

impl MavlinkEndpoint {
    /// Open the underlying transport
    pub async fn open(&self) -> io::Result<Link> {
        match self {
            Self::Serial { device, baud } => transport::open_serial(device, *baud),
            Self::UdpServer { address } => transport::bind_udp(address).await,
            Self::TcpClient { address } => transport::connect_tcp(address).await,
        }
    }
}
