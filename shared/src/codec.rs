//! Text protocol codec for the message bus
//!
//! The bus speaks a line-oriented protocol compatible with NATS core clients:
//! ```text
//! client -> server:  CONNECT {json} | PUB <subject> [reply] <len>\r\n<payload>
//!                    SUB <subject> [queue] <sid> | UNSUB <sid> [max] | PING | PONG
//! server -> client:  INFO {json} | MSG <subject> <sid> [reply] <len>\r\n<payload>
//!                    +OK | -ERR '<text>' | PING | PONG
//! ```
//! Every control line ends with `\r\n`; payloads are followed by `\r\n`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::subject;

/// Maximum payload accepted on PUB (1 MiB)
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Maximum length of a single control line
pub const MAX_CONTROL_LINE: usize = 4096;

pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";
pub const OK: &[u8] = b"+OK\r\n";

/// Errors that can occur while decoding client operations
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown Protocol Operation")]
    UnknownOperation(String),

    #[error("Invalid arguments for {op}: {line}")]
    InvalidArguments { op: &'static str, line: String },

    #[error("Invalid Subject")]
    InvalidSubject(String),

    #[error("Maximum Payload Violation: {0} bytes (max: {MAX_PAYLOAD})")]
    PayloadTooLarge(usize),

    #[error("Maximum Control Line Exceeded")]
    ControlLineTooLong,

    #[error("Payload not terminated by CRLF")]
    MissingTerminator,

    #[error("Control line is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid CONNECT options: {0}")]
    Connect(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether the connection must be closed. A bad subject only rejects the
    /// one operation; the offending bytes have already been consumed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::InvalidSubject(_))
    }
}

/// Options a client sends with CONNECT
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectInfo {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub pedantic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Deliver the client's own publishes back to it (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<bool>,
}

impl ConnectInfo {
    pub fn echo(&self) -> bool {
        self.echo.unwrap_or(true)
    }
}

/// Greeting the server sends on every new connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub proto: u8,
    pub host: String,
    pub port: u16,
    pub max_payload: usize,
    pub headers: bool,
    pub client_id: u64,
}

/// A decoded client operation
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Connect(ConnectInfo),
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue: Option<String>,
        sid: String,
    },
    Unsub {
        sid: String,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

/// Try to decode one client operation from the front of `buf`.
///
/// Returns:
/// - `Ok(Some(op))` if a complete operation was decoded and consumed
/// - `Ok(None)` if more data is needed (nothing is consumed)
/// - `Err(...)` if the data is invalid
pub fn decode(buf: &mut BytesMut) -> Result<Option<ClientOp>, CodecError> {
    let line_end = match buf.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        None if buf.len() > MAX_CONTROL_LINE => return Err(CodecError::ControlLineTooLong),
        None => return Ok(None),
    };

    if line_end > MAX_CONTROL_LINE {
        return Err(CodecError::ControlLineTooLong);
    }

    let line = std::str::from_utf8(&buf[..line_end])
        .map_err(|_| CodecError::InvalidUtf8)?
        .trim_end_matches('\r')
        .to_string();

    let (op, args) = match line.split_once(char::is_whitespace) {
        Some((op, rest)) => (op.to_ascii_uppercase(), rest.trim()),
        None => (line.trim().to_ascii_uppercase(), ""),
    };

    let parsed = match op.as_str() {
        "PUB" => {
            let (subject, reply, len) = parse_pub_args(args, &line)?;
            let payload_start = line_end + 1;
            let needed = payload_start + len + 2;
            if buf.len() < needed {
                return Ok(None);
            }
            if &buf[payload_start + len..needed] != b"\r\n" {
                return Err(CodecError::MissingTerminator);
            }

            buf.advance(payload_start);
            let payload = buf.split_to(len).freeze();
            buf.advance(2);

            // Validated after consuming so the stream stays aligned
            if !subject::is_valid(&subject, false) {
                return Err(CodecError::InvalidSubject(subject));
            }

            return Ok(Some(ClientOp::Pub {
                subject,
                reply,
                payload,
            }));
        }
        "SUB" => parse_sub_args(args, &line)?,
        "UNSUB" => parse_unsub_args(args, &line)?,
        "CONNECT" => {
            let info: ConnectInfo = if args.is_empty() {
                ConnectInfo::default()
            } else {
                serde_json::from_str(args)?
            };
            ClientOp::Connect(info)
        }
        "PING" => ClientOp::Ping,
        "PONG" => ClientOp::Pong,
        "" => {
            // Blank keep-alive line
            buf.advance(line_end + 1);
            return decode(buf);
        }
        _ => return Err(CodecError::UnknownOperation(op)),
    };

    buf.advance(line_end + 1);
    if let ClientOp::Sub { subject, .. } = &parsed {
        if !subject::is_valid(subject, true) {
            return Err(CodecError::InvalidSubject(subject.clone()));
        }
    }
    Ok(Some(parsed))
}

fn parse_pub_args(args: &str, line: &str) -> Result<(String, Option<String>, usize), CodecError> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    let invalid = || CodecError::InvalidArguments {
        op: "PUB",
        line: line.to_string(),
    };

    let (subject, reply, len) = match parts.as_slice() {
        [subject, len] => (*subject, None, *len),
        [subject, reply, len] => (*subject, Some(reply.to_string()), *len),
        _ => return Err(invalid()),
    };

    let len: usize = len.parse().map_err(|_| invalid())?;
    if len > MAX_PAYLOAD {
        return Err(CodecError::PayloadTooLarge(len));
    }

    Ok((subject.to_string(), reply, len))
}

fn parse_sub_args(args: &str, line: &str) -> Result<ClientOp, CodecError> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    let (subject, queue, sid) = match parts.as_slice() {
        [subject, sid] => (*subject, None, *sid),
        [subject, queue, sid] => (*subject, Some(queue.to_string()), *sid),
        _ => {
            return Err(CodecError::InvalidArguments {
                op: "SUB",
                line: line.to_string(),
            })
        }
    };

    Ok(ClientOp::Sub {
        subject: subject.to_string(),
        queue,
        sid: sid.to_string(),
    })
}

fn parse_unsub_args(args: &str, line: &str) -> Result<ClientOp, CodecError> {
    let invalid = || CodecError::InvalidArguments {
        op: "UNSUB",
        line: line.to_string(),
    };

    let parts: Vec<&str> = args.split_whitespace().collect();
    match parts.as_slice() {
        [sid] => Ok(ClientOp::Unsub {
            sid: sid.to_string(),
            max: None,
        }),
        [sid, max] => Ok(ClientOp::Unsub {
            sid: sid.to_string(),
            max: Some(max.parse().map_err(|_| invalid())?),
        }),
        _ => Err(invalid()),
    }
}

/// Encode the INFO greeting
pub fn encode_info(info: &ServerInfo) -> Bytes {
    // ServerInfo only holds plain fields, serialization cannot fail
    let json = serde_json::to_string(info).unwrap_or_else(|_| "{}".into());
    let mut buf = BytesMut::with_capacity(json.len() + 7);
    buf.put_slice(b"INFO ");
    buf.put_slice(json.as_bytes());
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Encode a MSG delivery for one subscription
pub fn encode_msg(subject: &str, sid: &str, reply: Option<&str>, payload: &[u8]) -> Bytes {
    let header = match reply {
        Some(reply) => format!("MSG {} {} {} {}\r\n", subject, sid, reply, payload.len()),
        None => format!("MSG {} {} {}\r\n", subject, sid, payload.len()),
    };

    let mut buf = BytesMut::with_capacity(header.len() + payload.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Encode a protocol error
pub fn encode_err(message: &str) -> Bytes {
    Bytes::from(format!("-ERR '{}'\r\n", message))
}

/// Decoder state machine for streaming decoding
#[derive(Debug, Default)]
pub struct ProtocolDecoder {
    /// Partial operation data being accumulated
    buffer: BytesMut,
}

impl ProtocolDecoder {
    /// Create a new protocol decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next operation from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete operations
    pub fn decode_next(&mut self) -> Result<Option<ClientOp>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
