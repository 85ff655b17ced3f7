//! Streaming MAVLink frame decoder
//!
//! Frames arrive as arbitrary chunks from serial, UDP or TCP. Complete frames
//! are split off by their length fields and decoded one at a time:
//! ```text
//! v1: [ 0xFE ][ len ][ seq ][ sys ][ comp ][ msgid ][ payload: len ][ crc: 2 ]
//! v2: [ 0xFD ][ len ][ incompat ][ compat ][ seq ][ sys ][ comp ][ msgid: 3 ]
//!     [ payload: len ][ crc: 2 ][ signature: 13, if incompat & 0x01 ]
//! ```
//! A frame that fails to decode drops only its start byte, so the decoder
//! resynchronises on the next magic byte.

use bytes::{Buf, BytesMut};
use mavlink::common::MavMessage;
use mavlink::peek_reader::PeekReader;
use mavlink::{MavHeader, MavlinkVersion};
use thiserror::Error;

const MAGIC_V1: u8 = 0xFE;
const MAGIC_V2: u8 = 0xFD;
const V1_HEADER_LEN: usize = 6;
const V2_HEADER_LEN: usize = 10;
const CHECKSUM_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
const IFLAG_SIGNED: u8 = 0x01;

/// Errors produced while splitting or decoding frames
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid MAVLink {version:?} frame (msg len {len}): {reason}")]
    Invalid {
        version: MavlinkVersion,
        len: usize,
        reason: String,
    },
}

/// One decoded frame
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub version: MavlinkVersion,
    pub header: MavHeader,
    pub message: MavMessage,
}

/// Decoder state machine for streaming decoding
#[derive(Debug, Default)]
pub struct MavFrameDecoder {
    buffer: BytesMut,
    discarded: u64,
}

impl MavFrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            discarded: 0,
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete
    /// frames. An `Err` consumes one byte; keep calling afterwards.
    pub fn decode_next(&mut self) -> Result<Option<DecodedFrame>, FrameError> {
        match self.buffer.iter().position(|b| *b == MAGIC_V1 || *b == MAGIC_V2) {
            Some(0) => {}
            Some(n) => {
                self.discarded += n as u64;
                self.buffer.advance(n);
            }
            None => {
                self.discarded += self.buffer.len() as u64;
                self.buffer.clear();
                return Ok(None);
            }
        }

        let (version, total) = match self.buffer[0] {
            MAGIC_V2 => {
                if self.buffer.len() < 3 {
                    return Ok(None);
                }
                let len = self.buffer[1] as usize;
                let signed = self.buffer[2] & IFLAG_SIGNED != 0;
                let signature = if signed { SIGNATURE_LEN } else { 0 };
                (MavlinkVersion::V2, V2_HEADER_LEN + len + CHECKSUM_LEN + signature)
            }
            _ => {
                if self.buffer.len() < 2 {
                    return Ok(None);
                }
                let len = self.buffer[1] as usize;
                (MavlinkVersion::V1, V1_HEADER_LEN + len + CHECKSUM_LEN)
            }
        };

        if self.buffer.len() < total {
            return Ok(None);
        }

        let result = {
            let mut reader = PeekReader::new(&self.buffer[..total]);
            match version {
                MavlinkVersion::V2 => mavlink::read_v2_msg::<MavMessage, _>(&mut reader),
                MavlinkVersion::V1 => mavlink::read_v1_msg::<MavMessage, _>(&mut reader),
            }
        };

        match result {
            Ok((header, message)) => {
                self.buffer.advance(total);
                Ok(Some(DecodedFrame {
                    version,
                    header,
                    message,
                }))
            }
            Err(e) => {
                let len = self.buffer[1] as usize;
                self.buffer.advance(1);
                self.discarded += 1;
                Err(FrameError::Invalid {
                    version,
                    len,
                    reason: format!("{:?}", e),
                })
            }
        }
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes dropped while resynchronising
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mavlink::common::{
        MavAutopilot, MavModeFlag, MavState, MavType, HEARTBEAT_DATA,
    };

    pub(crate) fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 4,
            mavtype: MavType::MAV_TYPE_GROUND_ROVER,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    pub(crate) fn encode_v2(message: &MavMessage, sequence: u8) -> Vec<u8> {
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence,
        };
        let mut buf = Vec::new();
        mavlink::write_v2_msg(&mut buf, header, message).unwrap();
        buf
    }

    /// A heartbeat frame whose checksum no longer matches
    pub(crate) fn corrupt_v2(message: &MavMessage) -> Vec<u8> {
        let mut frame = encode_v2(message, 0);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        frame
    }

    #[test]
    fn test_decode_v2_frame() {
        let mut decoder = MavFrameDecoder::new();
        decoder.extend(&encode_v2(&heartbeat(), 7));

        let frame = decoder.decode_next().unwrap().expect("frame");
        assert_eq!(frame.header.system_id, 1);
        assert_eq!(frame.header.sequence, 7);
        assert!(matches!(frame.message, MavMessage::HEARTBEAT(_)));
        assert!(decoder.decode_next().unwrap().is_none());
        assert_eq!(decoder.buffer_len(), 0);
    }

    #[test]
    fn test_decode_v1_frame() {
        let header = MavHeader {
            system_id: 3,
            component_id: 1,
            sequence: 0,
        };
        let mut buf = Vec::new();
        mavlink::write_v1_msg(&mut buf, header, &heartbeat()).unwrap();

        let mut decoder = MavFrameDecoder::new();
        decoder.extend(&buf);

        let frame = decoder.decode_next().unwrap().expect("frame");
        assert!(matches!(frame.version, MavlinkVersion::V1));
        assert_eq!(frame.header.system_id, 3);
    }

    #[test]
    fn test_partial_frames_wait_for_more_data() {
        let bytes = encode_v2(&heartbeat(), 0);
        let (first, second) = bytes.split_at(5);

        let mut decoder = MavFrameDecoder::new();
        decoder.extend(first);
        assert!(decoder.decode_next().unwrap().is_none());

        decoder.extend(second);
        assert!(decoder.decode_next().unwrap().is_some());
    }

    #[test]
    fn test_garbage_before_frame_is_skipped() {
        let mut decoder = MavFrameDecoder::new();
        decoder.extend(&[0x00, 0x11, 0x22]);
        decoder.extend(&encode_v2(&heartbeat(), 0));

        assert!(decoder.decode_next().unwrap().is_some());
        assert_eq!(decoder.discarded(), 3);
    }

    #[test]
    fn test_corrupt_frame_resyncs_on_next() {
        let mut decoder = MavFrameDecoder::new();
        decoder.extend(&corrupt_v2(&heartbeat()));
        decoder.extend(&encode_v2(&heartbeat(), 1));

        let mut frames = 0;
        let mut errors = 0;
        loop {
            match decoder.decode_next() {
                Ok(Some(_)) => frames += 1,
                Ok(None) => break,
                Err(_) => errors += 1,
            }
        }

        assert_eq!(frames, 1);
        assert!(errors >= 1);
        assert_eq!(decoder.buffer_len(), 0);
    }
}
