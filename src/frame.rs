//! Fixed 12-byte frame header: encode/decode and the flag/type vocabulary.
//!
//! ```text
//! 0       1       2               6               10              12
//! +-------+-------+---------------+---------------+---------------+
//! |  ver  | type  |     flags     |   stream id    |    length     |
//! +-------+-------+---------------+---------------+---------------+
//! ```
//!
//! `length` means different things per type: Data payload byte count,
//! WindowUpdate credit delta, Ping token, GoAway error code. Only Data
//! frames carry a body; the other three are header-only.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;

use crate::error::{Error, Result};

/// The only wire version this crate speaks.
pub const VERSION: u8 = 0;

/// Header size in bytes.
pub const HEADER_LEN: usize = 12;

/// Default per-stream flow-control window, 256 KiB.
pub const INITIAL_STREAM_WINDOW: u32 = 262_144;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    WindowUpdate = 1,
    Ping = 2,
    GoAway = 3,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrameType::Data => "Data",
            FrameType::WindowUpdate => "WindowUpdate",
            FrameType::Ping => "Ping",
            FrameType::GoAway => "GoAway",
        };
        f.write_str(s)
    }
}

impl FrameType {
    /// Session-level frames (Ping, GoAway) carry stream id 0; the other two
    /// are always addressed to a specific stream.
    fn is_session_level(self) -> bool {
        matches!(self, FrameType::Ping | FrameType::GoAway)
    }
}

bitflags::bitflags! {
    /// Control flags, bitwise-ORed into the header's 16-bit flags field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u16 {
        const SYN = 0x1;
        const ACK = 0x2;
        const FIN = 0x4;
        const RST = 0x8;
    }
}

/// Error codes carried in a GoAway frame's `length` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum GoAwayCode {
    Normal = 0,
    ProtocolError = 1,
    InternalError = 2,
}

/// Decoded 12-byte header, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: Flags,
    pub stream_id: u32,
    pub length: u32,
}

impl Header {
    pub fn new(frame_type: FrameType, flags: Flags, stream_id: u32, length: u32) -> Header {
        Header {
            version: VERSION,
            frame_type,
            flags,
            stream_id,
            length,
        }
    }

    pub fn data(stream_id: u32, flags: Flags, payload_len: u32) -> Header {
        Header::new(FrameType::Data, flags, stream_id, payload_len)
    }

    pub fn window_update(stream_id: u32, flags: Flags, delta: u32) -> Header {
        Header::new(FrameType::WindowUpdate, flags, stream_id, delta)
    }

    pub fn ping(flags: Flags, token: u32) -> Header {
        Header::new(FrameType::Ping, flags, 0, token)
    }

    pub fn go_away(code: GoAwayCode) -> Header {
        Header::new(FrameType::GoAway, Flags::empty(), 0, code.into())
    }

    /// Encode into exactly [`HEADER_LEN`] bytes.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_u8(self.version);
        buf.put_u8(self.frame_type.into());
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.stream_id);
        buf.put_u32(self.length);
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode a 12-byte header, validating version/type/stream-id rules.
    ///
    /// Rejects `version != 0`, an unrecognized `type` byte, stream-level
    /// frames addressed to id 0, and session-level frames addressed to a
    /// nonzero id. Flag legality is the stream state machine's concern, not
    /// the codec's.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn decode(mut buf: &[u8]) -> Result<Header> {
        debug_assert!(buf.len() >= HEADER_LEN);
        let version = buf.get_u8();
        if version != VERSION {
            return Err(Error::InvalidVersion);
        }
        let raw_type = buf.get_u8();
        let frame_type = FrameType::try_from(raw_type).map_err(|_| Error::InvalidMsgType)?;
        let raw_flags = buf.get_u16();
        let flags = Flags::from_bits_truncate(raw_flags);
        let stream_id = buf.get_u32();
        let length = buf.get_u32();

        if frame_type.is_session_level() {
            if stream_id != 0 {
                return Err(Error::InvalidStreamId(frame_type, stream_id));
            }
        } else if stream_id == 0 {
            return Err(Error::InvalidStreamId(frame_type, stream_id));
        }

        Ok(Header {
            version,
            frame_type,
            flags,
            stream_id,
            length,
        })
    }
}

/// A fully decoded frame: header plus payload (only Data frames carry one).
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: Header, payload: Bytes) -> Frame {
        Frame { header, payload }
    }

    pub fn control(header: Header) -> Frame {
        Frame {
            header,
            payload: Bytes::new(),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stream={} flags={:?} len={}",
            self.header.frame_type, self.header.stream_id, self.header.flags, self.header.length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let headers = [
            Header::data(1, Flags::SYN, 3),
            Header::data(2, Flags::empty(), 0),
            Header::window_update(3, Flags::FIN, 16),
            Header::ping(Flags::SYN, 0xdead_beef),
            Header::go_away(GoAwayCode::ProtocolError),
        ];
        for h in headers {
            let encoded = h.encode();
            let decoded = Header::decode(&encoded).unwrap();
            assert_eq!(h, decoded);
        }
    }

    #[test]
    fn rejects_bad_version() {
        let mut bytes = Header::data(1, Flags::empty(), 0).encode();
        bytes[0] = 7;
        assert!(matches!(Header::decode(&bytes), Err(Error::InvalidVersion)));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut bytes = Header::data(1, Flags::empty(), 0).encode();
        bytes[1] = 99;
        assert!(matches!(Header::decode(&bytes), Err(Error::InvalidMsgType)));
    }

    #[test]
    fn rejects_stream_level_frame_with_zero_id() {
        let bytes = Header::data(0, Flags::empty(), 0).encode();
        assert!(matches!(
            Header::decode(&bytes),
            Err(Error::InvalidStreamId(FrameType::Data, 0))
        ));
    }

    #[test]
    fn rejects_session_level_frame_with_nonzero_id() {
        let mut bytes = Header::ping(Flags::empty(), 0).encode();
        bytes[6..10].copy_from_slice(&7u32.to_be_bytes());
        assert!(matches!(
            Header::decode(&bytes),
            Err(Error::InvalidStreamId(FrameType::Ping, 7))
        ));
    }

    #[test]
    fn window_update_can_carry_bare_fin() {
        let h = Header::window_update(5, Flags::FIN, 0);
        let decoded = Header::decode(&h.encode()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::WindowUpdate);
        assert!(decoded.flags.contains(Flags::FIN));
        assert_eq!(decoded.length, 0);
    }
}
