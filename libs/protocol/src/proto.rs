//! The framed client protocol.
//!
//! Every client-facing message is a fixed header plus an opaque body:
//!
//! ```text
//! | pkg_len: u32 | header_len: u16 | ver: u16 | op: i32 | seq: i32 | body … |
//! ```
//!
//! All header fields are little-endian. `header_len` is always 16;
//! `pkg_len` covers header and body. `Proto` is also a protobuf message so it
//! can be embedded verbatim in RPC payloads.

use bytes::{Buf, BufMut, BytesMut};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Ceiling on the body of a single frame.
pub const MAX_BODY_SIZE: usize = 1 << 20;

/// Protocol version stamped on server-built frames.
pub const VERSION: i32 = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("frame shorter than header ({0} bytes)")]
    Truncated(usize),
    #[error("invalid header length {0}")]
    InvalidHeader(u16),
    #[error("invalid package length {0}")]
    InvalidLength(u32),
    #[error("body exceeds limit ({0} bytes)")]
    BodyTooLarge(usize),
}

/// A single protocol frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Proto {
    #[prost(int32, tag = "1")]
    pub ver: i32,
    #[prost(int32, tag = "2")]
    pub op: i32,
    #[prost(int32, tag = "3")]
    pub seq: i32,
    #[prost(bytes = "vec", tag = "4")]
    pub body: Vec<u8>,
}

impl Proto {
    pub fn new(op: i32, body: Vec<u8>) -> Self {
        Self {
            ver: VERSION,
            op,
            seq: 0,
            body,
        }
    }

    /// Total encoded size of this frame.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Append the framed encoding of `self` to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtoError> {
        if self.body.len() > MAX_BODY_SIZE {
            return Err(ProtoError::BodyTooLarge(self.body.len()));
        }
        buf.reserve(self.frame_len());
        buf.put_u32_le(self.frame_len() as u32);
        buf.put_u16_le(HEADER_SIZE as u16);
        buf.put_u16_le(self.ver as u16);
        buf.put_i32_le(self.op);
        buf.put_i32_le(self.seq);
        buf.put_slice(&self.body);
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtoError> {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.write_to(&mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode one complete frame from `data`. Trailing bytes are rejected by
    /// the caller (TCP reads exactly `pkg_len`; a WebSocket message carries
    /// exactly one frame).
    pub fn read_frame(data: &[u8]) -> Result<Self, ProtoError> {
        let (proto, used) = Self::read_prefix(data)?;
        if used != data.len() {
            return Err(ProtoError::InvalidLength(data.len() as u32));
        }
        Ok(proto)
    }

    /// Decode the first frame from `data`, returning it together with the
    /// number of bytes consumed. Used when several frames are concatenated in
    /// one raw body.
    pub fn read_prefix(data: &[u8]) -> Result<(Self, usize), ProtoError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtoError::Truncated(data.len()));
        }
        let mut hdr = &data[..HEADER_SIZE];
        let pkg_len = hdr.get_u32_le();
        let header_len = hdr.get_u16_le();
        let ver = hdr.get_u16_le();
        let op = hdr.get_i32_le();
        let seq = hdr.get_i32_le();

        if header_len as usize != HEADER_SIZE {
            return Err(ProtoError::InvalidHeader(header_len));
        }
        if (pkg_len as usize) < HEADER_SIZE || (pkg_len as usize) > data.len() {
            return Err(ProtoError::InvalidLength(pkg_len));
        }
        let body_len = pkg_len as usize - HEADER_SIZE;
        if body_len > MAX_BODY_SIZE {
            return Err(ProtoError::BodyTooLarge(body_len));
        }

        Ok((
            Self {
                ver: ver as i32,
                op,
                seq,
                body: data[HEADER_SIZE..pkg_len as usize].to_vec(),
            },
            pkg_len as usize,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;

    #[test]
    fn encode_decode_round_trips() {
        let mut p = Proto::new(1000, b"hello".to_vec());
        p.seq = 7;
        let frame = p.to_frame().unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 5);

        let decoded = Proto::read_frame(&frame).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn empty_body_round_trips() {
        let p = Proto::new(ops::OP_HEARTBEAT, Vec::new());
        let frame = p.to_frame().unwrap();
        assert_eq!(frame.len(), HEADER_SIZE);
        assert_eq!(Proto::read_frame(&frame).unwrap(), p);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let err = Proto::read_frame(&[0u8; 7]).unwrap_err();
        assert_eq!(err, ProtoError::Truncated(7));
    }

    #[test]
    fn bad_header_len_is_rejected() {
        let mut frame = Proto::new(2, Vec::new()).to_frame().unwrap();
        frame[4] = 15;
        frame[5] = 0;
        assert_eq!(
            Proto::read_frame(&frame).unwrap_err(),
            ProtoError::InvalidHeader(15)
        );
    }

    #[test]
    fn pkg_len_shorter_than_header_is_rejected() {
        let mut frame = Proto::new(2, Vec::new()).to_frame().unwrap();
        frame[0] = 4;
        assert!(matches!(
            Proto::read_frame(&frame).unwrap_err(),
            ProtoError::InvalidLength(_)
        ));
    }

    #[test]
    fn oversized_body_is_rejected_on_encode() {
        let p = Proto::new(9, vec![0u8; MAX_BODY_SIZE + 1]);
        assert!(matches!(
            p.to_frame().unwrap_err(),
            ProtoError::BodyTooLarge(_)
        ));
    }

    #[test]
    fn read_prefix_walks_concatenated_frames() {
        let mut buf = BytesMut::new();
        let a = Proto::new(1000, b"one".to_vec());
        let b = Proto::new(1001, b"two".to_vec());
        a.write_to(&mut buf).unwrap();
        b.write_to(&mut buf).unwrap();

        let data = buf.freeze();
        let (first, used) = Proto::read_prefix(&data).unwrap();
        assert_eq!(first, a);
        let (second, used2) = Proto::read_prefix(&data[used..]).unwrap();
        assert_eq!(second, b);
        assert_eq!(used + used2, data.len());
    }
}
