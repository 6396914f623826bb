//! Tunnel wire frames: a big-endian `u16` length followed by a protobuf
//! `Message { type = 1, streamId = 2, payload = 3 }`.

use bytes::{Buf, Bytes, BytesMut};
use prost::Message as _;

use iotdev_protocol::{IotError, IotResult};

/// Largest encoded frame the length prefix can describe.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

const PREFIX_LEN: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FrameType {
    Unknown = 0,
    StreamStart = 1,
    StreamReset = 2,
    SessionReset = 3,
    Data = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Frame {
    #[prost(enumeration = "FrameType", tag = "1")]
    pub r#type: i32,
    #[prost(int32, tag = "2")]
    pub stream_id: i32,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
}

impl Frame {
    pub fn stream_start(stream_id: i32) -> Self {
        Self::control(FrameType::StreamStart, stream_id)
    }

    pub fn stream_reset(stream_id: i32) -> Self {
        Self::control(FrameType::StreamReset, stream_id)
    }

    pub fn session_reset() -> Self {
        Self::control(FrameType::SessionReset, 0)
    }

    pub fn data(stream_id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            r#type: FrameType::Data as i32,
            stream_id,
            payload: payload.into(),
        }
    }

    fn control(kind: FrameType, stream_id: i32) -> Self {
        Self {
            r#type: kind as i32,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// The frame type, or `None` for values this side does not know.
    pub fn kind(&self) -> Option<FrameType> {
        FrameType::try_from(self.r#type).ok()
    }

    /// Length-prefixed encoding.
    pub fn to_wire(&self) -> IotResult<Vec<u8>> {
        let len = self.encoded_len();
        if len > MAX_FRAME_LEN {
            return Err(IotError::Invalid(format!(
                "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }
        let mut out = Vec::with_capacity(PREFIX_LEN + len);
        out.extend_from_slice(&(len as u16).to_be_bytes());
        self.encode(&mut out)
            .map_err(|e| IotError::Decode(e.to_string()))?;
        Ok(out)
    }
}

/// Reassembles frames from arbitrarily chunked input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, if one is buffered.
    ///
    /// A frame whose body fails to decode is consumed and reported, so the
    /// caller can carry on with the following frames.
    pub fn next_frame(&mut self) -> Option<IotResult<Frame>> {
        if self.buf.len() < PREFIX_LEN {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < PREFIX_LEN + len {
            return None;
        }
        self.buf.advance(PREFIX_LEN);
        let body = self.buf.split_to(len).freeze();
        Some(Frame::decode(body).map_err(|e| IotError::Decode(format!("tunnel frame: {e}"))))
    }
}
