//! # Control Frames
//!
//! The fixed set of commands two engines exchange, and their wire encoding.
//!
//! ## Wire Format
//! ```text
//! [Command(1)] [Length(4, big-endian)] [Payload(N)]
//! ```
//!
//! | cmd | frame    | payload                     |
//! |-----|----------|-----------------------------|
//! | 1   | halo     | protocol version, 1 byte    |
//! | 2   | auth     | UTF-8 credential            |
//! | 3   | accepted | UTF-8 welcome               |
//! | 4   | rejected | UTF-8 reason                |
//! | 5   | ping     | u64 big-endian timestamp    |
//! | 6   | pong     | u64 big-endian timestamp    |
//! | 7   | data     | opaque bytes                |
//!
//! TCP peers run the codec over the byte stream. UDP peers decode each
//! datagram on its own and reject datagrams that end mid-frame.
//!
//! The length is validated against the configured maximum before any
//! payload is buffered.

use crate::config::MAX_FRAME_SIZE;
use crate::error::{constants, NetError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the command byte plus the length prefix
pub const HEADER_LEN: usize = 5;

const CMD_HALO: u8 = 1;
const CMD_AUTH: u8 = 2;
const CMD_ACCEPTED: u8 = 3;
const CMD_REJECTED: u8 = 4;
const CMD_PING: u8 = 5;
const CMD_PONG: u8 = 6;
const CMD_DATA: u8 = 7;

/// One control command on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Halo(u8),
    Auth(String),
    Accepted(String),
    Rejected(String),
    Ping(u64),
    Pong(u64),
    Data(Bytes),
}

impl Frame {
    fn command(&self) -> u8 {
        match self {
            Frame::Halo(_) => CMD_HALO,
            Frame::Auth(_) => CMD_AUTH,
            Frame::Accepted(_) => CMD_ACCEPTED,
            Frame::Rejected(_) => CMD_REJECTED,
            Frame::Ping(_) => CMD_PING,
            Frame::Pong(_) => CMD_PONG,
            Frame::Data(_) => CMD_DATA,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Halo(_) => 1,
            Frame::Auth(s) | Frame::Accepted(s) | Frame::Rejected(s) => s.len(),
            Frame::Ping(_) | Frame::Pong(_) => 8,
            Frame::Data(b) => b.len(),
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Halo(_) => "halo",
            Frame::Auth(_) => "auth",
            Frame::Accepted(_) => "accepted",
            Frame::Rejected(_) => "rejected",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::Data(_) => "data",
        }
    }

    /// Total encoded size
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload_len()
    }
}

/// Length-prefixed codec for [`Frame`]s
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Largest payload this codec accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Decode every frame of a single datagram
    pub fn decode_datagram(&mut self, datagram: &[u8]) -> Result<Vec<Frame>> {
        let mut buf = BytesMut::from(datagram);
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(&mut buf)? {
            frames.push(frame);
        }
        if !buf.is_empty() {
            return Err(NetError::InvalidFrame(constants::ERR_TRAILING_DATAGRAM));
        }
        Ok(frames)
    }

    /// Encode a frame into a fresh buffer
    pub fn encode_to_vec(&mut self, frame: Frame) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        self.encode(frame, &mut buf)?;
        Ok(buf.to_vec())
    }
}

fn text(payload: Bytes) -> Result<String> {
    String::from_utf8(payload.to_vec()).map_err(|_| NetError::InvalidFrame(constants::ERR_BAD_UTF8))
}

fn timestamp(mut payload: Bytes) -> Result<u64> {
    if payload.len() != 8 {
        return Err(NetError::InvalidFrame(constants::ERR_BAD_TIMESTAMP));
    }
    Ok(payload.get_u64())
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let command = src[0];
        if !(CMD_HALO..=CMD_DATA).contains(&command) {
            return Err(NetError::InvalidFrame(constants::ERR_UNKNOWN_COMMAND));
        }

        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > self.max_frame_size {
            return Err(NetError::OversizedFrame(length));
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        let frame = match command {
            CMD_HALO => match payload.as_ref() {
                [version] => Frame::Halo(*version),
                _ => return Err(NetError::InvalidFrame(constants::ERR_BAD_HALO)),
            },
            CMD_AUTH => Frame::Auth(text(payload)?),
            CMD_ACCEPTED => Frame::Accepted(text(payload)?),
            CMD_REJECTED => Frame::Rejected(text(payload)?),
            CMD_PING => Frame::Ping(timestamp(payload)?),
            CMD_PONG => Frame::Pong(timestamp(payload)?),
            _ => Frame::Data(payload),
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = NetError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let length = frame.payload_len();
        if length > self.max_frame_size {
            return Err(NetError::OversizedFrame(length));
        }

        dst.reserve(HEADER_LEN + length);
        dst.put_u8(frame.command());
        dst.put_u32(length as u32);

        match frame {
            Frame::Halo(version) => dst.put_u8(version),
            Frame::Auth(s) | Frame::Accepted(s) | Frame::Rejected(s) => {
                dst.extend_from_slice(s.as_bytes())
            }
            Frame::Ping(ts) | Frame::Pong(ts) => dst.put_u64(ts),
            Frame::Data(b) => dst.extend_from_slice(&b),
        }
        Ok(())
    }
}
