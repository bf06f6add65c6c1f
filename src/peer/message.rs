//! Peer message framing and the packed bitfield representation.
//!
//! Every message is a length-prefixed frame: a 4-byte big-endian length
//! followed by that many bytes, the first of which is the message id. A
//! zero length is a keep-alive with no body.
use crate::peer::PeerError;
use crate::peer::PeerResult;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const MSG_CHOKE: u8 = 0;
const MSG_UNCHOKE: u8 = 1;
const MSG_INTERESTED: u8 = 2;
const MSG_NOT_INTERESTED: u8 = 3;
const MSG_HAVE: u8 = 4;
const MSG_BITFIELD: u8 = 5;
const MSG_REQUEST: u8 = 6;
const MSG_PIECE: u8 = 7;
const MSG_CANCEL: u8 = 8;

/// Upper bound on a single frame. The largest legitimate frame is a whole
/// piece plus its 9-byte header; anything past this is a hostile length
/// prefix, not data.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
    /// An id we do not understand. Logged and skipped, never fatal.
    Unknown(u8),
}

impl Message {
    /// Serializes the message as a complete frame, length prefix included.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_header(&mut buf, MSG_CHOKE, 0),
            Message::Unchoke => put_header(&mut buf, MSG_UNCHOKE, 0),
            Message::Interested => put_header(&mut buf, MSG_INTERESTED, 0),
            Message::NotInterested => put_header(&mut buf, MSG_NOT_INTERESTED, 0),
            Message::Have(index) => {
                put_header(&mut buf, MSG_HAVE, 4);
                buf.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                put_header(&mut buf, MSG_BITFIELD, bits.len() as u32);
                buf.put_slice(bits);
            }
            Message::Request(index, begin, length) => {
                put_header(&mut buf, MSG_REQUEST, 12);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece(index, begin, block) => {
                put_header(&mut buf, MSG_PIECE, 8 + block.len() as u32);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel(index, begin, length) => {
                put_header(&mut buf, MSG_CANCEL, 12);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Unknown(id) => put_header(&mut buf, *id, 0),
        }
        buf.freeze()
    }

    /// Parses a frame body. Fixed-size payloads are checked strictly; a
    /// mismatch is a protocol violation for that message.
    pub fn parse(id: u8, payload: &[u8]) -> PeerResult<Message> {
        let msg = match id {
            MSG_CHOKE => {
                expect_len(id, payload, 0)?;
                Message::Choke
            }
            MSG_UNCHOKE => {
                expect_len(id, payload, 0)?;
                Message::Unchoke
            }
            MSG_INTERESTED => {
                expect_len(id, payload, 0)?;
                Message::Interested
            }
            MSG_NOT_INTERESTED => {
                expect_len(id, payload, 0)?;
                Message::NotInterested
            }
            MSG_HAVE => {
                expect_len(id, payload, 4)?;
                Message::Have(BigEndian::read_u32(payload))
            }
            MSG_BITFIELD => Message::Bitfield(payload.to_vec()),
            MSG_REQUEST => {
                expect_len(id, payload, 12)?;
                Message::Request(
                    BigEndian::read_u32(&payload[0..4]),
                    BigEndian::read_u32(&payload[4..8]),
                    BigEndian::read_u32(&payload[8..12]),
                )
            }
            MSG_PIECE => {
                if payload.len() < 8 {
                    return Err(PeerError::Protocol(format!(
                        "piece payload too short: {} bytes",
                        payload.len()
                    )));
                }
                Message::Piece(
                    BigEndian::read_u32(&payload[0..4]),
                    BigEndian::read_u32(&payload[4..8]),
                    payload[8..].to_vec(),
                )
            }
            MSG_CANCEL => {
                expect_len(id, payload, 12)?;
                Message::Cancel(
                    BigEndian::read_u32(&payload[0..4]),
                    BigEndian::read_u32(&payload[4..8]),
                    BigEndian::read_u32(&payload[8..12]),
                )
            }
            other => Message::Unknown(other),
        };
        Ok(msg)
    }
}

fn put_header(buf: &mut BytesMut, id: u8, payload_len: u32) {
    buf.put_u32(payload_len + 1);
    buf.put_u8(id);
}

fn expect_len(id: u8, payload: &[u8], expected: usize) -> PeerResult<()> {
    if payload.len() != expected {
        return Err(PeerError::Protocol(format!(
            "message id {} expects {} payload bytes, got {}",
            id,
            expected,
            payload.len()
        )));
    }
    Ok(())
}

/// Reads one frame from `stream`: length prefix, id, payload.
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> PeerResult<Message> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let length = u32::from_be_bytes(len_buf);

    if length == 0 {
        return Ok(Message::KeepAlive);
    }
    if length > MAX_FRAME_LEN {
        return Err(PeerError::Protocol(format!(
            "frame length {} exceeds maximum",
            length
        )));
    }

    let mut id = [0u8; 1];
    stream.read_exact(&mut id).await?;

    let mut payload = vec![0u8; length as usize - 1];
    stream.read_exact(&mut payload).await?;

    Message::parse(id[0], &payload)
}

/// Packs an owned bitmap MSB-first: piece `i` maps to bit `7 - (i % 8)` of
/// byte `i / 8`. Trailing padding bits are zero.
pub fn pack_bitfield(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (i, set) in bits.iter().enumerate() {
        if *set {
            packed[i / 8] |= 1 << (7 - (i % 8));
        }
    }
    packed
}

/// Inverse of [`pack_bitfield`], truncated at `num_pieces` bits.
pub fn unpack_bitfield(packed: &[u8], num_pieces: usize) -> Vec<bool> {
    (0..num_pieces)
        .map(|i| {
            packed
                .get(i / 8)
                .is_some_and(|byte| byte & (1 << (7 - (i % 8))) != 0)
        })
        .collect()
}
