//! Peer wire messages: a 4-byte big-endian length prefix followed by a
//! type-tagged payload (BEP 3 §"peer messages"). `FrameReader` is the
//! resumable parser that turns a stream of arbitrary-sized reads into
//! complete [`Message`] values, regardless of how the bytes were split
//! across TCP segments.

use bytes::{Buf, BytesMut};
use std::io::{Error, ErrorKind};

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;

impl Message {
    /// Encodes the message with its 4-byte length prefix. Always produces
    /// exactly `4 + payload_len` bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => 0u32.to_be_bytes().to_vec(),
            Message::Choke => frame(CHOKE, &[]),
            Message::Unchoke => frame(UNCHOKE, &[]),
            Message::Interested => frame(INTERESTED, &[]),
            Message::NotInterested => frame(NOT_INTERESTED, &[]),
            Message::Have(index) => frame(HAVE, &index.to_be_bytes()),
            Message::Bitfield(bits) => frame(BITFIELD, bits),
            Message::Request { index, begin, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                frame(REQUEST, &payload)
            }
            Message::Piece { index, begin, block } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                frame(PIECE, &payload)
            }
            Message::Cancel { index, begin, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                frame(CANCEL, &payload)
            }
        }
    }

    /// Decodes a single message body (the bytes after the length prefix).
    /// `payload` must be non-empty; a zero-length frame is KEEP-ALIVE and is
    /// handled by the caller before reaching here.
    fn decode(payload: &[u8]) -> Result<Message, Error> {
        let id = payload[0];
        let body = &payload[1..];
        match id {
            CHOKE => Ok(Message::Choke),
            UNCHOKE => Ok(Message::Unchoke),
            INTERESTED => Ok(Message::Interested),
            NOT_INTERESTED => Ok(Message::NotInterested),
            HAVE => {
                let index = read_u32(body, "HAVE")?;
                Ok(Message::Have(index))
            }
            BITFIELD => Ok(Message::Bitfield(body.to_vec())),
            REQUEST => {
                let (index, begin, length) = read_three_u32(body, "REQUEST")?;
                Ok(Message::Request { index, begin, length })
            }
            PIECE => {
                if body.len() < 8 {
                    return Err(invalid("PIECE message too short"));
                }
                let index = u32::from_be_bytes(body[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(body[4..8].try_into().unwrap());
                Ok(Message::Piece {
                    index,
                    begin,
                    block: body[8..].to_vec(),
                })
            }
            CANCEL => {
                let (index, begin, length) = read_three_u32(body, "CANCEL")?;
                Ok(Message::Cancel { index, begin, length })
            }
            other => Err(invalid(&format!("unknown message id {other}"))),
        }
    }
}

fn frame(id: u8, body: &[u8]) -> Vec<u8> {
    let len = 1 + body.len() as u32;
    let mut out = Vec::with_capacity(4 + len as usize);
    out.extend_from_slice(&len.to_be_bytes());
    out.push(id);
    out.extend_from_slice(body);
    out
}

fn invalid(msg: &str) -> Error {
    Error::new(ErrorKind::InvalidData, msg.to_string())
}

fn read_u32(body: &[u8], what: &str) -> Result<u32, Error> {
    if body.len() != 4 {
        return Err(invalid(&format!("{what} payload must be 4 bytes")));
    }
    Ok(u32::from_be_bytes(body.try_into().unwrap()))
}

fn read_three_u32(body: &[u8], what: &str) -> Result<(u32, u32, u32), Error> {
    if body.len() != 12 {
        return Err(invalid(&format!("{what} payload must be 12 bytes")));
    }
    let index = u32::from_be_bytes(body[0..4].try_into().unwrap());
    let begin = u32::from_be_bytes(body[4..8].try_into().unwrap());
    let length = u32::from_be_bytes(body[8..12].try_into().unwrap());
    Ok((index, begin, length))
}

/// An upper bound on a single frame's payload, generous enough for a
/// maximal PIECE block plus the 9-byte header, guarding against a peer
/// claiming an absurd length and making us allocate unbounded memory.
const MAX_PAYLOAD_LEN: u32 = 1 << 20;

/// Resumable frame parser: bytes arriving from `feed()` accumulate in an
/// internal buffer across calls, so a message split across any number of
/// TCP segments still decodes to exactly one `Message`.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> FrameReader {
        FrameReader { buf: BytesMut::new() }
    }

    /// Appends `data` to the internal buffer and returns every message that
    /// is now fully framed. Partial frames remain buffered for the next
    /// call. Returns an error on a length prefix that looks impossible
    /// (caller should treat this as a protocol violation and close the peer).
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Message>, Error> {
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes(self.buf[0..4].try_into().unwrap());
            if len > MAX_PAYLOAD_LEN {
                return Err(invalid(&format!("frame length {len} exceeds sane maximum")));
            }
            if self.buf.len() < 4 + len as usize {
                break;
            }

            self.buf.advance(4);
            if len == 0 {
                messages.push(Message::KeepAlive);
                continue;
            }
            let payload = self.buf.split_to(len as usize);
            messages.push(Message::decode(&payload)?);
        }

        Ok(messages)
    }
}
