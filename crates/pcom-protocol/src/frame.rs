//! Link-layer framing.
//!
//! Every payload travels in a frame:
//!
//! ```text
//! +------+-----+----------+--------+--------+-----------+------+
//! | 0x02 | seq | checksum | len_lo | len_hi | payload.. | 0x03 |
//! +------+-----+----------+--------+--------+-----------+------+
//!         \_____________ escaped, sums to 0 ___________/
//! ```
//!
//! The low nibble of `seq` is the sequence number and the high nibble the
//! packet type. Inside the body, the start, end and escape bytes are sent as
//! `0x10, byte + 0x10`.

use bytes::{Buf, BytesMut};

use crate::constants::*;
use crate::error::{ProtocolError, ProtocolResult};

/// Largest frame on the wire: a maximum payload with every body byte escaped.
pub const MAX_FRAME_SIZE: usize = 2 * (FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE) + 2;

/// Initial accumulator capacity; the buffer grows up to [`MAX_FRAME_SIZE`].
const INITIAL_CAPACITY: usize = 4096;

fn is_special(byte: u8) -> bool {
    matches!(byte, START_BYTE | END_BYTE | ESCAPE_BYTE)
}

fn checksum(body: &[u8]) -> u8 {
    let sum = body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    0u8.wrapping_sub(sum)
}

// Callers keep payloads within MAX_PAYLOAD_SIZE.
fn build(seq_byte: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u16;
    let mut body = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    body.push(seq_byte);
    body.push(0);
    body.extend_from_slice(&len.to_le_bytes());
    body.extend_from_slice(payload);
    body[1] = checksum(&body);

    let mut out = Vec::with_capacity(body.len() + body.len() / 4 + 2);
    out.push(START_BYTE);
    for &b in &body {
        if is_special(b) {
            out.push(ESCAPE_BYTE);
            out.push(b.wrapping_add(ESCAPE_BYTE));
        } else {
            out.push(b);
        }
    }
    out.push(END_BYTE);
    out
}

/// Frame a data payload.
///
/// Fails with [`ProtocolError::PayloadTooLarge`] if the payload does not fit
/// the length field.
pub fn frame(payload: &[u8], sequence: u8, ack_required: bool) -> ProtocolResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    let kind = if ack_required {
        PACKET_TYPE_ACK_REQUESTED
    } else {
        PACKET_TYPE_NORMAL
    };
    Ok(build((sequence & PACKET_SEQ_MASK) | kind, payload))
}

/// Build an ACK frame echoing `sequence`.
pub fn ack_frame(sequence: u8) -> Vec<u8> {
    build((sequence & PACKET_SEQ_MASK) | PACKET_TYPE_ACK, &[])
}

/// Build a NAK frame echoing `sequence`.
pub fn nak_frame(sequence: u8) -> Vec<u8> {
    build((sequence & PACKET_SEQ_MASK) | PACKET_TYPE_NAK, &[])
}

/// A frame taken apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deframed {
    /// Sequence number (low nibble).
    pub sequence: u8,
    /// Sender wants an ACK.
    pub ack_required: bool,
    /// Frame is an ACK.
    pub is_ack: bool,
    /// Frame is a NAK.
    pub is_nak: bool,
    /// Payload of a data frame; `None` for ACK/NAK.
    pub payload: Option<Vec<u8>>,
    /// Whether the body summed to zero.
    pub checksum_ok: bool,
}

/// Take a frame apart.
///
/// Accepts the frame with or without its start/end bytes. A checksum
/// mismatch is logged and reported in [`Deframed::checksum_ok`]; the payload
/// is still returned.
pub fn deframe(raw: &[u8]) -> ProtocolResult<Deframed> {
    let raw = raw.strip_prefix(&[START_BYTE]).unwrap_or(raw);
    let raw = raw.strip_suffix(&[END_BYTE]).unwrap_or(raw);

    let mut body = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&b) = bytes.next() {
        if b == ESCAPE_BYTE {
            match bytes.next() {
                Some(&next) => body.push(next.wrapping_sub(ESCAPE_BYTE)),
                None => break,
            }
        } else {
            body.push(b);
        }
    }

    if body.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::MalformedFrame {
            expected: FRAME_HEADER_SIZE,
            actual: body.len(),
        });
    }

    let checksum_ok = body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) == 0;
    if !checksum_ok {
        log::warn!("frame: checksum mismatch on {} byte body", body.len());
    }

    let seq_byte = body[0];
    let kind = seq_byte & PACKET_TYPE_MASK;
    let is_ack = kind == PACKET_TYPE_ACK;
    let is_nak = kind == PACKET_TYPE_NAK;

    let declared = u16::from_le_bytes([body[2], body[3]]) as usize;
    let available = body.len() - FRAME_HEADER_SIZE;
    if declared != available {
        log::warn!(
            "frame: length field says {} bytes, body carries {}",
            declared,
            available
        );
    }
    let payload = if is_ack || is_nak {
        None
    } else {
        Some(body[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + declared.min(available)].to_vec())
    };

    Ok(Deframed {
        sequence: seq_byte & PACKET_SEQ_MASK,
        ack_required: kind == PACKET_TYPE_ACK_REQUESTED,
        is_ack,
        is_nak,
        payload,
        checksum_ok,
    })
}

/// Extracts complete frames from an arbitrarily chunked byte stream.
///
/// Bytes before a start byte are discarded. A start byte inside a partial
/// frame restarts the frame, so a truncated frame never swallows the next
/// one.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: BytesMut,
}

impl FrameAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        FrameAccumulator {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Add received data to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete frame, start and end bytes included.
    ///
    /// Returns `None` if more data is needed.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            // Scan for the start byte, discarding any preceding garbage
            match self.buffer.iter().position(|&b| b == START_BYTE) {
                Some(start) => self.buffer.advance(start),
                None => {
                    self.buffer.clear();
                    return None;
                }
            }

            let rest = &self.buffer[1..];
            let restart = rest.iter().position(|&b| b == START_BYTE);
            let end = rest.iter().position(|&b| b == END_BYTE);

            match (end, restart) {
                (Some(end), Some(restart)) if restart < end => {
                    log::debug!("frame: dropping {} byte truncated frame", restart + 1);
                    self.buffer.advance(restart + 1);
                }
                (Some(end), _) => {
                    return Some(self.buffer.split_to(end + 2).to_vec());
                }
                (None, Some(restart)) => {
                    log::debug!("frame: dropping {} byte truncated frame", restart + 1);
                    self.buffer.advance(restart + 1);
                }
                (None, None) => {
                    if self.buffer.len() > MAX_FRAME_SIZE {
                        log::warn!("frame: discarding {} bytes without end marker", self.buffer.len());
                        self.buffer.clear();
                    }
                    return None;
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
