//! Teltonika wire-format codecs.
//!
//! Three framings share the device socket:
//!
//! - the one-shot handshake: `<u16 length><IMEI as ASCII digits>`
//! - Codec 8 / 8 Extended AVL batches: `<4B zero preamble><u32 data length>
//!   <data><u32 CRC-16>`
//! - Codec 12 command frames in the same envelope, type 0x05 (request,
//!   server to device) and 0x06 (response, device to server)
//!
//! Everything here is pure: the session owns the accumulating buffer and
//! feeds byte slices in; decoders report how many bytes a complete frame
//! consumed and never touch the socket. Multi-byte integers are big-endian
//! throughout.

pub mod avl;
pub mod codec12;
pub mod crc;

pub use avl::{AvlBatch, AvlCodec, AvlRecord, GpsFix, IoElement, IoValue};
pub use codec12::Codec12Response;

/// Codec id byte for Codec 8.
pub const CODEC_8: u8 = 0x08;
/// Codec id byte for Codec 8 Extended.
pub const CODEC_8_EXT: u8 = 0x8E;
/// Codec id byte for Codec 12.
pub const CODEC_12: u8 = 0x0C;
/// Codec 12 type byte: server-to-device command.
pub const C12_TYPE_REQUEST: u8 = 0x05;
/// Codec 12 type byte: device-to-server response.
pub const C12_TYPE_RESPONSE: u8 = 0x06;

/// Longest plausible handshake identity; real IMEIs are 15 digits but some
/// firmware pads with a checksum digit.
const MAX_HANDSHAKE_LEN: usize = 24;

/// Unrecoverable parse failure on a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("declared frame length {0} exceeds the configured limit")]
    Oversize(usize),
}

/// A decoder outcome: either a complete value plus the bytes it consumed, or
/// a request for more input. Hard failures use the `Err` channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Decode<T> {
    Complete { value: T, consumed: usize },
    Incomplete,
}

pub type DecodeResult<T> = Result<Decode<T>, FrameError>;

/// What the head of the buffer looks like. Classification never consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Handshake,
    AvlBatch,
    Codec12Response,
    NeedMoreBytes,
    Malformed,
}

/// Classify the head of `buf` without consuming bytes.
///
/// Handshakes are recognized by a non-zero u16 length prefix followed by that
/// many ASCII digits; data frames by the four-byte zero preamble, with the
/// codec id at offset 8 and (for Codec 12) the type byte at offset 10
/// selecting between an AVL batch and a command response. A declared data
/// length above `max_frame_bytes` is malformed rather than a reason to
/// buffer without bound.
pub fn classify(buf: &[u8], max_frame_bytes: usize) -> FrameKind {
    if buf.is_empty() {
        return FrameKind::NeedMoreBytes;
    }
    if buf[0] != 0 {
        // Neither a preamble nor a sane handshake length prefix.
        return FrameKind::Malformed;
    }
    if buf.len() < 2 {
        return FrameKind::NeedMoreBytes;
    }
    if buf[1] != 0 {
        // Handshake candidate: u16 length (high byte zero) + ASCII digits.
        let n = buf[1] as usize;
        if n > MAX_HANDSHAKE_LEN {
            return FrameKind::Malformed;
        }
        let have = buf.len().min(2 + n);
        if !buf[2..have].iter().all(|b| b.is_ascii_digit()) {
            return FrameKind::Malformed;
        }
        if buf.len() < 2 + n {
            return FrameKind::NeedMoreBytes;
        }
        return FrameKind::Handshake;
    }
    // Zero so far: data-frame preamble territory.
    if buf.len() < 4 {
        return FrameKind::NeedMoreBytes;
    }
    if buf[2] != 0 || buf[3] != 0 {
        return FrameKind::Malformed;
    }
    if buf.len() < 12 {
        return FrameKind::NeedMoreBytes;
    }
    let declared = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if declared.saturating_add(12) > max_frame_bytes {
        return FrameKind::Malformed;
    }
    match buf[8] {
        CODEC_12 if buf[10] == C12_TYPE_RESPONSE => FrameKind::Codec12Response,
        CODEC_8 | CODEC_8_EXT => FrameKind::AvlBatch,
        _ => FrameKind::Malformed,
    }
}

/// Decode the handshake frame: u16 big-endian length, then exactly that many
/// ASCII decimal digits (15 for an IMEI). Returns the identity string.
pub fn decode_handshake(buf: &[u8]) -> DecodeResult<String> {
    if buf.len() < 2 {
        return Ok(Decode::Incomplete);
    }
    let n = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if n == 0 || n > MAX_HANDSHAKE_LEN {
        return Err(FrameError::Malformed(format!(
            "handshake length {n} out of range"
        )));
    }
    if buf.len() < 2 + n {
        return Ok(Decode::Incomplete);
    }
    let digits = &buf[2..2 + n];
    if !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::Malformed(
            "handshake identity contains non-digit bytes".into(),
        ));
    }
    // All-digit bytes are valid UTF-8 by construction.
    let imei = String::from_utf8(digits.to_vec())
        .map_err(|_| FrameError::Malformed("handshake identity is not UTF-8".into()))?;
    Ok(Decode::Complete {
        value: imei,
        consumed: 2 + n,
    })
}

/// Shared outer-envelope walk for AVL and Codec 12 data frames: verifies the
/// preamble, bounds the declared length, and hands back the data region plus
/// the declared CRC once the full frame is buffered.
pub(crate) fn split_envelope<'a>(
    buf: &'a [u8],
    max_frame_bytes: usize,
) -> DecodeResult<(&'a [u8], u16)> {
    if buf.len() < 8 {
        return Ok(Decode::Incomplete);
    }
    if buf[..4] != [0, 0, 0, 0] {
        return Err(FrameError::Malformed("missing zero preamble".into()));
    }
    let declared = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let total = declared.saturating_add(12);
    if total > max_frame_bytes {
        return Err(FrameError::Oversize(declared));
    }
    if buf.len() < total {
        return Ok(Decode::Incomplete);
    }
    let data = &buf[8..8 + declared];
    let declared_crc = u32::from_be_bytes([
        buf[8 + declared],
        buf[9 + declared],
        buf[10 + declared],
        buf[11 + declared],
    ]);
    // Upper two bytes are zero on the wire; only the low half is checksum.
    Ok(Decode::Complete {
        value: (data, (declared_crc & 0xFFFF) as u16),
        consumed: total,
    })
}
