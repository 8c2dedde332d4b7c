//! Codec 12 command framing.
//!
//! Requests (server → device) and responses (device → server) share the AVL
//! envelope. The data region is:
//!
//! ```text
//! 0x0C | quantity1=1 | type | u32 payload size | payload | quantity2=1
//! ```
//!
//! with type 0x05 for requests and 0x06 for responses. The protocol carries
//! no correlation id; pairing a response with its request is the
//! dispatcher's job.

use super::crc::crc16;
use super::{
    split_envelope, Decode, DecodeResult, FrameError, C12_TYPE_REQUEST, C12_TYPE_RESPONSE,
    CODEC_12,
};

/// A device reply. `crc_ok` mirrors the AVL tolerance policy: a bad checksum
/// is logged by the caller but the text is still delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec12Response {
    pub text: String,
    pub crc_ok: bool,
}

/// Frame a command for the wire. The text rides as raw ASCII; devices treat
/// the payload as an opaque GPRS command string.
pub fn encode_request(text: &str) -> Vec<u8> {
    let payload = text.as_bytes();
    let mut data = Vec::with_capacity(8 + payload.len());
    data.push(CODEC_12);
    data.push(1); // quantity1
    data.push(C12_TYPE_REQUEST);
    data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    data.extend_from_slice(payload);
    data.push(1); // quantity2

    let mut frame = Vec::with_capacity(12 + data.len());
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    frame.extend_from_slice(&(crc16(&data) as u32).to_be_bytes());
    frame
}

/// Decode a device response from the head of `buf`.
pub fn decode_response(buf: &[u8], max_frame_bytes: usize) -> DecodeResult<Codec12Response> {
    let (data, declared_crc, consumed) = match split_envelope(buf, max_frame_bytes)? {
        Decode::Complete { value, consumed } => (value.0, value.1, consumed),
        Decode::Incomplete => return Ok(Decode::Incomplete),
    };
    let crc_ok = crc16(data) == declared_crc;

    if data.len() < 8 {
        return Err(FrameError::Malformed(
            "codec 12 data region shorter than its fixed fields".into(),
        ));
    }
    if data[0] != CODEC_12 {
        return Err(FrameError::Malformed(format!(
            "unexpected codec id 0x{:02X} in command frame",
            data[0]
        )));
    }
    if data[1] != 1 {
        return Err(FrameError::Malformed(format!(
            "codec 12 quantity1 must be 1, got {}",
            data[1]
        )));
    }
    if data[2] != C12_TYPE_RESPONSE {
        return Err(FrameError::Malformed(format!(
            "unexpected codec 12 type 0x{:02X}",
            data[2]
        )));
    }
    let size = u32::from_be_bytes([data[3], data[4], data[5], data[6]]) as usize;
    if data.len() != 8 + size {
        return Err(FrameError::Malformed(format!(
            "codec 12 payload size {size} does not match data region of {} bytes",
            data.len()
        )));
    }
    if data[7 + size] != 1 {
        return Err(FrameError::Malformed(format!(
            "codec 12 quantity2 must be 1, got {}",
            data[7 + size]
        )));
    }
    // Responses are nominally ASCII; tolerate stray high bytes rather than
    // dropping an otherwise intact reply.
    let text = String::from_utf8_lossy(&data[7..7 + size]).into_owned();

    Ok(Decode::Complete {
        value: Codec12Response { text, crc_ok },
        consumed,
    })
}
