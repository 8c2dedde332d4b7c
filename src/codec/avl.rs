//! Codec 8 and Codec 8 Extended AVL batch decoding.
//!
//! Data region layout (after the shared envelope):
//!
//! ```text
//! codec id (1) | quantity1 (1) | records... | quantity2 (1)
//! ```
//!
//! Each record carries a millisecond UTC timestamp, a priority class, the GPS
//! fix, the triggering event id, and the I/O elements grouped by value width
//! (1/2/4/8 bytes; 8E adds a variable-length group). Codec 8E widens the
//! event id, I/O counts, and I/O keys from one byte to two.
//!
//! Quantity1 must equal Quantity2. A CRC mismatch is reported via the
//! `crc_ok` flag but does not fail the decode; field units mis-compute the
//! checksum often enough that dropping their telemetry is worse than logging.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use super::crc::crc16;
use super::{split_envelope, Decode, DecodeResult, FrameError, CODEC_8, CODEC_8_EXT};

/// Which AVL framing the batch used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AvlCodec {
    Codec8,
    Codec8Ext,
}

/// One I/O channel reading. Widths follow the group the element arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum IoValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
}

/// An I/O element: channel id plus reading. Devices may repeat an id within
/// one record, so elements stay a list rather than a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IoElement {
    pub id: u16,
    pub value: IoValue,
}

/// The positional fix portion of a record. Latitude and longitude arrive as
/// signed 32-bit integers scaled by 1e7. A fix with zero visible satellites
/// is flagged invalid; the wire carries no explicit validity bit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: u16,
    pub angle: u16,
    pub satellites: u8,
    pub speed: u16,
    pub valid: bool,
}

/// One telemetry sample, ready for the event sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvlRecord {
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub fix: GpsFix,
    pub event_id: u16,
    pub io: Vec<IoElement>,
}

/// A decoded batch. `quantity` is the record count the device declared (and
/// the count the session acknowledges on the wire).
#[derive(Debug, Clone, PartialEq)]
pub struct AvlBatch {
    pub codec: AvlCodec,
    pub records: Vec<AvlRecord>,
    pub quantity: u8,
    pub crc_ok: bool,
}

/// Bounds-checked big-endian reader over the data region.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.pos + n > self.buf.len() {
            return Err(FrameError::Malformed(format!(
                "record data truncated at offset {}",
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FrameError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, FrameError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Decode an AVL batch from the head of `buf`. On success the caller must
/// drop `consumed` bytes; whatever follows is the prefix of the next frame.
pub fn decode_avl(buf: &[u8], max_frame_bytes: usize) -> DecodeResult<AvlBatch> {
    let (data, declared_crc) = match split_envelope(buf, max_frame_bytes)? {
        Decode::Complete { value, consumed: _ } => value,
        Decode::Incomplete => return Ok(Decode::Incomplete),
    };
    let consumed = data.len() + 12;
    let crc_ok = crc16(data) == declared_crc;

    let mut r = Reader::new(data);
    let codec = match r.u8()? {
        CODEC_8 => AvlCodec::Codec8,
        CODEC_8_EXT => AvlCodec::Codec8Ext,
        other => {
            return Err(FrameError::Malformed(format!(
                "unexpected codec id 0x{other:02X} in AVL frame"
            )))
        }
    };
    let quantity1 = r.u8()?;
    let mut records = Vec::with_capacity(quantity1 as usize);
    for _ in 0..quantity1 {
        records.push(decode_record(&mut r, codec)?);
    }
    let quantity2 = r.u8()?;
    if quantity1 != quantity2 {
        return Err(FrameError::Malformed(format!(
            "record count mismatch: leading {quantity1}, trailing {quantity2}"
        )));
    }
    if r.remaining() != 0 {
        return Err(FrameError::Malformed(format!(
            "{} stray bytes after trailing record count",
            r.remaining()
        )));
    }

    Ok(Decode::Complete {
        value: AvlBatch {
            codec,
            records,
            quantity: quantity1,
            crc_ok,
        },
        consumed,
    })
}

fn decode_record(r: &mut Reader<'_>, codec: AvlCodec) -> Result<AvlRecord, FrameError> {
    let millis = r.u64()?;
    let timestamp = Utc
        .timestamp_millis_opt(millis as i64)
        .single()
        .ok_or_else(|| FrameError::Malformed(format!("timestamp {millis} out of range")))?;
    let priority = r.u8()?;

    let latitude = r.i32()? as f64 / 1e7;
    let longitude = r.i32()? as f64 / 1e7;
    let altitude = r.u16()?;
    let angle = r.u16()?;
    let satellites = r.u8()?;
    let speed = r.u16()?;
    let fix = GpsFix {
        latitude,
        longitude,
        altitude,
        angle,
        satellites,
        speed,
        valid: satellites != 0,
    };

    let wide = codec == AvlCodec::Codec8Ext;
    let event_id = if wide { r.u16()? } else { r.u8()? as u16 };
    let total_io = if wide { r.u16()? } else { r.u8()? as u16 };

    let mut io = Vec::with_capacity(total_io as usize);
    for width in [1usize, 2, 4, 8] {
        let count = if wide { r.u16()? } else { r.u8()? as u16 };
        for _ in 0..count {
            let id = if wide { r.u16()? } else { r.u8()? as u16 };
            let value = match width {
                1 => IoValue::U8(r.u8()?),
                2 => IoValue::U16(r.u16()?),
                4 => IoValue::U32(r.u32()?),
                _ => IoValue::U64(r.u64()?),
            };
            io.push(IoElement { id, value });
        }
    }
    if wide {
        // Codec 8E trailing group: variable-length values.
        let count = r.u16()?;
        for _ in 0..count {
            let id = r.u16()?;
            let len = r.u16()? as usize;
            let value = IoValue::Bytes(r.take(len)?.to_vec());
            io.push(IoElement { id, value });
        }
    }
    if io.len() != total_io as usize {
        return Err(FrameError::Malformed(format!(
            "I/O element count mismatch: declared {total_io}, found {}",
            io.len()
        )));
    }

    Ok(AvlRecord {
        timestamp,
        priority,
        fix,
        event_id,
        io,
    })
}
