//! Low-level wire primitives: little-endian scalars, compact lengths,
//! strings, packed timestamps and the stream preamble.

use chrono::{DateTime, Datelike, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, WireError};

/// Stream magic emitted ahead of every payload.
pub const MAGIC: &[u8; 4] = b"wire";

/// Current payload format version.
pub const FORMAT_VERSION: i16 = 1;

/// Stable id for a type or property name: a wrapping `h = 31*h + byte`
/// fold over the UTF-8 bytes.
pub fn wire_hash(name: &str) -> i32 {
    let mut hash: i32 = 0;
    for &byte in name.as_bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as i32);
    }
    hash
}

/// Growable output buffer with the wire's primitive encodings.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    #[inline]
    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    #[inline]
    pub fn write_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn write_char(&mut self, v: char) {
        self.write_u32(v as u32);
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Compact length encoding: one byte below 127, otherwise a marker byte
    /// followed by the narrowest integer that fits.
    pub fn write_size(&mut self, size: usize) {
        if size < 127 {
            self.write_u8(size as u8);
        } else if size < 256 {
            self.write_u8(127);
            self.write_u8(size as u8);
        } else if size < 32_768 {
            self.write_u8(128);
            self.write_i16(size as i16);
        } else {
            self.write_u8(192);
            self.write_i32(size as i32);
        }
    }

    /// Length-prefixed UTF-8. `None` and the empty string both collapse to a
    /// zero length.
    pub fn write_str(&mut self, s: Option<&str>) {
        match s {
            Some(s) if !s.is_empty() => {
                self.write_size(s.len());
                self.write_bytes(s.as_bytes());
            }
            _ => self.write_size(0),
        }
    }

    pub fn write_datetime(&mut self, dt: &NaiveDateTime) {
        self.write_i64(pack_datetime(dt));
    }

    pub fn write_biased_datetime(&mut self, dt: &DateTime<FixedOffset>) {
        self.write_i64(pack_datetime(&dt.naive_local()));
        self.write_i16(pack_bias(dt.offset().local_minus_utc()));
    }

    pub fn write_guid(&mut self, id: &Uuid) {
        self.write_bytes(id.as_bytes());
    }

    /// Emit the stream preamble (magic plus format version).
    pub fn write_preamble(&mut self) {
        self.write_bytes(MAGIC);
        self.write_i16(FORMAT_VERSION);
    }
}

/// Cursor over an encoded payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::Decode(format!(
                "payload truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    #[inline]
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    #[inline]
    pub fn read_i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    #[inline]
    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[inline]
    pub fn read_i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes(b.try_into().unwrap()))
    }

    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    #[inline]
    pub fn read_f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    #[inline]
    pub fn read_f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_char(&mut self) -> Result<char> {
        let raw = self.read_u32()?;
        char::from_u32(raw)
            .ok_or_else(|| WireError::Decode(format!("invalid char scalar 0x{raw:x}")))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Inverse of [`WireWriter::write_size`].
    pub fn read_size(&mut self) -> Result<usize> {
        let marker = self.read_u8()?;
        let size = match marker {
            0..=126 => marker as usize,
            127 => self.read_u8()? as usize,
            128 => {
                let v = self.read_i16()?;
                if v < 0 {
                    return Err(WireError::Decode(format!("negative size {v}")));
                }
                v as usize
            }
            192 => {
                let v = self.read_i32()?;
                if v < 0 {
                    return Err(WireError::Decode(format!("negative size {v}")));
                }
                v as usize
            }
            other => {
                return Err(WireError::Decode(format!("unknown size marker {other}")));
            }
        };
        Ok(size)
    }

    /// Inverse of [`WireWriter::write_str`]; a zero length reads as `None`.
    pub fn read_str(&mut self) -> Result<Option<String>> {
        let size = self.read_size()?;
        if size == 0 {
            return Ok(None);
        }
        let bytes = self.take(size)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|e| WireError::Decode(format!("invalid UTF-8 in string: {e}")))?;
        Ok(Some(s.to_owned()))
    }

    pub fn read_datetime(&mut self) -> Result<NaiveDateTime> {
        unpack_datetime(self.read_i64()?)
    }

    pub fn read_biased_datetime(&mut self) -> Result<DateTime<FixedOffset>> {
        let packed = self.read_i64()?;
        let bias = self.read_i16()?;
        unpack_biased_datetime(packed, bias)
    }

    pub fn read_guid(&mut self) -> Result<Uuid> {
        let bytes = self.take(16)?;
        Ok(Uuid::from_bytes(bytes.try_into().unwrap()))
    }

    /// Consume the preamble if it is present at the cursor. Returns whether a
    /// matching preamble was found; on a mismatch the cursor does not move.
    pub fn check_preamble(&mut self) -> bool {
        if self.remaining() < MAGIC.len() + 2 {
            return false;
        }
        let start = self.pos;
        if &self.buf[start..start + 4] != MAGIC {
            return false;
        }
        let version = i16::from_le_bytes([self.buf[start + 4], self.buf[start + 5]]);
        if version != FORMAT_VERSION {
            return false;
        }
        self.pos += 6;
        true
    }
}

/// Fields packed into an i64, most significant first: year (16 bits), month,
/// day, hour, minute, second, millisecond. The low 11 bits are reserved.
pub fn pack_datetime(dt: &NaiveDateTime) -> i64 {
    (dt.year() as i64) << 47
        | (dt.month() as i64) << 43
        | (dt.day() as i64) << 38
        | (dt.hour() as i64) << 33
        | (dt.minute() as i64) << 27
        | (dt.second() as i64) << 21
        | ((dt.and_utc().timestamp_subsec_millis() as i64) << 11)
}

pub fn unpack_datetime(packed: i64) -> Result<NaiveDateTime> {
    let year = (packed >> 47) & 0xffff;
    let month = (packed >> 43) & 0xf;
    let day = (packed >> 38) & 0x1f;
    let hour = (packed >> 33) & 0x1f;
    let minute = (packed >> 27) & 0x3f;
    let second = (packed >> 21) & 0x3f;
    let millis = (packed >> 11) & 0x3ff;

    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|d| d.and_hms_milli_opt(hour as u32, minute as u32, second as u32, millis as u32))
        .ok_or_else(|| WireError::Decode(format!("invalid packed timestamp 0x{packed:x}")))
}

/// Largest UTC offset the packed form can carry: the hour field is four
/// bits, so anything past 15:59 would collide with the sign bit.
const MAX_BIAS_MINUTES: u32 = 15 * 60 + 59;

/// UTC offset as sign bit 0x400, absolute hours shifted left six, minutes in
/// the low six bits. Offsets beyond the representable range are clamped.
pub fn pack_bias(offset_seconds: i32) -> i16 {
    let total_minutes = offset_seconds / 60;
    let sign = if total_minutes < 0 { 0x400 } else { 0 };
    let mut abs = total_minutes.unsigned_abs();
    if abs > MAX_BIAS_MINUTES {
        warn!(offset_seconds, "UTC offset exceeds packed range, clamped to 15:59");
        abs = MAX_BIAS_MINUTES;
    }
    (sign | ((abs / 60) << 6) | (abs % 60)) as i16
}

/// Reassemble a timestamp-with-offset from its packed halves.
pub fn unpack_biased_datetime(packed: i64, bias: i16) -> Result<DateTime<FixedOffset>> {
    let local = unpack_datetime(packed)?;
    let offset_seconds = unpack_bias(bias);
    let offset = FixedOffset::east_opt(offset_seconds)
        .ok_or_else(|| WireError::Decode(format!("invalid UTC offset {offset_seconds}s")))?;
    match offset.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt),
        _ => Err(WireError::Decode("ambiguous biased timestamp".into())),
    }
}

pub fn unpack_bias(packed: i16) -> i32 {
    let hours = ((packed >> 6) & 0xf) as i32;
    let minutes = (packed & 0x3f) as i32;
    let total = (hours * 60 + minutes) * 60;
    if packed & 0x400 != 0 {
        -total
    } else {
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_size_encoding_widths() {
        let cases = [
            (0usize, 1usize),
            (126, 1),
            (127, 2),
            (255, 2),
            (256, 3),
            (32_767, 3),
            (32_768, 5),
            (5_000_000, 5),
        ];
        for (size, expected_bytes) in cases {
            let mut writer = WireWriter::new();
            writer.write_size(size);
            let bytes = writer.into_bytes();
            assert_eq!(bytes.len(), expected_bytes, "size {size}");

            let mut reader = WireReader::new(&bytes);
            assert_eq!(reader.read_size().unwrap(), size);
        }
    }

    #[test]
    fn test_string_roundtrip() {
        let mut writer = WireWriter::new();
        writer.write_str(Some("héllo"));
        writer.write_str(None);
        writer.write_str(Some(""));

        let bytes = writer.into_bytes();
        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_str().unwrap().as_deref(), Some("héllo"));
        assert_eq!(reader.read_str().unwrap(), None);
        assert_eq!(reader.read_str().unwrap(), None);
    }

    #[test]
    fn test_datetime_packing() {
        let dt = NaiveDate::from_ymd_opt(2024, 11, 30)
            .unwrap()
            .and_hms_milli_opt(23, 59, 58, 999)
            .unwrap();
        assert_eq!(unpack_datetime(pack_datetime(&dt)).unwrap(), dt);
    }

    #[test]
    fn test_bias_packing() {
        for offset in [0, 3600, -3600, 5 * 3600 + 30 * 60, -(9 * 3600 + 45 * 60)] {
            assert_eq!(unpack_bias(pack_bias(offset)), offset, "offset {offset}");
        }
    }

    #[test]
    fn test_bias_out_of_range_clamps_without_sign_corruption() {
        // The hour field is four bits; 16 h would bleed into the sign bit.
        let max = (15 * 3600 + 59 * 60) as i32;
        assert_eq!(unpack_bias(pack_bias(16 * 3600)), max);
        assert_eq!(unpack_bias(pack_bias(-23 * 3600)), -max);
        // The widest offset chrono itself allows.
        assert_eq!(unpack_bias(pack_bias(23 * 3600 + 59 * 60 + 59)), max);
    }

    #[test]
    fn test_biased_datetime_roundtrip() {
        let offset = FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap();
        let dt = NaiveDate::from_ymd_opt(2025, 1, 2)
            .unwrap()
            .and_hms_milli_opt(3, 4, 5, 6)
            .unwrap()
            .and_local_timezone(offset)
            .single()
            .unwrap();

        let mut writer = WireWriter::new();
        writer.write_biased_datetime(&dt);
        let bytes = writer.into_bytes();
        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_biased_datetime().unwrap(), dt);
    }

    #[test]
    fn test_preamble_rewinds_on_mismatch() {
        let mut writer = WireWriter::new();
        writer.write_preamble();
        writer.write_u8(0xAB);
        let bytes = writer.into_bytes();

        let mut reader = WireReader::new(&bytes);
        assert!(reader.check_preamble());
        assert_eq!(reader.read_u8().unwrap(), 0xAB);

        let junk = [b'x', b'y', b'z', b'w', 1, 0, 7];
        let mut reader = WireReader::new(&junk);
        assert!(!reader.check_preamble());
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_wire_hash_stable() {
        assert_eq!(wire_hash(""), 0);
        assert_eq!(wire_hash("a"), 97);
        assert_eq!(wire_hash("ab"), 31 * 97 + 98);
        // Distinct names map to distinct ids in practice.
        assert_ne!(wire_hash("Ping"), wire_hash("Pong"));
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut reader = WireReader::new(&[1, 2]);
        assert!(reader.read_i32().is_err());
    }
}
