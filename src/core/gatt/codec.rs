//! Binary codec contract for characteristic payloads.
//!
//! A value type describes how it is laid out in a characteristic's byte
//! payload. Decoding never panics: a short or malformed buffer yields `None`,
//! which the callers turn into [`Error::Decoding`].

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{Error, Result};

/// Cursor over a received payload. All multi-byte integers are little endian.
#[derive(Debug)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.position.checked_add(len)?;
        let slice = self.bytes.get(self.position..end)?;
        self.position = end;
        Some(slice)
    }

    pub fn read_remaining(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.position..];
        self.position = self.bytes.len();
        slice
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.read_bytes(N)?.try_into().ok()
    }
}

/// Growable buffer a value encodes itself into.
#[derive(Debug, Default)]
pub struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// How a typed value maps onto characteristic bytes.
pub trait ByteCodec: Sized {
    fn decode(reader: &mut ByteReader<'_>) -> Option<Self>;

    fn encode(&self, writer: &mut ByteWriter);

    /// Decodes a complete payload, mapping failure to a typed error.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::decode(&mut ByteReader::new(bytes)).ok_or(Error::Decoding {
            type_name: std::any::type_name::<Self>(),
            len: bytes.len(),
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.encode(&mut writer);
        writer.into_bytes()
    }
}

/// Bound required of every value stored in a characteristic context.
pub trait CharacteristicValue: ByteCodec + Clone + std::fmt::Debug + Send + Sync + 'static {}

impl<T> CharacteristicValue for T where T: ByteCodec + Clone + std::fmt::Debug + Send + Sync + 'static {}

macro_rules! int_codec {
    ($($ty:ty => $read:ident, $write:ident, $via:ty;)*) => {
        $(
            impl ByteCodec for $ty {
                fn decode(reader: &mut ByteReader<'_>) -> Option<Self> {
                    reader.$read().map(|v| v as $ty)
                }

                fn encode(&self, writer: &mut ByteWriter) {
                    writer.$write(*self as $via);
                }
            }
        )*
    };
}

int_codec! {
    u8 => read_u8, write_u8, u8;
    i8 => read_u8, write_u8, u8;
    u16 => read_u16, write_u16, u16;
    i16 => read_u16, write_u16, u16;
    u32 => read_u32, write_u32, u32;
    i32 => read_u32, write_u32, u32;
    u64 => read_u64, write_u64, u64;
}

impl ByteCodec for bool {
    fn decode(reader: &mut ByteReader<'_>) -> Option<Self> {
        match reader.read_u8()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_u8(u8::from(*self));
    }
}

/// UTF-8 text spanning the rest of the payload.
impl ByteCodec for String {
    fn decode(reader: &mut ByteReader<'_>) -> Option<Self> {
        std::str::from_utf8(reader.read_remaining())
            .ok()
            .map(|s| s.trim_end_matches('\0').to_string())
    }

    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_bytes(self.as_bytes());
    }
}

/// Raw payload, never fails.
impl ByteCodec for Vec<u8> {
    fn decode(reader: &mut ByteReader<'_>) -> Option<Self> {
        Some(reader.read_remaining().to_vec())
    }

    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_bytes(self);
    }
}

const DATE_TIME_YEARS: std::ops::RangeInclusive<u16> = 1582..=9999;
const YEAR_UNKNOWN: u16 = 0;

/// Bluetooth "Date Time": year (u16), month, day, hours, minutes, seconds.
///
/// Only years 1582 to 9999 are representable. Others are encoded as the
/// "year not known" value 0, and a payload carrying an unknown year, month
/// or day does not decode.
impl ByteCodec for NaiveDateTime {
    fn decode(reader: &mut ByteReader<'_>) -> Option<Self> {
        let year = reader.read_u16().filter(|year| DATE_TIME_YEARS.contains(year))?;
        let month = reader.read_u8()?;
        let day = reader.read_u8()?;
        let hours = reader.read_u8()?;
        let minutes = reader.read_u8()?;
        let seconds = reader.read_u8()?;
        NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))?
            .and_hms_opt(u32::from(hours), u32::from(minutes), u32::from(seconds))
    }

    fn encode(&self, writer: &mut ByteWriter) {
        let year = u16::try_from(self.year())
            .ok()
            .filter(|year| DATE_TIME_YEARS.contains(year))
            .unwrap_or(YEAR_UNKNOWN);
        writer.write_u16(year);
        writer.write_u8(self.month() as u8);
        writer.write_u8(self.day() as u8);
        writer.write_u8(self.hour() as u8);
        writer.write_u8(self.minute() as u8);
        writer.write_u8(self.second() as u8);
    }
}
