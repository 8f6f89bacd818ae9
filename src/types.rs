//! AMQP 1.0 primitive type codec.
//!
//! Only the slice of the type system this link actually speaks is
//! implemented: the fixed-width scalars, strings/symbols/binaries, lists,
//! maps, symbol arrays (SASL mechanism offers), and described values.
//! Everything else is skippable but not representable.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::coding::{BufExt, BytesExt, UnexpectedEnd};

// AMQP 1.0 format codes
pub(crate) const FC_DESCRIBED: u8 = 0x00;
pub(crate) const FC_NULL: u8 = 0x40;
pub(crate) const FC_TRUE: u8 = 0x41;
pub(crate) const FC_FALSE: u8 = 0x42;
pub(crate) const FC_UINT0: u8 = 0x43;
pub(crate) const FC_ULONG0: u8 = 0x44;
pub(crate) const FC_LIST0: u8 = 0x45;
pub(crate) const FC_UBYTE: u8 = 0x50;
pub(crate) const FC_BYTE: u8 = 0x51;
pub(crate) const FC_SMALL_UINT: u8 = 0x52;
pub(crate) const FC_SMALL_ULONG: u8 = 0x53;
pub(crate) const FC_SMALL_INT: u8 = 0x54;
pub(crate) const FC_SMALL_LONG: u8 = 0x55;
pub(crate) const FC_BOOL: u8 = 0x56;
pub(crate) const FC_USHORT: u8 = 0x60;
pub(crate) const FC_UINT: u8 = 0x70;
pub(crate) const FC_INT: u8 = 0x71;
pub(crate) const FC_ULONG: u8 = 0x80;
pub(crate) const FC_LONG: u8 = 0x81;
pub(crate) const FC_VBIN8: u8 = 0xa0;
pub(crate) const FC_STR8: u8 = 0xa1;
pub(crate) const FC_SYM8: u8 = 0xa3;
pub(crate) const FC_VBIN32: u8 = 0xb0;
pub(crate) const FC_STR32: u8 = 0xb1;
pub(crate) const FC_SYM32: u8 = 0xb3;
pub(crate) const FC_LIST8: u8 = 0xc0;
pub(crate) const FC_MAP8: u8 = 0xc1;
pub(crate) const FC_LIST32: u8 = 0xd0;
pub(crate) const FC_MAP32: u8 = 0xd1;
pub(crate) const FC_ARRAY8: u8 = 0xe0;
pub(crate) const FC_ARRAY32: u8 = 0xf0;

const MAX_SKIP_DEPTH: u8 = 16;

#[derive(Error, Debug, Clone, PartialEq)]
pub(crate) enum ParseError {
    #[error(transparent)]
    UnexpectedEnd(#[from] UnexpectedEnd),
    #[error("malformed wire data: {0}")]
    Malformed(&'static str),
    #[error("missing mandatory field: {0}")]
    MissingField(&'static str),
    #[error("unknown descriptor 0x{0:02x}")]
    UnknownDescriptor(u64),
}

/// A value permitted in an application-properties map.
///
/// The fabric only exchanges simple scalars here; richer AMQP types in an
/// inbound map fail the decode and the delivery is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Int(i32),
    Long(i64),
    String(String),
    Symbol(String),
    Binary(Bytes),
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl PropertyValue {
    pub(crate) fn encode(&self, out: &mut BytesMut) {
        match *self {
            PropertyValue::Null => put_null(out),
            PropertyValue::Bool(v) => put_bool(out, v),
            PropertyValue::Ubyte(v) => {
                out.put_u8(FC_UBYTE);
                out.put_u8(v);
            }
            PropertyValue::Ushort(v) => {
                out.put_u8(FC_USHORT);
                out.put_u16(v);
            }
            PropertyValue::Uint(v) => put_uint(out, v),
            PropertyValue::Ulong(v) => put_ulong(out, v),
            PropertyValue::Int(v) => put_int(out, v),
            PropertyValue::Long(v) => put_long(out, v),
            PropertyValue::String(ref v) => put_string(out, v),
            PropertyValue::Symbol(ref v) => put_symbol(out, v),
            PropertyValue::Binary(ref v) => put_binary(out, v),
        }
    }

    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self, ParseError> {
        let code = buf.get_checked_u8()?;
        Ok(match code {
            FC_NULL => PropertyValue::Null,
            FC_TRUE => PropertyValue::Bool(true),
            FC_FALSE => PropertyValue::Bool(false),
            FC_BOOL => PropertyValue::Bool(buf.get_checked_u8()? != 0),
            FC_UBYTE => PropertyValue::Ubyte(buf.get_checked_u8()?),
            FC_USHORT => PropertyValue::Ushort(buf.get_checked_u16()?),
            FC_UINT0 => PropertyValue::Uint(0),
            FC_SMALL_UINT => PropertyValue::Uint(buf.get_checked_u8()?.into()),
            FC_UINT => PropertyValue::Uint(buf.get_checked_u32()?),
            FC_ULONG0 => PropertyValue::Ulong(0),
            FC_SMALL_ULONG => PropertyValue::Ulong(buf.get_checked_u8()?.into()),
            FC_ULONG => PropertyValue::Ulong(buf.get_checked_u64()?),
            FC_BYTE => PropertyValue::Int(buf.get_checked_i8()?.into()),
            FC_SMALL_INT => PropertyValue::Int(buf.get_checked_i8()?.into()),
            FC_INT => PropertyValue::Int(buf.get_checked_i32()?),
            FC_SMALL_LONG => PropertyValue::Long(buf.get_checked_i8()?.into()),
            FC_LONG => PropertyValue::Long(buf.get_checked_i64()?),
            FC_STR8 | FC_STR32 => PropertyValue::String(read_utf8(buf, code == FC_STR32)?),
            FC_SYM8 | FC_SYM32 => PropertyValue::Symbol(read_utf8(buf, code == FC_SYM32)?),
            FC_VBIN8 => {
                let len = buf.get_checked_u8()? as usize;
                PropertyValue::Binary(buf.take_prefix(len)?)
            }
            FC_VBIN32 => {
                let len = buf.get_checked_u32()? as usize;
                PropertyValue::Binary(buf.take_prefix(len)?)
            }
            _ => return Err(ParseError::Malformed("unsupported property value type")),
        })
    }
}

// Encoders. Scalars use the most compact constructor that fits.

pub(crate) fn put_null(out: &mut BytesMut) {
    out.put_u8(FC_NULL);
}

pub(crate) fn put_bool(out: &mut BytesMut, v: bool) {
    out.put_u8(if v { FC_TRUE } else { FC_FALSE });
}

pub(crate) fn put_ubyte(out: &mut BytesMut, v: u8) {
    out.put_u8(FC_UBYTE);
    out.put_u8(v);
}

pub(crate) fn put_ushort(out: &mut BytesMut, v: u16) {
    out.put_u8(FC_USHORT);
    out.put_u16(v);
}

pub(crate) fn put_uint(out: &mut BytesMut, v: u32) {
    if v == 0 {
        out.put_u8(FC_UINT0);
    } else if v <= u8::MAX as u32 {
        out.put_u8(FC_SMALL_UINT);
        out.put_u8(v as u8);
    } else {
        out.put_u8(FC_UINT);
        out.put_u32(v);
    }
}

pub(crate) fn put_ulong(out: &mut BytesMut, v: u64) {
    if v == 0 {
        out.put_u8(FC_ULONG0);
    } else if v <= u8::MAX as u64 {
        out.put_u8(FC_SMALL_ULONG);
        out.put_u8(v as u8);
    } else {
        out.put_u8(FC_ULONG);
        out.put_u64(v);
    }
}

pub(crate) fn put_int(out: &mut BytesMut, v: i32) {
    if (i8::MIN as i32..=i8::MAX as i32).contains(&v) {
        out.put_u8(FC_SMALL_INT);
        out.put_i8(v as i8);
    } else {
        out.put_u8(FC_INT);
        out.put_i32(v);
    }
}

pub(crate) fn put_long(out: &mut BytesMut, v: i64) {
    if (i8::MIN as i64..=i8::MAX as i64).contains(&v) {
        out.put_u8(FC_SMALL_LONG);
        out.put_i8(v as i8);
    } else {
        out.put_u8(FC_LONG);
        out.put_i64(v);
    }
}

pub(crate) fn put_string(out: &mut BytesMut, v: &str) {
    if v.len() <= u8::MAX as usize {
        out.put_u8(FC_STR8);
        out.put_u8(v.len() as u8);
    } else {
        out.put_u8(FC_STR32);
        out.put_u32(v.len() as u32);
    }
    out.put_slice(v.as_bytes());
}

pub(crate) fn put_symbol(out: &mut BytesMut, v: &str) {
    if v.len() <= u8::MAX as usize {
        out.put_u8(FC_SYM8);
        out.put_u8(v.len() as u8);
    } else {
        out.put_u8(FC_SYM32);
        out.put_u32(v.len() as u32);
    }
    out.put_slice(v.as_bytes());
}

pub(crate) fn put_binary(out: &mut BytesMut, v: &[u8]) {
    if v.len() <= u8::MAX as usize {
        out.put_u8(FC_VBIN8);
        out.put_u8(v.len() as u8);
    } else {
        out.put_u8(FC_VBIN32);
        out.put_u32(v.len() as u32);
    }
    out.put_slice(v);
}

/// Write a described-type descriptor (`0x00` + ulong code)
pub(crate) fn put_descriptor(out: &mut BytesMut, code: u64) {
    out.put_u8(FC_DESCRIBED);
    put_ulong(out, code);
}

/// Wrap pre-encoded list elements in the smallest list constructor
pub(crate) fn put_list(out: &mut BytesMut, count: usize, elements: &[u8]) {
    if count == 0 && elements.is_empty() {
        out.put_u8(FC_LIST0);
    } else if elements.len() <= 254 && count <= u8::MAX as usize {
        out.put_u8(FC_LIST8);
        out.put_u8((1 + elements.len()) as u8);
        out.put_u8(count as u8);
        out.put_slice(elements);
    } else {
        out.put_u8(FC_LIST32);
        out.put_u32(4 + elements.len() as u32);
        out.put_u32(count as u32);
        out.put_slice(elements);
    }
}

/// Wrap pre-encoded map elements (keys and values interleaved; `count` is
/// the element count, i.e. twice the number of entries)
pub(crate) fn put_map(out: &mut BytesMut, count: usize, elements: &[u8]) {
    if elements.len() <= 254 && count <= u8::MAX as usize {
        out.put_u8(FC_MAP8);
        out.put_u8((1 + elements.len()) as u8);
        out.put_u8(count as u8);
        out.put_slice(elements);
    } else {
        out.put_u8(FC_MAP32);
        out.put_u32(4 + elements.len() as u32);
        out.put_u32(count as u32);
        out.put_slice(elements);
    }
}

// Decoders. Each returns `None` where the wire held an AMQP null, so
// callers can apply field defaults.

pub(crate) fn get_descriptor(buf: &mut Bytes) -> Result<u64, ParseError> {
    if buf.get_checked_u8()? != FC_DESCRIBED {
        return Err(ParseError::Malformed("expected described type"));
    }
    match get_ulong(buf)? {
        Some(code) => Ok(code),
        None => Err(ParseError::Malformed("null descriptor")),
    }
}

pub(crate) fn get_bool(buf: &mut Bytes) -> Result<Option<bool>, ParseError> {
    Ok(match buf.get_checked_u8()? {
        FC_NULL => None,
        FC_TRUE => Some(true),
        FC_FALSE => Some(false),
        FC_BOOL => Some(buf.get_checked_u8()? != 0),
        _ => return Err(ParseError::Malformed("expected boolean")),
    })
}

pub(crate) fn get_ubyte(buf: &mut Bytes) -> Result<Option<u8>, ParseError> {
    Ok(match buf.get_checked_u8()? {
        FC_NULL => None,
        FC_UBYTE => Some(buf.get_checked_u8()?),
        _ => return Err(ParseError::Malformed("expected ubyte")),
    })
}

pub(crate) fn get_ushort(buf: &mut Bytes) -> Result<Option<u16>, ParseError> {
    Ok(match buf.get_checked_u8()? {
        FC_NULL => None,
        FC_USHORT => Some(buf.get_checked_u16()?),
        _ => return Err(ParseError::Malformed("expected ushort")),
    })
}

pub(crate) fn get_uint(buf: &mut Bytes) -> Result<Option<u32>, ParseError> {
    Ok(match buf.get_checked_u8()? {
        FC_NULL => None,
        FC_UINT0 => Some(0),
        FC_SMALL_UINT => Some(buf.get_checked_u8()?.into()),
        FC_UINT => Some(buf.get_checked_u32()?),
        _ => return Err(ParseError::Malformed("expected uint")),
    })
}

pub(crate) fn get_ulong(buf: &mut Bytes) -> Result<Option<u64>, ParseError> {
    Ok(match buf.get_checked_u8()? {
        FC_NULL => None,
        FC_ULONG0 => Some(0),
        FC_SMALL_ULONG => Some(buf.get_checked_u8()?.into()),
        FC_ULONG => Some(buf.get_checked_u64()?),
        _ => return Err(ParseError::Malformed("expected ulong")),
    })
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<Option<String>, ParseError> {
    Ok(match buf.get_checked_u8()? {
        FC_NULL => None,
        c @ (FC_STR8 | FC_STR32) => Some(read_utf8(buf, c == FC_STR32)?),
        _ => return Err(ParseError::Malformed("expected string")),
    })
}

pub(crate) fn get_symbol(buf: &mut Bytes) -> Result<Option<String>, ParseError> {
    Ok(match buf.get_checked_u8()? {
        FC_NULL => None,
        c @ (FC_SYM8 | FC_SYM32) => Some(read_utf8(buf, c == FC_SYM32)?),
        _ => return Err(ParseError::Malformed("expected symbol")),
    })
}

pub(crate) fn get_binary(buf: &mut Bytes) -> Result<Option<Bytes>, ParseError> {
    Ok(match buf.get_checked_u8()? {
        FC_NULL => None,
        FC_VBIN8 => {
            let len = buf.get_checked_u8()? as usize;
            Some(buf.take_prefix(len)?)
        }
        FC_VBIN32 => {
            let len = buf.get_checked_u32()? as usize;
            Some(buf.take_prefix(len)?)
        }
        _ => return Err(ParseError::Malformed("expected binary")),
    })
}

/// Read a list header, returning its element count and body region
pub(crate) fn get_list(buf: &mut Bytes) -> Result<Option<(u32, Bytes)>, ParseError> {
    Ok(match buf.get_checked_u8()? {
        FC_NULL => None,
        FC_LIST0 => Some((0, Bytes::new())),
        FC_LIST8 => {
            let size = buf.get_checked_u8()? as usize;
            if size < 1 {
                return Err(ParseError::Malformed("list8 size"));
            }
            let count = buf.get_checked_u8()?.into();
            Some((count, buf.take_prefix(size - 1)?))
        }
        FC_LIST32 => {
            let size = buf.get_checked_u32()? as usize;
            if size < 4 {
                return Err(ParseError::Malformed("list32 size"));
            }
            let count = buf.get_checked_u32()?;
            Some((count, buf.take_prefix(size - 4)?))
        }
        _ => return Err(ParseError::Malformed("expected list")),
    })
}

/// Read a map header, returning its element count and body region
pub(crate) fn get_map(buf: &mut Bytes) -> Result<Option<(u32, Bytes)>, ParseError> {
    Ok(match buf.get_checked_u8()? {
        FC_NULL => None,
        FC_MAP8 => {
            let size = buf.get_checked_u8()? as usize;
            if size < 1 {
                return Err(ParseError::Malformed("map8 size"));
            }
            let count = buf.get_checked_u8()?.into();
            Some((count, buf.take_prefix(size - 1)?))
        }
        FC_MAP32 => {
            let size = buf.get_checked_u32()? as usize;
            if size < 4 {
                return Err(ParseError::Malformed("map32 size"));
            }
            let count = buf.get_checked_u32()?;
            Some((count, buf.take_prefix(size - 4)?))
        }
        _ => return Err(ParseError::Malformed("expected map")),
    })
}

/// Read a symbol, or an array of symbols, as SASL mechanism offers use
pub(crate) fn get_symbol_multiple(buf: &mut Bytes) -> Result<Vec<String>, ParseError> {
    match buf.get_checked_u8()? {
        FC_NULL => Ok(Vec::new()),
        c @ (FC_SYM8 | FC_SYM32) => Ok(vec![read_utf8(buf, c == FC_SYM32)?]),
        c @ (FC_ARRAY8 | FC_ARRAY32) => {
            let (size, count) = if c == FC_ARRAY8 {
                (buf.get_checked_u8()? as usize, buf.get_checked_u8()? as u32)
            } else {
                (buf.get_checked_u32()? as usize, buf.get_checked_u32()?)
            };
            let header = if c == FC_ARRAY8 { 1 } else { 4 };
            if size < header {
                return Err(ParseError::Malformed("array size"));
            }
            let mut region = buf.take_prefix(size - header)?;
            let ctor = region.get_checked_u8()?;
            if ctor != FC_SYM8 && ctor != FC_SYM32 {
                return Err(ParseError::Malformed("expected symbol array"));
            }
            let mut out = Vec::with_capacity(count as usize);
            for _ in 0..count {
                out.push(read_utf8(&mut region, ctor == FC_SYM32)?);
            }
            Ok(out)
        }
        _ => Err(ParseError::Malformed("expected symbol or symbol array")),
    }
}

/// Skip one complete value of any type
pub(crate) fn skip_value(buf: &mut Bytes) -> Result<(), ParseError> {
    skip_value_inner(buf, 0)
}

fn skip_value_inner(buf: &mut Bytes, depth: u8) -> Result<(), ParseError> {
    if depth > MAX_SKIP_DEPTH {
        return Err(ParseError::Malformed("value nesting too deep"));
    }
    let code = buf.get_checked_u8()?;
    if code == FC_DESCRIBED {
        skip_value_inner(buf, depth + 1)?;
        return skip_value_inner(buf, depth + 1);
    }
    let skip = match code >> 4 {
        0x4 => 0,
        0x5 => 1,
        0x6 => 2,
        0x7 => 4,
        0x8 => 8,
        0x9 => 16,
        0xa | 0xc | 0xe => buf.get_checked_u8()? as usize,
        0xb | 0xd | 0xf => buf.get_checked_u32()? as usize,
        _ => return Err(ParseError::Malformed("unknown format code")),
    };
    buf.skip(skip)?;
    Ok(())
}

fn read_utf8(buf: &mut Bytes, wide: bool) -> Result<String, ParseError> {
    let len = if wide {
        buf.get_checked_u32()? as usize
    } else {
        buf.get_checked_u8()? as usize
    };
    let raw = buf.take_prefix(len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ParseError::Malformed("invalid utf-8"))
}
