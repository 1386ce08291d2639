//! MySQL wire protocol encoding and decoding primitives.
//!
//! MySQL uses little-endian for all fixed-width integers and a
//! "length-encoded" variable-width integer for lengths and counters.

use crate::error::{Error, Result};
use zerocopy::FromBytes;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE, U64 as U64LE};

/// Marker for a NULL column value in text rows.
pub const NULL_MARKER: u8 = 0xFB;

/// Read 1-byte unsigned integer.
#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((first, rest)) => Ok((*first, rest)),
        None => Err(Error::Protocol("read_u8: empty buffer".into())),
    }
}

/// Read 2-byte little-endian unsigned integer.
#[inline]
pub fn read_u16(data: &[u8]) -> Result<(u16, &[u8])> {
    let (bytes, rest) = read_bytes(data, 2)?;
    let value = U16LE::ref_from_bytes(bytes)
        .map_err(|e| Error::Protocol(format!("read_u16: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read 3-byte little-endian unsigned integer.
#[inline]
pub fn read_u24(data: &[u8]) -> Result<(u32, &[u8])> {
    let (bytes, rest) = read_bytes(data, 3)?;
    let value = u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
    Ok((value, rest))
}

/// Read 4-byte little-endian unsigned integer.
#[inline]
pub fn read_u32(data: &[u8]) -> Result<(u32, &[u8])> {
    let (bytes, rest) = read_bytes(data, 4)?;
    let value = U32LE::ref_from_bytes(bytes)
        .map_err(|e| Error::Protocol(format!("read_u32: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read 8-byte little-endian unsigned integer.
#[inline]
pub fn read_u64(data: &[u8]) -> Result<(u64, &[u8])> {
    let (bytes, rest) = read_bytes(data, 8)?;
    let value = U64LE::ref_from_bytes(bytes)
        .map_err(|e| Error::Protocol(format!("read_u64: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read fixed-length bytes.
#[inline]
pub fn read_bytes(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < len {
        return Err(Error::Protocol(format!(
            "read_bytes: buffer too short: {} < {}",
            data.len(),
            len
        )));
    }
    Ok(data.split_at(len))
}

/// Read a length-encoded integer.
///
/// `0xFB` (NULL) and `0xFF` (ERR) are not valid integer prefixes here.
#[inline]
pub fn read_lenenc_int(data: &[u8]) -> Result<(u64, &[u8])> {
    let (first, rest) = read_u8(data)?;
    match first {
        0x00..=0xFA => Ok((u64::from(first), rest)),
        0xFC => read_u16(rest).map(|(v, r)| (u64::from(v), r)),
        0xFD => read_u24(rest).map(|(v, r)| (u64::from(v), r)),
        0xFE => read_u64(rest),
        _ => Err(Error::Protocol(format!(
            "read_lenenc_int: invalid prefix 0x{first:02X}"
        ))),
    }
}

/// Read length-encoded bytes.
#[inline]
pub fn read_lenenc_bytes(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, rest) = read_lenenc_int(data)?;
    let len = usize::try_from(len)
        .map_err(|e| Error::Protocol(format!("read_lenenc_bytes: length overflow: {e}")))?;
    read_bytes(rest, len)
}

/// Read a length-encoded string as &str.
#[inline]
pub fn read_lenenc_str(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_lenenc_bytes(data)?;
    let s = simdutf8::basic::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("read_lenenc_str: invalid UTF-8: {e}")))?;
    Ok((s, rest))
}

/// Read null-terminated string.
/// Returns the string bytes (without the null terminator) and remaining data.
#[inline]
pub fn read_cstring(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match memchr::memchr(0, data) {
        Some(pos) => Ok((&data[..pos], &data[pos + 1..])),
        None => Err(Error::Protocol(
            "read_cstring: no null terminator found".into(),
        )),
    }
}

/// Read null-terminated string as &str.
#[inline]
pub fn read_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let (bytes, rest) = read_cstring(data)?;
    let s = simdutf8::basic::from_utf8(bytes)
        .map_err(|e| Error::Protocol(format!("read_cstr: invalid UTF-8: {e}")))?;
    Ok((s, rest))
}

/// Write 1-byte unsigned integer.
#[inline]
pub fn write_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

/// Write 2-byte little-endian unsigned integer.
#[inline]
pub fn write_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 3-byte little-endian unsigned integer.
#[inline]
pub fn write_u24(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes()[..3]);
}

/// Write 4-byte little-endian unsigned integer.
#[inline]
pub fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 8-byte little-endian unsigned integer.
#[inline]
pub fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write raw bytes.
#[inline]
pub fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
}

/// Write a length-encoded integer.
#[inline]
pub fn write_lenenc_int(out: &mut Vec<u8>, value: u64) {
    if value < 251 {
        out.push(value as u8);
    } else if value < 0x1_0000 {
        out.push(0xFC);
        write_u16(out, value as u16);
    } else if value < 0x100_0000 {
        out.push(0xFD);
        write_u24(out, value as u32);
    } else {
        out.push(0xFE);
        write_u64(out, value);
    }
}

/// Write length-encoded bytes.
#[inline]
pub fn write_lenenc_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_lenenc_int(out, data.len() as u64);
    out.extend_from_slice(data);
}

/// Write null-terminated string.
#[inline]
pub fn write_cstr(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}
