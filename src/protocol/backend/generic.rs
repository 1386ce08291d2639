//! OK, ERR and EOF packets.

use zerocopy::byteorder::little_endian::U16 as U16LE;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result, ServerError};
use crate::protocol::codec::{read_bytes, read_lenenc_int, read_u8, read_u16};

use super::header;

/// OK packet.
///
/// Also used for the final packet of a result set when `CLIENT_DEPRECATE_EOF`
/// is negotiated (in which case the header byte is `0xFE`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// Rows affected by the statement
    pub affected_rows: u64,
    /// `LAST_INSERT_ID()` after the statement
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Warning count
    pub warnings: u16,
    /// Human readable info (e.g. `Rows matched: 1  Changed: 1  Warnings: 0`)
    pub info: String,
}

impl OkPacket {
    /// Parse an OK packet payload (`0x00` or `0xFE` header).
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (head, data) = read_u8(payload)?;
        if head != header::OK && head != header::EOF {
            return Err(Error::Protocol(format!(
                "expected OK packet, got header 0x{head:02X}"
            )));
        }
        let (affected_rows, data) = read_lenenc_int(data)?;
        let (last_insert_id, data) = read_lenenc_int(data)?;
        let (status_flags, data) = read_u16(data)?;
        let (warnings, data) = read_u16(data)?;
        let info = String::from_utf8_lossy(data).into_owned();
        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }
}

/// ERR packet.
#[derive(Debug, Clone)]
pub struct ErrPacket(pub ServerError);

impl ErrPacket {
    /// Parse an ERR packet payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (head, data) = read_u8(payload)?;
        if head != header::ERR {
            return Err(Error::Protocol(format!(
                "expected ERR packet, got header 0x{head:02X}"
            )));
        }
        let (code, data) = read_u16(data)?;
        let (sql_state, message) = match data.split_first() {
            Some((b'#', rest)) if rest.len() >= 5 => {
                let (state, msg) = read_bytes(rest, 5)?;
                (String::from_utf8_lossy(state).into_owned(), msg)
            }
            _ => ("HY000".to_string(), data),
        };
        Ok(Self(ServerError {
            code,
            sql_state,
            message: String::from_utf8_lossy(message).into_owned(),
        }))
    }

    /// Convert into the crate error.
    pub fn into_error(self) -> Error {
        Error::Server(self.0)
    }
}

/// EOF packet (pre-`CLIENT_DEPRECATE_EOF` column/row terminator).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct EofPacket {
    /// Always `0xFE`
    pub header: u8,
    /// Warning count
    pub warnings: U16LE,
    /// Server status flags
    pub status_flags: U16LE,
}

impl EofPacket {
    /// Parse an EOF packet payload.
    pub fn parse(payload: &[u8]) -> Result<&Self> {
        let (eof, _) = Self::ref_from_prefix(payload)?;
        if eof.header != header::EOF {
            return Err(Error::Protocol(format!(
                "expected EOF packet, got header 0x{:02X}",
                eof.header
            )));
        }
        Ok(eof)
    }
}

/// Returns true for a `0xFE` terminator packet.
///
/// A text row may legitimately begin with `0xFE` (a length-encoded integer
/// prefix), but such rows are always at least 9 bytes long.
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&header::EOF) && payload.len() < 9
}
