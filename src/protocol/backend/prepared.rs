//! COM_STMT_PREPARE response.

use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};

/// First packet of a successful COM_STMT_PREPARE response (12 bytes).
///
/// Followed by `num_params` parameter definitions and `num_columns` column
/// definitions, each group terminated by EOF unless `CLIENT_DEPRECATE_EOF`.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct StmtPrepareOk {
    status: u8,
    statement_id: U32LE,
    num_columns: U16LE,
    num_params: U16LE,
    reserved: u8,
    warnings: U16LE,
}

impl StmtPrepareOk {
    /// Parse the prepare-OK payload.
    pub fn parse(payload: &[u8]) -> Result<&Self> {
        let (ok, _) = Self::ref_from_prefix(payload)?;
        if ok.status != 0x00 {
            return Err(Error::Protocol(format!(
                "expected COM_STMT_PREPARE_OK, got header 0x{:02X}",
                ok.status
            )));
        }
        Ok(ok)
    }

    /// Server-assigned statement id.
    pub fn statement_id(&self) -> u32 {
        self.statement_id.get()
    }

    /// Number of result columns.
    pub fn num_columns(&self) -> u16 {
        self.num_columns.get()
    }

    /// Number of `?` parameters.
    pub fn num_params(&self) -> u16 {
        self.num_params.get()
    }

    /// Warning count.
    pub fn warnings(&self) -> u16 {
        self.warnings.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let payload = [0x00, 0x07, 0, 0, 0, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00];
        let ok = StmtPrepareOk::parse(&payload).unwrap();
        assert_eq!(ok.statement_id(), 7);
        assert_eq!(ok.num_columns(), 2);
        assert_eq!(ok.num_params(), 3);
        assert_eq!(ok.warnings(), 0);
    }

    #[test]
    fn test_reject_short_or_err() {
        assert!(StmtPrepareOk::parse(&[0x00, 1, 0]).is_err());
        let mut payload = [0u8; 12];
        payload[0] = 0xFF;
        assert!(StmtPrepareOk::parse(&payload).is_err());
    }
}
