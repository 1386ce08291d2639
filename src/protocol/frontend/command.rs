//! Command phase packets.

use crate::protocol::codec::{write_bytes, write_u8, write_u32};
use crate::protocol::types::Command;
use crate::value::Value;

/// COM_QUERY. The text may contain several `;`-separated statements.
pub fn write_query(buf: &mut Vec<u8>, sql: &str) {
    write_u8(buf, Command::Query as u8);
    write_bytes(buf, sql.as_bytes());
}

/// COM_INIT_DB.
pub fn write_init_db(buf: &mut Vec<u8>, database: &str) {
    write_u8(buf, Command::InitDb as u8);
    write_bytes(buf, database.as_bytes());
}

/// COM_PING.
pub fn write_ping(buf: &mut Vec<u8>) {
    write_u8(buf, Command::Ping as u8);
}

/// COM_QUIT. The server closes the socket without replying.
pub fn write_quit(buf: &mut Vec<u8>) {
    write_u8(buf, Command::Quit as u8);
}

/// COM_REFRESH with [`refresh`](crate::protocol::types::refresh) flags.
pub fn write_refresh(buf: &mut Vec<u8>, flags: u8) {
    write_u8(buf, Command::Refresh as u8);
    write_u8(buf, flags);
}

/// COM_STMT_PREPARE.
pub fn write_stmt_prepare(buf: &mut Vec<u8>, sql: &str) {
    write_u8(buf, Command::StmtPrepare as u8);
    write_bytes(buf, sql.as_bytes());
}

/// COM_STMT_CLOSE. The server sends no response.
pub fn write_stmt_close(buf: &mut Vec<u8>, statement_id: u32) {
    write_u8(buf, Command::StmtClose as u8);
    write_u32(buf, statement_id);
}

/// COM_STMT_RESET.
pub fn write_stmt_reset(buf: &mut Vec<u8>, statement_id: u32) {
    write_u8(buf, Command::StmtReset as u8);
    write_u32(buf, statement_id);
}

/// COM_STMT_EXECUTE with one value per parameter slot.
///
/// NULL values are flagged in the bitmap and have no body. Types are always
/// sent (`new_params_bound_flag = 1`).
pub fn write_stmt_execute(buf: &mut Vec<u8>, statement_id: u32, params: &[Value]) {
    write_u8(buf, Command::StmtExecute as u8);
    write_u32(buf, statement_id);
    write_u8(buf, 0x00); // CURSOR_TYPE_NO_CURSOR
    write_u32(buf, 1); // iteration count

    if params.is_empty() {
        return;
    }

    let bitmap_start = buf.len();
    buf.resize(bitmap_start + params.len().div_ceil(8), 0);
    for (i, value) in params.iter().enumerate() {
        if value.is_null() {
            buf[bitmap_start + i / 8] |= 1 << (i % 8);
        }
    }

    write_u8(buf, 1);
    for value in params {
        write_u8(buf, value.column_type() as u8);
        write_u8(buf, value.type_flags());
    }
    for value in params {
        value.write_binary(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::ColumnType;

    #[test]
    fn test_query() {
        let mut buf = Vec::new();
        write_query(&mut buf, "SELECT 1");
        assert_eq!(buf[0], 0x03);
        assert_eq!(&buf[1..], b"SELECT 1");
    }

    #[test]
    fn test_execute_without_params() {
        let mut buf = Vec::new();
        write_stmt_execute(&mut buf, 9, &[]);
        assert_eq!(buf, [0x17, 9, 0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn test_execute_with_null_and_unsigned() {
        let mut buf = Vec::new();
        let params = [Value::UInt(5), Value::Null, Value::from("ab")];
        write_stmt_execute(&mut buf, 1, &params);

        let body = &buf[10..];
        assert_eq!(body[0], 0b010, "null bitmap");
        assert_eq!(body[1], 1, "new params bound");
        assert_eq!(&body[2..4], &[ColumnType::LongLong as u8, 0x80]);
        assert_eq!(&body[4..6], &[ColumnType::Null as u8, 0x00]);
        assert_eq!(&body[6..8], &[ColumnType::VarString as u8, 0x00]);
        let mut expected_values = 5u64.to_le_bytes().to_vec();
        expected_values.extend_from_slice(&[2, b'a', b'b']);
        assert_eq!(&body[8..], expected_values.as_slice());
    }

    #[test]
    fn test_close_and_reset() {
        let mut buf = Vec::new();
        write_stmt_close(&mut buf, 0x0102_0304);
        assert_eq!(buf, [0x19, 4, 3, 2, 1]);
        buf.clear();
        write_stmt_reset(&mut buf, 2);
        assert_eq!(buf, [0x1A, 2, 0, 0, 0]);
    }
}
