//! Result set packets: column definitions and rows.

use std::mem::size_of;

use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{NULL_MARKER, read_bytes, read_lenenc_bytes, read_lenenc_int, read_u8};
use crate::protocol::types::ColumnType;
use crate::row::Column;
use crate::value::{Value, decode_binary, decode_text};

/// Fixed-size tail of a column definition (12 bytes).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct ColumnDefinitionTail {
    /// Character set id
    pub charset: U16LE,
    /// Maximum column length
    pub length: U32LE,
    /// Column type code
    pub column_type: u8,
    /// Column flags
    pub flags: U16LE,
    /// Decimal digits
    pub decimals: u8,
    reserved: [u8; 2],
}

fn lenenc_string(data: &[u8]) -> Result<(String, &[u8])> {
    let (bytes, rest) = read_lenenc_bytes(data)?;
    Ok((String::from_utf8_lossy(bytes).into_owned(), rest))
}

/// Parse a column definition packet (protocol 4.1).
pub fn parse_column_definition(payload: &[u8]) -> Result<Column> {
    let (_catalog, data) = read_lenenc_bytes(payload)?;
    let (schema, data) = lenenc_string(data)?;
    let (table, data) = lenenc_string(data)?;
    let (org_table, data) = lenenc_string(data)?;
    let (name, data) = lenenc_string(data)?;
    let (org_name, data) = lenenc_string(data)?;
    let (fixed_len, data) = read_lenenc_int(data)?;
    const TAIL_SIZE: usize = size_of::<ColumnDefinitionTail>();
    if fixed_len as usize != TAIL_SIZE {
        return Err(Error::Protocol(format!(
            "column definition: unexpected fixed length {fixed_len}"
        )));
    }
    let (tail, _) = read_bytes(data, TAIL_SIZE)?;
    let tail = ColumnDefinitionTail::ref_from_bytes(tail)?;
    Ok(Column {
        schema,
        table,
        org_table,
        name,
        org_name,
        charset: tail.charset.get(),
        length: tail.length.get(),
        column_type: ColumnType::from_u8(tail.column_type),
        flags: tail.flags.get(),
        decimals: tail.decimals,
    })
}

/// Parse a text-protocol row (COM_QUERY result).
pub fn parse_text_row(payload: &[u8], columns: &[Column]) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(columns.len());
    let mut data = payload;
    for column in columns {
        if data.first() == Some(&NULL_MARKER) {
            values.push(Value::Null);
            data = &data[1..];
            continue;
        }
        let (raw, rest) = read_lenenc_bytes(data)?;
        values.push(decode_text(
            column.column_type,
            column.is_unsigned(),
            column.is_binary(),
            raw,
        )?);
        data = rest;
    }
    if !data.is_empty() {
        return Err(Error::Protocol(format!(
            "text row: {} trailing bytes",
            data.len()
        )));
    }
    Ok(values)
}

/// Parse a binary-protocol row (COM_STMT_EXECUTE result).
///
/// Layout: `0x00` header, NULL bitmap with a 2-bit offset, then the non-NULL
/// values in column order.
pub fn parse_binary_row(payload: &[u8], columns: &[Column]) -> Result<Vec<Value>> {
    let (head, data) = read_u8(payload)?;
    if head != 0x00 {
        return Err(Error::Protocol(format!(
            "binary row: unexpected header 0x{head:02X}"
        )));
    }
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    let (bitmap, mut data) = read_bytes(data, bitmap_len)?;
    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let (value, rest) = decode_binary(
            column.column_type,
            column.is_unsigned(),
            column.is_binary(),
            data,
        )?;
        values.push(value);
        data = rest;
    }
    Ok(values)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::codec::{write_lenenc_bytes, write_u8, write_u16, write_u32};

    pub(crate) fn encode_column(name: &str, column_type: ColumnType, flags: u16) -> Vec<u8> {
        let mut out = Vec::new();
        write_lenenc_bytes(&mut out, b"def");
        write_lenenc_bytes(&mut out, b"shop");
        write_lenenc_bytes(&mut out, b"orders");
        write_lenenc_bytes(&mut out, b"orders");
        write_lenenc_bytes(&mut out, name.as_bytes());
        write_lenenc_bytes(&mut out, name.as_bytes());
        write_u8(&mut out, 0x0C);
        write_u16(&mut out, 45);
        write_u32(&mut out, 11);
        write_u8(&mut out, column_type as u8);
        write_u16(&mut out, flags);
        write_u8(&mut out, 0);
        out.extend_from_slice(&[0, 0]);
        out
    }

    #[test]
    fn test_column_definition() {
        let col = parse_column_definition(&encode_column("qty", ColumnType::Long, 0x20)).unwrap();
        assert_eq!(col.name, "qty");
        assert_eq!(col.table, "orders");
        assert_eq!(col.schema, "shop");
        assert_eq!(col.column_type, ColumnType::Long);
        assert!(col.is_unsigned());
        assert_eq!(col.length, 11);
    }

    #[test]
    fn test_text_row_with_null() {
        let cols = vec![
            parse_column_definition(&encode_column("a", ColumnType::LongLong, 0)).unwrap(),
            parse_column_definition(&encode_column("b", ColumnType::VarString, 0)).unwrap(),
        ];
        let payload = [NULL_MARKER, 2, b'h', b'i'];
        let values = parse_text_row(&payload, &cols).unwrap();
        assert_eq!(values, vec![Value::Null, Value::Text("hi".into())]);
        assert!(parse_text_row(&[1, b'5', 0, 9], &cols).is_err());
    }

    #[test]
    fn test_binary_row() {
        let cols = vec![
            parse_column_definition(&encode_column("a", ColumnType::LongLong, 0)).unwrap(),
            parse_column_definition(&encode_column("b", ColumnType::VarString, 0)).unwrap(),
            parse_column_definition(&encode_column("c", ColumnType::Tiny, 0x20)).unwrap(),
        ];
        // column b is NULL: bit 1 + 2 = 3
        let mut payload = vec![0x00, 0b0000_1000];
        payload.extend_from_slice(&(-5i64).to_le_bytes());
        payload.push(200);
        let values = parse_binary_row(&payload, &cols).unwrap();
        assert_eq!(values, vec![Value::Int(-5), Value::Null, Value::UInt(200)]);
    }
}
