//! Values exchanged with the server: statement parameters and column data.

use crate::error::{Error, Result};
use crate::protocol::codec::{
    read_bytes, read_lenenc_bytes, read_u8, read_u16, read_u32, read_u64, write_lenenc_bytes,
    write_u8, write_u16, write_u32, write_u64,
};
use crate::protocol::types::ColumnType;

/// Calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

/// Date with time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct DateTime {
    pub date: Date,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub micros: u32,
}

/// Signed duration as used by the MySQL `TIME` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Time {
    pub negative: bool,
    pub days: u32,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub micros: u32,
}

/// A parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(Date),
    DateTime(DateTime),
    Time(Time),
}

impl Value {
    /// Returns true if this is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Binary protocol type tag for this value.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Int(_) | Value::UInt(_) => ColumnType::LongLong,
            Value::Float(_) => ColumnType::Float,
            Value::Double(_) => ColumnType::Double,
            Value::Text(_) => ColumnType::VarString,
            Value::Bytes(_) => ColumnType::Blob,
            Value::Date(_) => ColumnType::Date,
            Value::DateTime(_) => ColumnType::DateTime,
            Value::Time(_) => ColumnType::Time,
        }
    }

    /// Second byte of the parameter type pair: `0x80` marks unsigned.
    pub fn type_flags(&self) -> u8 {
        if matches!(self, Value::UInt(_)) { 0x80 } else { 0x00 }
    }

    /// Encode the value body for COM_STMT_EXECUTE. NULL writes nothing;
    /// it is carried by the null bitmap.
    pub fn write_binary(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => {}
            Value::Int(v) => write_u64(out, *v as u64),
            Value::UInt(v) => write_u64(out, *v),
            Value::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Value::Text(s) => write_lenenc_bytes(out, s.as_bytes()),
            Value::Bytes(b) => write_lenenc_bytes(out, b),
            Value::Date(d) => {
                if *d == Date::default() {
                    write_u8(out, 0);
                } else {
                    write_u8(out, 4);
                    write_date(out, d);
                }
            }
            Value::DateTime(dt) => {
                if dt.micros != 0 {
                    write_u8(out, 11);
                    write_date(out, &dt.date);
                    out.extend_from_slice(&[dt.hour, dt.minute, dt.second]);
                    write_u32(out, dt.micros);
                } else if dt.hour != 0 || dt.minute != 0 || dt.second != 0 {
                    write_u8(out, 7);
                    write_date(out, &dt.date);
                    out.extend_from_slice(&[dt.hour, dt.minute, dt.second]);
                } else if dt.date != Date::default() {
                    write_u8(out, 4);
                    write_date(out, &dt.date);
                } else {
                    write_u8(out, 0);
                }
            }
            Value::Time(t) => {
                if *t == Time::default() {
                    write_u8(out, 0);
                    return;
                }
                write_u8(out, if t.micros != 0 { 12 } else { 8 });
                write_u8(out, u8::from(t.negative));
                write_u32(out, t.days);
                out.extend_from_slice(&[t.hours, t.minutes, t.seconds]);
                if t.micros != 0 {
                    write_u32(out, t.micros);
                }
            }
        }
    }

    /// Textual (or raw byte) form of the value, as the server would render it.
    ///
    /// Returns `None` for NULL.
    pub fn to_text_bytes(&self) -> Option<Vec<u8>> {
        Some(match self {
            Value::Null => return None,
            Value::Int(v) => v.to_string().into_bytes(),
            Value::UInt(v) => v.to_string().into_bytes(),
            Value::Float(v) => v.to_string().into_bytes(),
            Value::Double(v) => v.to_string().into_bytes(),
            Value::Text(s) => s.clone().into_bytes(),
            Value::Bytes(b) => b.clone(),
            Value::Date(d) => format_date(d).into_bytes(),
            Value::DateTime(dt) => format_datetime(dt).into_bytes(),
            Value::Time(t) => format_time(t).into_bytes(),
        })
    }

    /// Append `other` to this value, producing the concatenated text.
    ///
    /// Used when the same parameter is bound more than once before execution.
    /// The result stays `Text` when both sides are textual and becomes
    /// `Bytes` as soon as either side is binary.
    pub fn append(&self, other: &Value) -> Result<Value> {
        let (Some(mut head), Some(tail)) = (self.to_text_bytes(), other.to_text_bytes()) else {
            return Err(Error::InvalidBind(
                "cannot accumulate a NULL parameter value".into(),
            ));
        };
        head.extend_from_slice(&tail);
        if matches!(self, Value::Bytes(_)) || matches!(other, Value::Bytes(_)) {
            return Ok(Value::Bytes(head));
        }
        match String::from_utf8(head) {
            Ok(s) => Ok(Value::Text(s)),
            Err(e) => Ok(Value::Bytes(e.into_bytes())),
        }
    }
}

fn write_date(out: &mut Vec<u8>, d: &Date) {
    write_u16(out, d.year);
    write_u8(out, d.month);
    write_u8(out, d.day);
}

fn format_date(d: &Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year, d.month, d.day)
}

fn format_datetime(dt: &DateTime) -> String {
    let mut s = format!(
        "{} {:02}:{:02}:{:02}",
        format_date(&dt.date),
        dt.hour,
        dt.minute,
        dt.second
    );
    if dt.micros != 0 {
        s.push_str(&format!(".{:06}", dt.micros));
    }
    s
}

fn format_time(t: &Time) -> String {
    let hours = u64::from(t.days) * 24 + u64::from(t.hours);
    let mut s = format!(
        "{}{:02}:{:02}:{:02}",
        if t.negative { "-" } else { "" },
        hours,
        t.minutes,
        t.seconds
    );
    if t.micros != 0 {
        s.push_str(&format!(".{:06}", t.micros));
    }
    s
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_text_bytes() {
            None => write!(f, "NULL"),
            Some(bytes) => write!(f, "{}", String::from_utf8_lossy(&bytes)),
        }
    }
}

// === Decoding ===

fn parse_num<T: std::str::FromStr>(s: &str, what: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    s.parse()
        .map_err(|e| Error::Protocol(format!("invalid {what} value {s:?}: {e}")))
}

fn parse_fraction(frac: Option<&str>) -> Result<u32> {
    match frac {
        None => Ok(0),
        Some(f) => {
            let mut digits: String = f.chars().take(6).collect();
            while digits.len() < 6 {
                digits.push('0');
            }
            parse_num(&digits, "fractional seconds")
        }
    }
}

fn parse_text_date(s: &str) -> Result<Date> {
    let mut parts = s.splitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(y), Some(m), Some(d)) => Ok(Date {
            year: parse_num(y, "year")?,
            month: parse_num(m, "month")?,
            day: parse_num(d, "day")?,
        }),
        _ => Err(Error::Protocol(format!("invalid DATE value {s:?}"))),
    }
}

fn parse_text_datetime(s: &str) -> Result<DateTime> {
    let (date, time) = s.split_once(' ').unwrap_or((s, "00:00:00"));
    let (hms, frac) = match time.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (time, None),
    };
    let mut parts = hms.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(m), Some(sec)) => Ok(DateTime {
            date: parse_text_date(date)?,
            hour: parse_num(h, "hour")?,
            minute: parse_num(m, "minute")?,
            second: parse_num(sec, "second")?,
            micros: parse_fraction(frac)?,
        }),
        _ => Err(Error::Protocol(format!("invalid DATETIME value {s:?}"))),
    }
}

fn parse_text_time(s: &str) -> Result<Time> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (hms, frac) = match body.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (body, None),
    };
    let mut parts = hms.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(m), Some(sec)) => {
            let total_hours: u32 = parse_num(h, "hour")?;
            Ok(Time {
                negative,
                days: total_hours / 24,
                hours: (total_hours % 24) as u8,
                minutes: parse_num(m, "minute")?,
                seconds: parse_num(sec, "second")?,
                micros: parse_fraction(frac)?,
            })
        }
        _ => Err(Error::Protocol(format!("invalid TIME value {s:?}"))),
    }
}

fn text_or_bytes(raw: &[u8], binary: bool) -> Value {
    if binary {
        return Value::Bytes(raw.to_vec());
    }
    match simdutf8::basic::from_utf8(raw) {
        Ok(s) => Value::Text(s.to_string()),
        Err(_) => Value::Bytes(raw.to_vec()),
    }
}

/// Decode one text-protocol column value.
pub fn decode_text(column_type: ColumnType, unsigned: bool, binary: bool, raw: &[u8]) -> Result<Value> {
    let as_str = || {
        simdutf8::basic::from_utf8(raw)
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in numeric column: {e}")))
    };
    Ok(match column_type {
        t if t.is_integer() => {
            if unsigned {
                Value::UInt(parse_num(as_str()?, "integer")?)
            } else {
                Value::Int(parse_num(as_str()?, "integer")?)
            }
        }
        ColumnType::Float => Value::Float(parse_num(as_str()?, "float")?),
        ColumnType::Double => Value::Double(parse_num(as_str()?, "double")?),
        ColumnType::Date => Value::Date(parse_text_date(as_str()?)?),
        ColumnType::DateTime | ColumnType::Timestamp => {
            Value::DateTime(parse_text_datetime(as_str()?)?)
        }
        ColumnType::Time => Value::Time(parse_text_time(as_str()?)?),
        ColumnType::Null => Value::Null,
        _ => text_or_bytes(raw, binary),
    })
}

fn read_binary_date(len: u8, data: &[u8]) -> Result<(DateTime, &[u8])> {
    let (body, rest) = read_bytes(data, usize::from(len))?;
    let mut dt = DateTime::default();
    if len >= 4 {
        let (year, b) = read_u16(body)?;
        dt.date = Date {
            year,
            month: b[0],
            day: b[1],
        };
    }
    if len >= 7 {
        dt.hour = body[4];
        dt.minute = body[5];
        dt.second = body[6];
    }
    if len >= 11 {
        dt.micros = read_u32(&body[7..])?.0;
    }
    Ok((dt, rest))
}

fn read_binary_time(len: u8, data: &[u8]) -> Result<(Time, &[u8])> {
    let (body, rest) = read_bytes(data, usize::from(len))?;
    let mut t = Time::default();
    if len >= 8 {
        t.negative = body[0] == 1;
        t.days = read_u32(&body[1..])?.0;
        t.hours = body[5];
        t.minutes = body[6];
        t.seconds = body[7];
    }
    if len >= 12 {
        t.micros = read_u32(&body[8..])?.0;
    }
    Ok((t, rest))
}

/// Decode one binary-protocol column value, returning the remaining row bytes.
pub fn decode_binary(column_type: ColumnType, unsigned: bool, binary: bool, data: &[u8]) -> Result<(Value, &[u8])> {
    Ok(match column_type {
        ColumnType::Tiny => {
            let (v, rest) = read_u8(data)?;
            let value = if unsigned { Value::UInt(u64::from(v)) } else { Value::Int(i64::from(v as i8)) };
            (value, rest)
        }
        ColumnType::Short | ColumnType::Year => {
            let (v, rest) = read_u16(data)?;
            let value = if unsigned { Value::UInt(u64::from(v)) } else { Value::Int(i64::from(v as i16)) };
            (value, rest)
        }
        ColumnType::Long | ColumnType::Int24 => {
            let (v, rest) = read_u32(data)?;
            let value = if unsigned { Value::UInt(u64::from(v)) } else { Value::Int(i64::from(v as i32)) };
            (value, rest)
        }
        ColumnType::LongLong => {
            let (v, rest) = read_u64(data)?;
            let value = if unsigned { Value::UInt(v) } else { Value::Int(v as i64) };
            (value, rest)
        }
        ColumnType::Float => {
            let (v, rest) = read_u32(data)?;
            (Value::Float(f32::from_bits(v)), rest)
        }
        ColumnType::Double => {
            let (v, rest) = read_u64(data)?;
            (Value::Double(f64::from_bits(v)), rest)
        }
        ColumnType::Date => {
            let (len, rest) = read_u8(data)?;
            let (dt, rest) = read_binary_date(len, rest)?;
            (Value::Date(dt.date), rest)
        }
        ColumnType::DateTime | ColumnType::Timestamp => {
            let (len, rest) = read_u8(data)?;
            let (dt, rest) = read_binary_date(len, rest)?;
            (Value::DateTime(dt), rest)
        }
        ColumnType::Time => {
            let (len, rest) = read_u8(data)?;
            let (t, rest) = read_binary_time(len, rest)?;
            (Value::Time(t), rest)
        }
        ColumnType::Null => (Value::Null, data),
        _ => {
            let (raw, rest) = read_lenenc_bytes(data)?;
            (text_or_bytes(raw, binary), rest)
        }
    })
}

// === Conversions into Value ===

macro_rules! impl_from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(i64::from(v))
            }
        }
    )*};
}

macro_rules! impl_from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::UInt(u64::from(v))
            }
        }
    )*};
}

impl_from_signed!(i8, i16, i32, i64);
impl_from_unsigned!(u8, u16, u32, u64);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Date> for Value {
    fn from(v: Date) -> Self {
        Value::Date(v)
    }
}

impl From<DateTime> for Value {
    fn from(v: DateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<Time> for Value {
    fn from(v: Time) -> Self {
        Value::Time(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

#[cfg(feature = "with-chrono")]
mod chrono_impls {
    use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

    use super::{Date, DateTime, Value};

    impl From<NaiveDate> for Value {
        fn from(v: NaiveDate) -> Self {
            Value::Date(Date {
                year: v.year() as u16,
                month: v.month() as u8,
                day: v.day() as u8,
            })
        }
    }

    impl From<NaiveDateTime> for Value {
        fn from(v: NaiveDateTime) -> Self {
            Value::DateTime(DateTime {
                date: Date {
                    year: v.year() as u16,
                    month: v.month() as u8,
                    day: v.day() as u8,
                },
                hour: v.hour() as u8,
                minute: v.minute() as u8,
                second: v.second() as u8,
                micros: v.nanosecond() / 1000,
            })
        }
    }
}
