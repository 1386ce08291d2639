//! Result rows, column metadata and typed value access.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::types::{BINARY_CHARSET, ColumnType, column_flags};
use crate::value::{Date, DateTime, Time, Value};

/// Column metadata from a column definition packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub length: u32,
    pub column_type: ColumnType,
    pub flags: u16,
    pub decimals: u8,
}

impl Column {
    /// Integer column declared `UNSIGNED`.
    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    /// Column uses the `binary` charset (BLOB, VARBINARY, ...).
    pub fn is_binary(&self) -> bool {
        self.charset == BINARY_CHARSET
    }

    /// Column declared `NOT NULL`.
    pub fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }
}

/// A decoded row.
///
/// Column metadata is shared by every row of the same result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Position of the first column called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Raw value at `idx`.
    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Typed value at `idx`.
    pub fn get<T: FromValue>(&self, idx: usize) -> Result<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            Error::Decode(format!(
                "column index {idx} out of range ({} columns)",
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Typed value of the column called `name`.
    pub fn get_by_name<T: FromValue>(&self, name: &str) -> Result<T> {
        let idx = self
            .index_of(name)
            .ok_or_else(|| Error::Decode(format!("no column named {name:?}")))?;
        self.get(idx)
    }

    /// Decode the whole row into a tuple.
    pub fn decode<T: FromRow>(&self) -> Result<T> {
        T::from_row(self)
    }
}

/// Conversion from a decoded [`Value`] into a Rust type.
pub trait FromValue: Sized {
    /// Decode from NULL.
    ///
    /// Default implementation returns an error. Override for types that can
    /// represent NULL (like `Option<T>`).
    fn from_null() -> Result<Self> {
        Err(Error::Decode("unexpected NULL value".into()))
    }

    /// Decode from a non-NULL value.
    fn from_non_null(value: &Value) -> Result<Self>;

    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Self::from_null(),
            v => Self::from_non_null(v),
        }
    }
}

fn mismatch<T>(value: &Value, target: &str) -> Result<T> {
    Err(Error::Decode(format!("cannot decode {value:?} as {target}")))
}

macro_rules! impl_from_value_int {
    ($($t:ty),*) => {$(
        impl FromValue for $t {
            fn from_non_null(value: &Value) -> Result<Self> {
                let out_of_range = |e: std::num::TryFromIntError| Error::Decode(format!(
                    "{value:?} out of range for {}: {e}", stringify!($t)
                ));
                match value {
                    Value::Int(v) => <$t>::try_from(i128::from(*v)).map_err(out_of_range),
                    Value::UInt(v) => <$t>::try_from(i128::from(*v)).map_err(out_of_range),
                    Value::Text(s) => s.trim().parse().map_err(|e| {
                        Error::Decode(format!("invalid {} {s:?}: {e}", stringify!($t)))
                    }),
                    v => mismatch(v, stringify!($t)),
                }
            }
        }
    )*};
}

impl_from_value_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FromValue for f64 {
    fn from_non_null(value: &Value) -> Result<Self> {
        match value {
            Value::Double(v) => Ok(*v),
            Value::Float(v) => Ok(f64::from(*v)),
            Value::Int(v) => Ok(*v as f64),
            Value::UInt(v) => Ok(*v as f64),
            Value::Text(s) => s
                .trim()
                .parse()
                .map_err(|e| Error::Decode(format!("invalid f64 {s:?}: {e}"))),
            v => mismatch(v, "f64"),
        }
    }
}

impl FromValue for f32 {
    fn from_non_null(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(*v),
            Value::Double(v) => Ok(*v as f32),
            Value::Text(s) => s
                .trim()
                .parse()
                .map_err(|e| Error::Decode(format!("invalid f32 {s:?}: {e}"))),
            v => mismatch(v, "f32"),
        }
    }
}

impl FromValue for bool {
    fn from_non_null(value: &Value) -> Result<Self> {
        match value {
            Value::Int(v) => Ok(*v != 0),
            Value::UInt(v) => Ok(*v != 0),
            Value::Text(s) => match s.as_str() {
                "1" => Ok(true),
                "0" => Ok(false),
                _ => mismatch(value, "bool"),
            },
            v => mismatch(v, "bool"),
        }
    }
}

impl FromValue for String {
    fn from_non_null(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            Value::Bytes(b) => String::from_utf8(b.clone())
                .map_err(|e| Error::Decode(format!("invalid UTF-8: {e}"))),
            v => Ok(v.to_string()),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_non_null(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.clone().into_bytes()),
            v => mismatch(v, "Vec<u8>"),
        }
    }
}

impl FromValue for Date {
    fn from_non_null(value: &Value) -> Result<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            Value::DateTime(dt) => Ok(dt.date),
            v => mismatch(v, "Date"),
        }
    }
}

impl FromValue for DateTime {
    fn from_non_null(value: &Value) -> Result<Self> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            Value::Date(d) => Ok(DateTime {
                date: *d,
                ..Default::default()
            }),
            v => mismatch(v, "DateTime"),
        }
    }
}

impl FromValue for Time {
    fn from_non_null(value: &Value) -> Result<Self> {
        match value {
            Value::Time(t) => Ok(*t),
            v => mismatch(v, "Time"),
        }
    }
}

impl FromValue for Value {
    fn from_null() -> Result<Self> {
        Ok(Value::Null)
    }

    fn from_non_null(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_null() -> Result<Self> {
        Ok(None)
    }

    fn from_non_null(value: &Value) -> Result<Self> {
        T::from_non_null(value).map(Some)
    }
}

#[cfg(feature = "with-chrono")]
mod chrono_impls {
    use chrono::{NaiveDate, NaiveDateTime};

    use super::{FromValue, mismatch};
    use crate::error::{Error, Result};
    use crate::value::{Date, Value};

    fn to_naive_date(d: &Date) -> Result<NaiveDate> {
        NaiveDate::from_ymd_opt(i32::from(d.year), u32::from(d.month), u32::from(d.day))
            .ok_or_else(|| Error::Decode(format!("invalid date {d:?}")))
    }

    impl FromValue for NaiveDate {
        fn from_non_null(value: &Value) -> Result<Self> {
            match value {
                Value::Date(d) => to_naive_date(d),
                Value::DateTime(dt) => to_naive_date(&dt.date),
                v => mismatch(v, "NaiveDate"),
            }
        }
    }

    impl FromValue for NaiveDateTime {
        fn from_non_null(value: &Value) -> Result<Self> {
            match value {
                Value::DateTime(dt) => to_naive_date(&dt.date)?
                    .and_hms_micro_opt(
                        u32::from(dt.hour),
                        u32::from(dt.minute),
                        u32::from(dt.second),
                        dt.micros,
                    )
                    .ok_or_else(|| Error::Decode(format!("invalid datetime {dt:?}"))),
                Value::Date(d) => to_naive_date(d)?
                    .and_hms_opt(0, 0, 0)
                    .ok_or_else(|| Error::Decode(format!("invalid date {d:?}"))),
                v => mismatch(v, "NaiveDateTime"),
            }
        }
    }
}

/// Decode a whole row into a Rust type.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

macro_rules! impl_from_row_tuple {
    ($n:expr; $($t:ident => $idx:tt),+) => {
        impl<$($t: FromValue),+> FromRow for ($($t,)+) {
            fn from_row(row: &Row) -> Result<Self> {
                if row.len() < $n {
                    return Err(Error::Decode("not enough columns for tuple".into()));
                }
                Ok(($(row.get::<$t>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1; T1 => 0);
impl_from_row_tuple!(2; T1 => 0, T2 => 1);
impl_from_row_tuple!(3; T1 => 0, T2 => 1, T3 => 2);
impl_from_row_tuple!(4; T1 => 0, T2 => 1, T3 => 2, T4 => 3);
impl_from_row_tuple!(5; T1 => 0, T2 => 1, T3 => 2, T4 => 3, T5 => 4);
impl_from_row_tuple!(6; T1 => 0, T2 => 1, T3 => 2, T4 => 3, T5 => 4, T6 => 5);

impl FromRow for Row {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.clone())
    }
}

impl FromRow for Vec<Value> {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(row.values.clone())
    }
}
