//! SQL column types and the value conversions the write path needs.

use crate::error::{Error, TypeError};
use crate::value::Value;

/// SQL data types a property can be declared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    // Integer types
    TinyInt,
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Real,
    Double,

    // Fixed precision
    Decimal { precision: u8, scale: u8 },

    // Boolean
    Boolean,

    // String types
    VarChar(u32),
    Text,

    // Binary types
    Blob,

    // Date/time types
    Date,
    Time,
    Timestamp,
    TimestampTz,

    // UUID
    Uuid,

    // JSON
    Json,
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::TinyInt => "TINYINT".to_string(),
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Time => "TIME".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::TimestampTz => "TIMESTAMPTZ".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
        }
    }

    /// Check if this type is an integer type.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt
        )
    }

    /// Check if this type is a date/time type.
    pub const fn is_temporal(&self) -> bool {
        matches!(
            self,
            SqlType::Date | SqlType::Time | SqlType::Timestamp | SqlType::TimestampTz
        )
    }

    /// Convert a generated integer (auto-increment id, version) to this type.
    pub fn integer_value(&self, v: i64) -> crate::Result<Value> {
        let out_of_range = || {
            Error::Type(TypeError {
                expected: "integer in column range",
                actual: v.to_string(),
                column: None,
            })
        };
        match self {
            SqlType::TinyInt => i8::try_from(v)
                .map(Value::TinyInt)
                .map_err(|_| out_of_range()),
            SqlType::SmallInt => i16::try_from(v)
                .map(Value::SmallInt)
                .map_err(|_| out_of_range()),
            SqlType::Integer => i32::try_from(v).map(Value::Int).map_err(|_| out_of_range()),
            SqlType::BigInt => Ok(Value::BigInt(v)),
            other => Err(Error::Type(TypeError {
                expected: "integer column",
                actual: other.sql_name(),
                column: None,
            })),
        }
    }

    /// Convert a wall-clock instant (microseconds since epoch) to this type.
    pub fn timestamp_value(&self, micros: i64) -> crate::Result<Value> {
        const MICROS_PER_DAY: i64 = 86_400_000_000;
        match self {
            SqlType::Timestamp => Ok(Value::Timestamp(micros)),
            SqlType::TimestampTz => Ok(Value::TimestampTz(micros)),
            SqlType::Date => i32::try_from(micros.div_euclid(MICROS_PER_DAY))
                .map(Value::Date)
                .map_err(|_| {
                    Error::Type(TypeError {
                        expected: "date in range",
                        actual: micros.to_string(),
                        column: None,
                    })
                }),
            SqlType::BigInt => Ok(Value::BigInt(micros)),
            other => Err(Error::Type(TypeError {
                expected: "temporal column",
                actual: other.sql_name(),
                column: None,
            })),
        }
    }

    /// Convert 16 random bytes to this type (native UUID or canonical text).
    pub fn uuid_value(&self, bytes: [u8; 16]) -> crate::Result<Value> {
        match self {
            SqlType::Uuid => Ok(Value::Uuid(bytes)),
            SqlType::Text | SqlType::VarChar(_) => Ok(Value::Text(format_uuid(&bytes))),
            SqlType::Blob => Ok(Value::Bytes(bytes.to_vec())),
            other => Err(Error::Type(TypeError {
                expected: "uuid-compatible column",
                actual: other.sql_name(),
                column: None,
            })),
        }
    }
}

/// Format 16 bytes as a hyphenated lowercase UUID.
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, b) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{:02x}", b));
    }
    out
}
