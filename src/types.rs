//! MySQL type system and value conversion.
//!
//! Column metadata names a type id; this module owns the dispatch from type
//! id to decoder for both protocols. Text protocol transmits every value as
//! a length-encoded string; binary protocol uses fixed-width encodings for
//! numbers, length-prefixed component blocks for temporal types, and lenenc
//! bytes for everything else.

#![allow(clippy::cast_possible_truncation)]

use crate::charset;
use crate::protocol::{PacketReader, PacketWriter};
use crate::value::{Date, DateTime, TimeDelta, Value};

/// MySQL field type codes (the `MYSQL_TYPE_*` constants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from a byte. Unknown codes decode as strings.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::NewDate
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
        )
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// Column definition from a result set (ColumnDefinition41).
#[derive(Debug, Clone)]
pub struct ColumnDef {
    /// Catalog name (always "def")
    pub catalog: String,
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Collation id
    pub charset: u16,
    /// Display length
    pub column_length: u32,
    /// Column type
    pub column_type: FieldType,
    /// Column flags
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
}

impl ColumnDef {
    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    /// Whether values of this column are raw bytes rather than text.
    ///
    /// The BINARY flag alone is not enough: temporal columns carry it too.
    /// The binary pseudo-charset is the deciding signal.
    #[must_use]
    pub fn is_binary_data(&self) -> bool {
        charset::is_binary(self.charset)
    }
}

/// Decode a text-protocol cell into a [`Value`].
pub fn decode_text_value(col: &ColumnDef, data: &[u8]) -> Value {
    match col.column_type {
        FieldType::Null => Value::Null,

        FieldType::Tiny
        | FieldType::Short
        | FieldType::Long
        | FieldType::Int24
        | FieldType::LongLong
        | FieldType::Year => {
            let text = String::from_utf8_lossy(data);
            if col.is_unsigned() {
                text.parse::<u64>()
                    .map_or_else(|_| Value::Text(text.into_owned()), Value::UInt)
            } else {
                text.parse::<i64>()
                    .map_or_else(|_| Value::Text(text.into_owned()), Value::Int)
            }
        }

        FieldType::Float => {
            let text = String::from_utf8_lossy(data);
            text.parse::<f32>()
                .map_or_else(|_| Value::Text(text.into_owned()), Value::Float)
        }

        FieldType::Double => {
            let text = String::from_utf8_lossy(data);
            text.parse::<f64>()
                .map_or_else(|_| Value::Text(text.into_owned()), Value::Double)
        }

        FieldType::Decimal | FieldType::NewDecimal => {
            Value::Decimal(String::from_utf8_lossy(data).into_owned())
        }

        FieldType::Date | FieldType::NewDate => {
            let text = String::from_utf8_lossy(data);
            parse_date_text(&text).map_or_else(|| Value::Text(text.into_owned()), Value::Date)
        }

        FieldType::Time => {
            let text = String::from_utf8_lossy(data);
            parse_time_text(&text).map_or_else(|| Value::Text(text.into_owned()), Value::Time)
        }

        FieldType::DateTime | FieldType::Timestamp => {
            let text = String::from_utf8_lossy(data);
            parse_datetime_text(&text)
                .map_or_else(|| Value::Text(text.into_owned()), Value::DateTime)
        }

        FieldType::Json => {
            serde_json::from_slice(data)
                .map_or_else(|_| Value::Text(String::from_utf8_lossy(data).into_owned()), Value::Json)
        }

        FieldType::Bit => Value::Bytes(data.to_vec()),

        t if t.is_blob() => {
            if col.is_binary_data() {
                Value::Bytes(data.to_vec())
            } else {
                // TEXT columns arrive with a blob type id but a text charset
                Value::Text(String::from_utf8_lossy(data).into_owned())
            }
        }

        _ => {
            if col.is_binary_data() {
                Value::Bytes(data.to_vec())
            } else {
                Value::Text(String::from_utf8_lossy(data).into_owned())
            }
        }
    }
}

/// Decode a binary-protocol cell, consuming exactly its bytes.
///
/// Returns `None` when the payload ends mid-value.
pub fn decode_binary_value(reader: &mut PacketReader<'_>, col: &ColumnDef) -> Option<Value> {
    match col.column_type {
        FieldType::Null => Some(Value::Null),

        FieldType::Tiny => {
            let b = reader.read_u8()?;
            Some(if col.is_unsigned() {
                Value::UInt(u64::from(b))
            } else {
                Value::Int(i64::from(b as i8))
            })
        }

        FieldType::Short | FieldType::Year => {
            let v = reader.read_u16_le()?;
            Some(if col.is_unsigned() {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i16))
            })
        }

        FieldType::Long | FieldType::Int24 => {
            let v = reader.read_u32_le()?;
            Some(if col.is_unsigned() {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i32))
            })
        }

        FieldType::LongLong => {
            let v = reader.read_u64_le()?;
            Some(if col.is_unsigned() {
                Value::UInt(v)
            } else {
                Value::Int(v as i64)
            })
        }

        FieldType::Float => {
            let bytes = reader.read_bytes(4)?;
            Some(Value::Float(f32::from_le_bytes(bytes.try_into().ok()?)))
        }

        FieldType::Double => {
            let bytes = reader.read_bytes(8)?;
            Some(Value::Double(f64::from_le_bytes(bytes.try_into().ok()?)))
        }

        FieldType::Date | FieldType::NewDate => decode_binary_date(reader).map(Value::Date),

        FieldType::Time => decode_binary_time(reader).map(Value::Time),

        FieldType::DateTime | FieldType::Timestamp => {
            decode_binary_datetime(reader).map(Value::DateTime)
        }

        FieldType::Decimal | FieldType::NewDecimal => {
            let bytes = reader.read_lenenc_bytes()?;
            Some(Value::Decimal(String::from_utf8_lossy(bytes).into_owned()))
        }

        FieldType::Json => {
            let bytes = reader.read_lenenc_bytes()?;
            Some(
                serde_json::from_slice(bytes).map_or_else(
                    |_| Value::Text(String::from_utf8_lossy(bytes).into_owned()),
                    Value::Json,
                ),
            )
        }

        FieldType::Bit => {
            let bytes = reader.read_lenenc_bytes()?;
            Some(Value::Bytes(bytes.to_vec()))
        }

        _ => {
            let bytes = reader.read_lenenc_bytes()?;
            Some(if col.is_binary_data() {
                Value::Bytes(bytes.to_vec())
            } else {
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            })
        }
    }
}

/// Encode a parameter value for the binary protocol.
///
/// NULL writes nothing; it travels in the null bitmap.
pub fn encode_binary_value(writer: &mut PacketWriter, value: &Value) {
    match value {
        Value::Null => {}
        Value::Int(v) => writer.write_u64_le(*v as u64),
        Value::UInt(v) => writer.write_u64_le(*v),
        Value::Float(v) => writer.write_bytes(&v.to_le_bytes()),
        Value::Double(v) => writer.write_bytes(&v.to_le_bytes()),
        Value::Decimal(s) => writer.write_lenenc_string(s),
        Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
        Value::Date(d) => encode_binary_date(writer, *d),
        Value::Time(t) => encode_binary_time(writer, *t),
        Value::DateTime(dt) => encode_binary_datetime(writer, *dt),
    }
}

/// The field type declared for a parameter value.
pub fn value_to_field_type(value: &Value) -> FieldType {
    match value {
        Value::Null => FieldType::Null,
        Value::Int(_) | Value::UInt(_) => FieldType::LongLong,
        Value::Float(_) => FieldType::Float,
        Value::Double(_) => FieldType::Double,
        Value::Decimal(_) => FieldType::NewDecimal,
        Value::Text(_) => FieldType::VarString,
        Value::Bytes(_) => FieldType::Blob,
        Value::Json(_) => FieldType::Json,
        Value::Date(_) => FieldType::Date,
        Value::Time(_) => FieldType::Time,
        Value::DateTime(_) => FieldType::DateTime,
    }
}

/// Whether a parameter needs the unsigned flag in its declared type.
pub const fn value_is_unsigned(value: &Value) -> bool {
    matches!(value, Value::UInt(_))
}

// ----------------------------------------------------------------------------
// Binary temporal blocks
// ----------------------------------------------------------------------------

fn decode_binary_date(reader: &mut PacketReader<'_>) -> Option<Date> {
    let len = reader.read_u8()?;
    match len {
        0 => Some(Date::default()),
        4 | 7 | 11 => {
            let year = reader.read_u16_le()?;
            let month = reader.read_u8()?;
            let day = reader.read_u8()?;
            // A DATE column never carries time fields, but be tolerant
            if len > 4 {
                reader.skip((len - 4) as usize);
            }
            Some(Date { year, month, day })
        }
        _ => None,
    }
}

fn decode_binary_time(reader: &mut PacketReader<'_>) -> Option<TimeDelta> {
    let len = reader.read_u8()?;
    match len {
        0 => Some(TimeDelta::default()),
        8 | 12 => {
            let negative = reader.read_u8()? != 0;
            let days = reader.read_u32_le()?;
            let hours = reader.read_u8()?;
            let minutes = reader.read_u8()?;
            let seconds = reader.read_u8()?;
            let micros = if len == 12 { reader.read_u32_le()? } else { 0 };
            Some(TimeDelta {
                negative,
                days,
                hours,
                minutes,
                seconds,
                micros,
            })
        }
        _ => None,
    }
}

fn decode_binary_datetime(reader: &mut PacketReader<'_>) -> Option<DateTime> {
    let len = reader.read_u8()?;
    match len {
        0 => Some(DateTime::default()),
        4 | 7 | 11 => {
            let year = reader.read_u16_le()?;
            let month = reader.read_u8()?;
            let day = reader.read_u8()?;
            let (hour, minute, second) = if len >= 7 {
                (reader.read_u8()?, reader.read_u8()?, reader.read_u8()?)
            } else {
                (0, 0, 0)
            };
            let micros = if len == 11 { reader.read_u32_le()? } else { 0 };
            Some(DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
                micros,
            })
        }
        _ => None,
    }
}

fn encode_binary_date(writer: &mut PacketWriter, d: Date) {
    if d.is_zero() {
        writer.write_u8(0);
    } else {
        writer.write_u8(4);
        writer.write_u16_le(d.year);
        writer.write_u8(d.month);
        writer.write_u8(d.day);
    }
}

fn encode_binary_time(writer: &mut PacketWriter, t: TimeDelta) {
    if t.is_zero() {
        writer.write_u8(0);
    } else {
        writer.write_u8(if t.micros == 0 { 8 } else { 12 });
        writer.write_u8(u8::from(t.negative));
        writer.write_u32_le(t.days);
        writer.write_u8(t.hours);
        writer.write_u8(t.minutes);
        writer.write_u8(t.seconds);
        if t.micros != 0 {
            writer.write_u32_le(t.micros);
        }
    }
}

fn encode_binary_datetime(writer: &mut PacketWriter, dt: DateTime) {
    if dt.is_zero() {
        writer.write_u8(0);
    } else if dt.hour == 0 && dt.minute == 0 && dt.second == 0 && dt.micros == 0 {
        writer.write_u8(4);
        writer.write_u16_le(dt.year);
        writer.write_u8(dt.month);
        writer.write_u8(dt.day);
    } else {
        writer.write_u8(if dt.micros == 0 { 7 } else { 11 });
        writer.write_u16_le(dt.year);
        writer.write_u8(dt.month);
        writer.write_u8(dt.day);
        writer.write_u8(dt.hour);
        writer.write_u8(dt.minute);
        writer.write_u8(dt.second);
        if dt.micros != 0 {
            writer.write_u32_le(dt.micros);
        }
    }
}

// ----------------------------------------------------------------------------
// Text temporal parsing
// ----------------------------------------------------------------------------

fn parse_date_text(text: &str) -> Option<Date> {
    let mut parts = text.splitn(3, '-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next()?.parse().ok()?;
    let day = parts.next()?.parse().ok()?;
    Some(Date { year, month, day })
}

fn parse_time_text(text: &str) -> Option<TimeDelta> {
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (hms, micros) = match rest.split_once('.') {
        Some((hms, frac)) => {
            // Fractional seconds are sent with their declared precision
            let mut frac = frac.to_string();
            while frac.len() < 6 {
                frac.push('0');
            }
            (hms, frac[..6].parse().ok()?)
        }
        None => (rest, 0),
    };
    let mut parts = hms.splitn(3, ':');
    let total_hours: u64 = parts.next()?.parse().ok()?;
    let minutes = parts.next()?.parse().ok()?;
    let seconds = parts.next()?.parse().ok()?;
    Some(TimeDelta {
        negative,
        days: (total_hours / 24) as u32,
        hours: (total_hours % 24) as u8,
        minutes,
        seconds,
        micros,
    })
}

fn parse_datetime_text(text: &str) -> Option<DateTime> {
    let (date_part, time_part) = text.split_once(' ')?;
    let date = parse_date_text(date_part)?;
    let (hms, micros) = match time_part.split_once('.') {
        Some((hms, frac)) => {
            let mut frac = frac.to_string();
            while frac.len() < 6 {
                frac.push('0');
            }
            (hms, frac[..6].parse().ok()?)
        }
        None => (time_part, 0),
    };
    let mut parts = hms.splitn(3, ':');
    let hour = parts.next()?.parse().ok()?;
    let minute = parts.next()?.parse().ok()?;
    let second = parts.next()?.parse().ok()?;
    Some(DateTime {
        year: date.year,
        month: date.month,
        day: date.day,
        hour,
        minute,
        second,
        micros,
    })
}

// ----------------------------------------------------------------------------
// Text-protocol parameter substitution
// ----------------------------------------------------------------------------

/// Escape a string as a MySQL single-quoted literal.
fn escape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => result.push_str("''"),
            '\\' => result.push_str("\\\\"),
            '\0' => result.push_str("\\0"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x1a' => result.push_str("\\Z"),
            _ => result.push(ch),
        }
    }
    result.push('\'');
    result
}

/// Escape bytes as a hex literal.
fn escape_bytes(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2 + 3);
    result.push_str("X'");
    for byte in data {
        result.push_str(&format!("{byte:02X}"));
    }
    result.push('\'');
    result
}

/// Format a value as a SQL literal for the text protocol.
pub fn format_value_for_sql(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => {
            if v.is_finite() {
                v.to_string()
            } else {
                "NULL".to_string()
            }
        }
        Value::Double(v) => {
            if v.is_finite() {
                v.to_string()
            } else {
                "NULL".to_string()
            }
        }
        Value::Decimal(s) => s.clone(),
        Value::Text(s) => escape_string(s),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => escape_string(&j.to_string()),
        Value::Date(d) => format!("'{d}'"),
        Value::Time(t) => format!("'{t}'"),
        Value::DateTime(dt) => format!("'{dt}'"),
    }
}

/// Substitute `?` placeholders with escaped literals.
///
/// Placeholders inside single-quoted strings, double-quoted strings, and
/// backtick identifiers are left alone.
pub fn interpolate_params(sql: &str, params: &[Value]) -> String {
    if params.is_empty() {
        return sql.to_string();
    }

    let mut result = String::with_capacity(sql.len() + params.len() * 20);
    let mut chars = sql.chars().peekable();
    let mut param_index = 0;

    while let Some(ch) = chars.next() {
        match ch {
            '?' => {
                if param_index < params.len() {
                    result.push_str(&format_value_for_sql(&params[param_index]));
                    param_index += 1;
                } else {
                    result.push('?');
                }
            }
            quote @ ('\'' | '"' | '`') => {
                result.push(quote);
                while let Some(next_ch) = chars.next() {
                    result.push(next_ch);
                    if next_ch == quote {
                        // A doubled quote stays inside the literal
                        match chars.next_if(|&c| c == quote) {
                            Some(c) => result.push(c),
                            None => break,
                        }
                    }
                }
            }
            _ => result.push(ch),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(column_type: FieldType, flags: u16, cs: u16) -> ColumnDef {
        ColumnDef {
            catalog: "def".to_string(),
            schema: "test".to_string(),
            table: "t".to_string(),
            org_table: "t".to_string(),
            name: "c".to_string(),
            org_name: "c".to_string(),
            charset: cs,
            column_length: 11,
            column_type,
            flags,
            decimals: 0,
        }
    }

    #[test]
    fn test_field_type_from_u8() {
        assert_eq!(FieldType::from_u8(0x01), FieldType::Tiny);
        assert_eq!(FieldType::from_u8(0x03), FieldType::Long);
        assert_eq!(FieldType::from_u8(0x08), FieldType::LongLong);
        assert_eq!(FieldType::from_u8(0xFC), FieldType::Blob);
        assert_eq!(FieldType::from_u8(0xF5), FieldType::Json);
        // Unknown codes decode as strings
        assert_eq!(FieldType::from_u8(0x42), FieldType::String);
    }

    #[test]
    fn test_decode_text_integers() {
        let signed = col(FieldType::Long, 0, 63);
        assert_eq!(decode_text_value(&signed, b"-42"), Value::Int(-42));

        let unsigned = col(FieldType::LongLong, column_flags::UNSIGNED, 63);
        assert_eq!(
            decode_text_value(&unsigned, b"18446744073709551615"),
            Value::UInt(u64::MAX)
        );
    }

    #[test]
    fn test_decode_text_temporal() {
        let c = col(FieldType::Date, 0, 63);
        assert_eq!(
            decode_text_value(&c, b"2024-02-29"),
            Value::Date(Date {
                year: 2024,
                month: 2,
                day: 29
            })
        );

        let c = col(FieldType::Time, 0, 63);
        assert_eq!(
            decode_text_value(&c, b"-26:03:04"),
            Value::Time(TimeDelta {
                negative: true,
                days: 1,
                hours: 2,
                minutes: 3,
                seconds: 4,
                micros: 0
            })
        );

        let c = col(FieldType::DateTime, 0, 63);
        assert_eq!(
            decode_text_value(&c, b"2024-01-02 03:04:05.5"),
            Value::DateTime(DateTime {
                year: 2024,
                month: 1,
                day: 2,
                hour: 3,
                minute: 4,
                second: 5,
                micros: 500_000
            })
        );
    }

    #[test]
    fn test_decode_text_blob_charset_split() {
        // BLOB: blob type id + binary charset
        let blob = col(FieldType::Blob, column_flags::BINARY, 63);
        assert_eq!(
            decode_text_value(&blob, &[0x00, 0xFF]),
            Value::Bytes(vec![0x00, 0xFF])
        );

        // TEXT: blob type id + text charset
        let text = col(FieldType::Blob, 0, 45);
        assert_eq!(
            decode_text_value(&text, b"hello"),
            Value::Text("hello".to_string())
        );
    }

    #[test]
    fn test_binary_value_roundtrip() {
        let cases: Vec<(Value, ColumnDef)> = vec![
            (Value::Int(-1), col(FieldType::LongLong, 0, 63)),
            (
                Value::UInt(u64::MAX),
                col(FieldType::LongLong, column_flags::UNSIGNED, 63),
            ),
            (Value::Float(1.5), col(FieldType::Float, 0, 63)),
            (Value::Double(-2.25), col(FieldType::Double, 0, 63)),
            (
                Value::Decimal("123.450".to_string()),
                col(FieldType::NewDecimal, 0, 63),
            ),
            (
                Value::Text("héllo".to_string()),
                col(FieldType::VarString, 0, 45),
            ),
            (
                Value::Bytes(vec![0, 1, 2, 255]),
                col(FieldType::Blob, column_flags::BINARY, 63),
            ),
            (
                Value::Date(Date {
                    year: 2024,
                    month: 12,
                    day: 31,
                }),
                col(FieldType::Date, 0, 63),
            ),
            (
                Value::Time(TimeDelta {
                    negative: false,
                    days: 0,
                    hours: 1,
                    minutes: 2,
                    seconds: 3,
                    micros: 400,
                }),
                col(FieldType::Time, 0, 63),
            ),
            (
                Value::DateTime(DateTime {
                    year: 2024,
                    month: 6,
                    day: 15,
                    hour: 12,
                    minute: 30,
                    second: 45,
                    micros: 123_456,
                }),
                col(FieldType::DateTime, 0, 63),
            ),
            (
                Value::Json(serde_json::json!({"k": [1, 2]})),
                col(FieldType::Json, 0, 45),
            ),
        ];

        for (value, column) in cases {
            let mut writer = PacketWriter::new();
            encode_binary_value(&mut writer, &value);
            let bytes = writer.into_bytes();
            let mut reader = PacketReader::new(&bytes);
            let decoded = decode_binary_value(&mut reader, &column)
                .unwrap_or_else(|| panic!("decode failed for {value:?}"));
            assert_eq!(decoded, value);
            assert!(reader.is_empty(), "trailing bytes for {value:?}");
        }
    }

    #[test]
    fn test_binary_zero_date() {
        let mut writer = PacketWriter::new();
        encode_binary_value(&mut writer, &Value::Date(Date::default()));
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![0]);

        let mut reader = PacketReader::new(&bytes);
        let decoded = decode_binary_value(&mut reader, &col(FieldType::Date, 0, 63)).unwrap();
        assert_eq!(decoded, Value::Date(Date::default()));
    }

    #[test]
    fn test_truncated_binary_value() {
        let c = col(FieldType::Long, 0, 63);
        let mut reader = PacketReader::new(&[0x01, 0x02]);
        assert!(decode_binary_value(&mut reader, &c).is_none());
    }

    #[test]
    fn test_escape_string() {
        assert_eq!(escape_string("hello"), "'hello'");
        assert_eq!(escape_string("it's"), "'it''s'");
        assert_eq!(escape_string("a\\b"), "'a\\\\b'");
        assert_eq!(escape_string("line\nbreak"), "'line\\nbreak'");
    }

    #[test]
    fn test_format_value_for_sql() {
        assert_eq!(format_value_for_sql(&Value::Null), "NULL");
        assert_eq!(format_value_for_sql(&Value::Int(42)), "42");
        assert_eq!(
            format_value_for_sql(&Value::Text("x".to_string())),
            "'x'"
        );
        assert_eq!(format_value_for_sql(&Value::Double(f64::NAN)), "NULL");
        assert_eq!(
            format_value_for_sql(&Value::Bytes(vec![0xDE, 0xAD])),
            "X'DEAD'"
        );
    }

    #[test]
    fn test_interpolate_params() {
        let sql = "SELECT * FROM users WHERE id = ? AND name = ?";
        let params = vec![Value::Int(1), Value::Text("Alice".to_string())];
        assert_eq!(
            interpolate_params(sql, &params),
            "SELECT * FROM users WHERE id = 1 AND name = 'Alice'"
        );
    }

    #[test]
    fn test_interpolate_skips_quoted_regions() {
        let sql = "SELECT '?' AS q, `a?b`, \"x?\" WHERE id = ?";
        let params = vec![Value::Int(42)];
        assert_eq!(
            interpolate_params(sql, &params),
            "SELECT '?' AS q, `a?b`, \"x?\" WHERE id = 42"
        );
    }
}
