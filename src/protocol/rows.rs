//! Result-set packet decoding: column definitions and rows.
//!
//! Shared by the sync and async connections; everything here operates on one
//! already-reassembled packet payload.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{PacketReader, PacketWriter};
use crate::row::{ColumnInfo, Row};
use crate::types::{ColumnDef, FieldType, decode_binary_value, decode_text_value, encode_binary_value};
use crate::value::Value;

/// Parse a ColumnDefinition41 packet.
pub fn parse_column_def(payload: &[u8]) -> Result<ColumnDef> {
    let mut reader = PacketReader::new(payload);

    let catalog = reader
        .read_lenenc_string()
        .ok_or(Error::Truncated("column catalog"))?;
    let schema = reader
        .read_lenenc_string()
        .ok_or(Error::Truncated("column schema"))?;
    let table = reader
        .read_lenenc_string()
        .ok_or(Error::Truncated("column table"))?;
    let org_table = reader
        .read_lenenc_string()
        .ok_or(Error::Truncated("column org_table"))?;
    let name = reader
        .read_lenenc_string()
        .ok_or(Error::Truncated("column name"))?;
    let org_name = reader
        .read_lenenc_string()
        .ok_or(Error::Truncated("column org_name"))?;

    // Length of the fixed fields, always 0x0C
    let _fixed_len = reader
        .read_lenenc_int()
        .ok_or(Error::Truncated("column fixed length"))?;

    let charset = reader
        .read_u16_le()
        .ok_or(Error::Truncated("column charset"))?;
    let column_length = reader
        .read_u32_le()
        .ok_or(Error::Truncated("column length"))?;
    let column_type = FieldType::from_u8(
        reader
            .read_u8()
            .ok_or(Error::Truncated("column type"))?,
    );
    let flags = reader
        .read_u16_le()
        .ok_or(Error::Truncated("column flags"))?;
    let decimals = reader
        .read_u8()
        .ok_or(Error::Truncated("column decimals"))?;
    // 2 reserved bytes follow; absent in some old servers, so no error

    Ok(ColumnDef {
        catalog,
        schema,
        table,
        org_table,
        name,
        org_name,
        charset,
        column_length,
        column_type,
        flags,
        decimals,
    })
}

/// Encode a ColumnDefinition41 packet payload.
pub fn encode_column_def(col: &ColumnDef) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string(&col.catalog);
    w.write_lenenc_string(&col.schema);
    w.write_lenenc_string(&col.table);
    w.write_lenenc_string(&col.org_table);
    w.write_lenenc_string(&col.name);
    w.write_lenenc_string(&col.org_name);
    w.write_lenenc_int(0x0C);
    w.write_u16_le(col.charset);
    w.write_u32_le(col.column_length);
    w.write_u8(col.column_type as u8);
    w.write_u16_le(col.flags);
    w.write_u8(col.decimals);
    w.write_zeros(2);
    w.into_bytes()
}

/// Build the shared column metadata for a result set.
pub fn column_info(columns: &[ColumnDef]) -> Arc<ColumnInfo> {
    Arc::new(ColumnInfo::new(
        columns.iter().map(|c| c.name.clone()).collect(),
    ))
}

/// Parse a text-protocol row: one lenenc value per column, 0xFB for NULL.
pub fn parse_text_row(
    payload: &[u8],
    columns: &[ColumnDef],
    info: &Arc<ColumnInfo>,
) -> Result<Row> {
    let mut reader = PacketReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());

    for col in columns {
        if reader.peek() == Some(0xFB) {
            reader.skip(1);
            values.push(Value::Null);
        } else {
            let data = reader
                .read_lenenc_bytes()
                .ok_or(Error::Truncated("text row value"))?;
            values.push(decode_text_value(col, data));
        }
    }

    Ok(Row::new(Arc::clone(info), values))
}

/// Size of the binary-row null bitmap for `n` columns (2-bit offset).
pub const fn null_bitmap_len(columns: usize) -> usize {
    (columns + 7 + 2) / 8
}

/// Parse a binary-protocol row: 0x00 marker, null bitmap, then values.
pub fn parse_binary_row(
    payload: &[u8],
    columns: &[ColumnDef],
    info: &Arc<ColumnInfo>,
) -> Result<Row> {
    let mut reader = PacketReader::new(payload);

    let marker = reader.read_u8().ok_or(Error::Truncated("binary row marker"))?;
    if marker != 0x00 {
        return Err(Error::protocol(format!(
            "binary row starts with 0x{marker:02X}, expected 0x00"
        )));
    }

    let bitmap = reader
        .read_bytes(null_bitmap_len(columns.len()))
        .ok_or(Error::Truncated("binary row null bitmap"))?
        .to_vec();

    let mut values = Vec::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(
                decode_binary_value(&mut reader, col)
                    .ok_or(Error::Truncated("binary row value"))?,
            );
        }
    }

    Ok(Row::new(Arc::clone(info), values))
}

/// Encode a binary-protocol row payload from values.
pub fn encode_binary_row(values: &[Value]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);

    let mut bitmap = vec![0u8; null_bitmap_len(values.len())];
    for (i, value) in values.iter().enumerate() {
        if value.is_null() {
            let bit = i + 2;
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }
    w.write_bytes(&bitmap);

    for value in values {
        encode_binary_value(&mut w, value);
    }
    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::column_flags;
    use crate::value::{Date, DateTime, TimeDelta};

    fn sample_col(name: &str, column_type: FieldType, flags: u16, cs: u16) -> ColumnDef {
        ColumnDef {
            catalog: "def".to_string(),
            schema: "testdb".to_string(),
            table: "t".to_string(),
            org_table: "t".to_string(),
            name: name.to_string(),
            org_name: name.to_string(),
            charset: cs,
            column_length: 21,
            column_type,
            flags,
            decimals: 0,
        }
    }

    #[test]
    fn test_column_def_roundtrip() {
        let col = sample_col(
            "id",
            FieldType::Long,
            column_flags::NOT_NULL | column_flags::PRIMARY_KEY | column_flags::UNSIGNED,
            63,
        );
        let payload = encode_column_def(&col);
        let parsed = parse_column_def(&payload).unwrap();

        assert_eq!(parsed.catalog, "def");
        assert_eq!(parsed.schema, "testdb");
        assert_eq!(parsed.name, "id");
        assert_eq!(parsed.org_name, "id");
        assert_eq!(parsed.charset, 63);
        assert_eq!(parsed.column_length, 21);
        assert_eq!(parsed.column_type, FieldType::Long);
        assert_eq!(parsed.flags, col.flags);
        assert_eq!(parsed.decimals, 0);
        assert!(parsed.is_unsigned());
    }

    #[test]
    fn test_truncated_column_def() {
        let col = sample_col("id", FieldType::Long, 0, 63);
        let payload = encode_column_def(&col);
        assert!(matches!(
            parse_column_def(&payload[..payload.len() / 2]),
            Err(Error::Truncated(_))
        ));
    }

    #[test]
    fn test_text_row_with_null() {
        let columns = vec![
            sample_col("a", FieldType::Long, 0, 63),
            sample_col("b", FieldType::VarString, 0, 45),
        ];
        let info = column_info(&columns);

        // Row: 42, NULL
        let mut payload = vec![0x02, b'4', b'2'];
        payload.push(0xFB);

        let row = parse_text_row(&payload, &columns, &info).unwrap();
        assert_eq!(row.get(0), Some(&Value::Int(42)));
        assert_eq!(row.get(1), Some(&Value::Null));
        assert_eq!(row.get_by_name("a"), Some(&Value::Int(42)));
    }

    #[test]
    fn test_null_bitmap_len() {
        // ceil((n + 2) / 8)
        assert_eq!(null_bitmap_len(1), 1);
        assert_eq!(null_bitmap_len(6), 1);
        assert_eq!(null_bitmap_len(7), 2);
        assert_eq!(null_bitmap_len(14), 2);
        assert_eq!(null_bitmap_len(15), 3);
    }

    #[test]
    fn test_binary_row_roundtrip() {
        let columns = vec![
            sample_col("i", FieldType::LongLong, 0, 63),
            sample_col("u", FieldType::LongLong, column_flags::UNSIGNED, 63),
            sample_col("n", FieldType::VarString, 0, 45),
            sample_col("s", FieldType::VarString, 0, 45),
            sample_col("d", FieldType::Date, 0, 63),
            sample_col("t", FieldType::Time, 0, 63),
            sample_col("dt", FieldType::DateTime, 0, 63),
        ];
        let info = column_info(&columns);
        let values = vec![
            Value::Int(-7),
            Value::UInt(7),
            Value::Null,
            Value::Text("hi".to_string()),
            Value::Date(Date {
                year: 2024,
                month: 3,
                day: 1,
            }),
            Value::Time(TimeDelta {
                negative: false,
                days: 0,
                hours: 23,
                minutes: 59,
                seconds: 59,
                micros: 0,
            }),
            Value::DateTime(DateTime {
                year: 1999,
                month: 12,
                day: 31,
                hour: 23,
                minute: 59,
                second: 59,
                micros: 999_999,
            }),
        ];

        let payload = encode_binary_row(&values);
        let row = parse_binary_row(&payload, &columns, &info).unwrap();
        assert_eq!(row.into_values(), values);
    }

    #[test]
    fn test_binary_row_bad_marker() {
        let columns = vec![sample_col("a", FieldType::Long, 0, 63)];
        let info = column_info(&columns);
        let err = parse_binary_row(&[0x01, 0x00], &columns, &info).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_binary_row_truncated_value() {
        let columns = vec![sample_col("a", FieldType::LongLong, 0, 63)];
        let info = column_info(&columns);
        // Marker + bitmap, but only 2 of the 8 value bytes
        let payload = vec![0x00, 0x00, 0x01, 0x02];
        assert!(matches!(
            parse_binary_row(&payload, &columns, &info),
            Err(Error::Truncated(_))
        ));
    }
}
