//! Prepared statement (binary protocol) packets.
//!
//! Protocol flow:
//!
//! 1. **Prepare**: COM_STMT_PREPARE with the SQL. The server answers with a
//!    statement id plus parameter and column counts, then the parameter and
//!    column definitions.
//! 2. **Execute**: COM_STMT_EXECUTE with the statement id and binary-encoded
//!    parameters. The result set comes back in the binary protocol.
//! 3. **Close**: COM_STMT_CLOSE. Fire-and-forget, no response.
//!
//! Values too large for a comfortable execute packet are streamed ahead of
//! time with COM_STMT_SEND_LONG_DATA (also no response); COM_STMT_RESET
//! clears any accumulated long data.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{Command, PacketWriter, writer};
use crate::types::{ColumnDef, value_is_unsigned, value_to_field_type};
use crate::value::Value;

/// Parameters at least this large are streamed via COM_STMT_SEND_LONG_DATA.
pub const LONG_DATA_THRESHOLD: usize = 4 * 1024 * 1024;

/// Cursor type flags for COM_STMT_EXECUTE.
pub mod cursor_type {
    pub const NO_CURSOR: u8 = 0x00;
    pub const READ_ONLY: u8 = 0x01;
}

/// Response header of COM_STMT_PREPARE.
#[derive(Debug, Clone, Copy)]
pub struct StmtPrepareOk {
    /// Server-assigned statement id
    pub statement_id: u32,
    /// Number of result columns (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of `?` placeholders
    pub num_params: u16,
    /// Warnings generated during prepare
    pub warnings: u16,
}

/// A prepared statement with its metadata.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-assigned statement id
    pub statement_id: u32,
    /// The SQL text, kept for diagnostics
    pub sql: String,
    /// Parameter definitions
    pub params: Vec<ColumnDef>,
    /// Result column definitions
    pub columns: Vec<ColumnDef>,
}

impl PreparedStatement {
    pub fn new(
        statement_id: u32,
        sql: String,
        params: Vec<ColumnDef>,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            statement_id,
            sql,
            params,
            columns,
        }
    }

    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// Build a COM_STMT_PREPARE packet.
pub fn build_stmt_prepare_packet(sql: &str, sequence_id: u8) -> Vec<u8> {
    writer::build_command_packet(Command::StmtPrepare as u8, sql.as_bytes(), sequence_id)
}

/// Parse a COM_STMT_PREPARE_OK response header.
///
/// Format: 0x00, statement_id (u32), num_columns (u16), num_params (u16),
/// reserved byte, warning_count (u16).
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Option<StmtPrepareOk> {
    if data.len() < 12 || data[0] != 0x00 {
        return None;
    }

    Some(StmtPrepareOk {
        statement_id: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
        num_columns: u16::from_le_bytes([data[5], data[6]]),
        num_params: u16::from_le_bytes([data[7], data[8]]),
        warnings: u16::from_le_bytes([data[10], data[11]]),
    })
}

/// Which parameters should be streamed as long data before execute.
///
/// Returns `(param_index, bytes)` pairs for text/blob values at or past the
/// threshold.
pub fn long_data_params(params: &[Value]) -> Vec<(u16, &[u8])> {
    params
        .iter()
        .enumerate()
        .filter_map(|(i, v)| match v {
            Value::Bytes(b) if b.len() >= LONG_DATA_THRESHOLD => Some((i as u16, b.as_slice())),
            Value::Text(s) if s.len() >= LONG_DATA_THRESHOLD => Some((i as u16, s.as_bytes())),
            _ => None,
        })
        .collect()
}

/// Build a COM_STMT_SEND_LONG_DATA packet for one chunk of one parameter.
///
/// No response follows; chunks accumulate server-side until execute.
pub fn build_stmt_send_long_data_packet(
    statement_id: u32,
    param_index: u16,
    chunk: &[u8],
    sequence_id: u8,
) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(7 + chunk.len());
    w.write_u8(Command::StmtSendLongData as u8);
    w.write_u32_le(statement_id);
    w.write_u16_le(param_index);
    w.write_bytes(chunk);
    w.build_packet(sequence_id)
}

/// Build a COM_STMT_EXECUTE packet.
///
/// Layout: command, statement_id (u32), cursor flags (u8), iteration count
/// (u32, always 1); when there are parameters: null bitmap (ceil(n/8)),
/// new-params-bound flag, per-parameter `{type, flags}` pairs, then the
/// non-NULL values. Parameters listed in `long_data_sent` were streamed with
/// COM_STMT_SEND_LONG_DATA and get a type entry but no inline value.
pub fn build_stmt_execute_packet(
    statement_id: u32,
    params: &[Value],
    cursor_flags: u8,
    long_data_sent: &[bool],
    sequence_id: u8,
) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(64 + params.len() * 16);

    w.write_u8(Command::StmtExecute as u8);
    w.write_u32_le(statement_id);
    w.write_u8(cursor_flags);
    w.write_u32_le(1);

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, param) in params.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        w.write_bytes(&null_bitmap);

        // new_params_bound_flag: 1 = type array follows
        w.write_u8(1);

        for param in params {
            w.write_u8(value_to_field_type(param) as u8);
            w.write_u8(if value_is_unsigned(param) { 0x80 } else { 0x00 });
        }

        for (i, param) in params.iter().enumerate() {
            if param.is_null() || long_data_sent.get(i).copied().unwrap_or(false) {
                continue;
            }
            crate::types::encode_binary_value(&mut w, param);
        }
    }

    w.build_packet(sequence_id)
}

/// Build a COM_STMT_FETCH packet for a server-side cursor.
pub fn build_stmt_fetch_packet(statement_id: u32, num_rows: u32, sequence_id: u8) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(9);
    w.write_u8(Command::StmtFetch as u8);
    w.write_u32_le(statement_id);
    w.write_u32_le(num_rows);
    w.build_packet(sequence_id)
}

/// Build a COM_STMT_CLOSE packet. The server does not respond.
pub fn build_stmt_close_packet(statement_id: u32, sequence_id: u8) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(5);
    w.write_u8(Command::StmtClose as u8);
    w.write_u32_le(statement_id);
    w.build_packet(sequence_id)
}

/// Build a COM_STMT_RESET packet, clearing accumulated long data.
pub fn build_stmt_reset_packet(statement_id: u32, sequence_id: u8) -> Vec<u8> {
    let mut w = PacketWriter::with_capacity(5);
    w.write_u8(Command::StmtReset as u8);
    w.write_u32_le(statement_id);
    w.build_packet(sequence_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    #[test]
    fn test_build_stmt_prepare_packet() {
        let packet = build_stmt_prepare_packet("SELECT ? + ?", 0);
        assert_eq!(packet[3], 0);
        assert_eq!(packet[4], Command::StmtPrepare as u8);
        assert_eq!(&packet[5..], b"SELECT ? + ?");
    }

    #[test]
    fn test_parse_stmt_prepare_ok() {
        let data = [
            0x00, // status
            0x01, 0x00, 0x00, 0x00, // statement_id = 1
            0x03, 0x00, // num_columns = 3
            0x02, 0x00, // num_params = 2
            0x00, // reserved
            0x01, 0x00, // warnings = 1
        ];
        let ok = parse_stmt_prepare_ok(&data).unwrap();
        assert_eq!(ok.statement_id, 1);
        assert_eq!(ok.num_columns, 3);
        assert_eq!(ok.num_params, 2);
        assert_eq!(ok.warnings, 1);
    }

    #[test]
    fn test_parse_stmt_prepare_ok_invalid() {
        assert!(parse_stmt_prepare_ok(&[0x00, 0x01]).is_none());

        let mut data = [0u8; 12];
        data[0] = 0xFF;
        assert!(parse_stmt_prepare_ok(&data).is_none());
    }

    #[test]
    fn test_build_stmt_execute_no_params() {
        let packet = build_stmt_execute_packet(1, &[], cursor_type::NO_CURSOR, &[], 0);

        assert_eq!(packet[4], Command::StmtExecute as u8);
        assert_eq!(
            u32::from_le_bytes([packet[5], packet[6], packet[7], packet[8]]),
            1
        );
        assert_eq!(packet[9], 0x00);
        assert_eq!(
            u32::from_le_bytes([packet[10], packet[11], packet[12], packet[13]]),
            1
        );
        assert_eq!(packet.len(), 14);
    }

    #[test]
    fn test_build_stmt_execute_with_params() {
        let params = vec![Value::Int(42), Value::Text("hello".to_string())];
        let packet = build_stmt_execute_packet(1, &params, cursor_type::NO_CURSOR, &[], 0);

        // Null bitmap (1 byte, no NULLs), then new-params-bound flag
        assert_eq!(packet[14], 0x00);
        assert_eq!(packet[15], 0x01);

        // Types: LONGLONG signed, VAR_STRING
        assert_eq!(packet[16], FieldType::LongLong as u8);
        assert_eq!(packet[17], 0x00);
        assert_eq!(packet[18], FieldType::VarString as u8);
        assert_eq!(packet[19], 0x00);

        // Values: 42 as 8 bytes, then lenenc "hello"
        assert_eq!(
            u64::from_le_bytes(packet[20..28].try_into().unwrap()),
            42
        );
        assert_eq!(packet[28], 5);
        assert_eq!(&packet[29..], b"hello");
    }

    #[test]
    fn test_build_stmt_execute_null_bitmap_and_unsigned() {
        let params = vec![Value::Null, Value::UInt(7)];
        let packet = build_stmt_execute_packet(1, &params, cursor_type::NO_CURSOR, &[], 0);

        // Bit 0 set for the NULL param
        assert_eq!(packet[14], 0x01);
        // Unsigned flag on the second param's type entry
        assert_eq!(packet[18], FieldType::LongLong as u8);
        assert_eq!(packet[19], 0x80);
    }

    #[test]
    fn test_long_data_selection() {
        let big = vec![0u8; LONG_DATA_THRESHOLD];
        let params = vec![
            Value::Int(1),
            Value::Bytes(big.clone()),
            Value::Text("small".to_string()),
        ];
        let long = long_data_params(&params);
        assert_eq!(long.len(), 1);
        assert_eq!(long[0].0, 1);
        assert_eq!(long[0].1.len(), big.len());
    }

    #[test]
    fn test_execute_skips_long_data_values() {
        let params = vec![Value::Int(1), Value::Text("streamed".to_string())];
        let packet =
            build_stmt_execute_packet(9, &params, cursor_type::NO_CURSOR, &[false, true], 0);

        // Values section holds only the 8-byte integer; the text value was
        // declared in the type array but its bytes were sent as long data.
        let values_start = 14 /* header */ + 1 /* bitmap */ + 1 /* bound flag */ + 4 /* types */;
        assert_eq!(packet.len(), values_start + 8);
    }

    #[test]
    fn test_build_stmt_send_long_data_packet() {
        let packet = build_stmt_send_long_data_packet(3, 1, b"chunk", 0);
        assert_eq!(packet[4], Command::StmtSendLongData as u8);
        assert_eq!(
            u32::from_le_bytes([packet[5], packet[6], packet[7], packet[8]]),
            3
        );
        assert_eq!(u16::from_le_bytes([packet[9], packet[10]]), 1);
        assert_eq!(&packet[11..], b"chunk");
    }

    #[test]
    fn test_build_stmt_close_packet() {
        let packet = build_stmt_close_packet(42, 0);
        assert_eq!(packet.len(), 9);
        assert_eq!(packet[4], Command::StmtClose as u8);
        assert_eq!(
            u32::from_le_bytes([packet[5], packet[6], packet[7], packet[8]]),
            42
        );
    }

    #[test]
    fn test_build_stmt_fetch_packet() {
        let packet = build_stmt_fetch_packet(7, 100, 0);
        assert_eq!(packet[4], Command::StmtFetch as u8);
        assert_eq!(
            u32::from_le_bytes([packet[5], packet[6], packet[7], packet[8]]),
            7
        );
        assert_eq!(
            u32::from_le_bytes([packet[9], packet[10], packet[11], packet[12]]),
            100
        );
    }
}
