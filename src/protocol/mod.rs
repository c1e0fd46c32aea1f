//! MySQL wire protocol implementation.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum packet payload is 2^24 - 1. Larger payloads are split into
//! multiple packets, terminated by one shorter than the maximum (possibly
//! empty).

#[cfg(feature = "compress")]
pub mod compress;
pub mod prepared;
pub mod reader;
pub mod rows;
pub mod writer;

pub use reader::PacketReader;
pub use writer::PacketWriter;

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Maximum payload size for a single MySQL packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Client/server capability flags, exchanged during the handshake.
///
/// The negotiated set is the bitwise AND of what the client requests and the
/// server advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilityFlags(u32);

#[allow(dead_code)]
impl CapabilityFlags {
    pub const LONG_PASSWORD: Self = Self(1);
    pub const FOUND_ROWS: Self = Self(1 << 1);
    pub const LONG_FLAG: Self = Self(1 << 2);
    pub const CONNECT_WITH_DB: Self = Self(1 << 3);
    pub const NO_SCHEMA: Self = Self(1 << 4);
    pub const COMPRESS: Self = Self(1 << 5);
    pub const ODBC: Self = Self(1 << 6);
    pub const LOCAL_FILES: Self = Self(1 << 7);
    pub const IGNORE_SPACE: Self = Self(1 << 8);
    pub const PROTOCOL_41: Self = Self(1 << 9);
    pub const INTERACTIVE: Self = Self(1 << 10);
    pub const SSL: Self = Self(1 << 11);
    pub const IGNORE_SIGPIPE: Self = Self(1 << 12);
    pub const TRANSACTIONS: Self = Self(1 << 13);
    pub const RESERVED: Self = Self(1 << 14);
    pub const SECURE_CONNECTION: Self = Self(1 << 15);
    pub const MULTI_STATEMENTS: Self = Self(1 << 16);
    pub const MULTI_RESULTS: Self = Self(1 << 17);
    pub const PS_MULTI_RESULTS: Self = Self(1 << 18);
    pub const PLUGIN_AUTH: Self = Self(1 << 19);
    pub const CONNECT_ATTRS: Self = Self(1 << 20);
    pub const PLUGIN_AUTH_LENENC_CLIENT_DATA: Self = Self(1 << 21);
    pub const CAN_HANDLE_EXPIRED_PASSWORDS: Self = Self(1 << 22);
    pub const SESSION_TRACK: Self = Self(1 << 23);
    pub const DEPRECATE_EOF: Self = Self(1 << 24);
    pub const OPTIONAL_RESULTSET_METADATA: Self = Self(1 << 25);
    pub const ZSTD_COMPRESSION: Self = Self(1 << 26);
    pub const QUERY_ATTRIBUTES: Self = Self(1 << 27);

    /// Capabilities every connection requests.
    pub const DEFAULT_CLIENT: Self = Self(
        Self::PROTOCOL_41.0
            | Self::SECURE_CONNECTION.0
            | Self::LONG_PASSWORD.0
            | Self::LONG_FLAG.0
            | Self::TRANSACTIONS.0
            | Self::MULTI_STATEMENTS.0
            | Self::MULTI_RESULTS.0
            | Self::PS_MULTI_RESULTS.0
            | Self::PLUGIN_AUTH.0
            | Self::PLUGIN_AUTH_LENENC_CLIENT_DATA.0
            | Self::DEPRECATE_EOF.0,
    );

    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when every flag in `other` is present.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The low 16 bits, as laid out in the v10 handshake.
    pub const fn low_word(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// The high 16 bits.
    pub const fn high_word(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Reassemble from the two handshake halves.
    pub const fn from_words(low: u16, high: u16) -> Self {
        Self((low as u32) | ((high as u32) << 16))
    }
}

impl BitOr for CapabilityFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CapabilityFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for CapabilityFlags {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::LowerHex for CapabilityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// MySQL command codes (COM_xxx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Switch database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Kill a server thread
    ProcessKill = 0x0c,
    /// Ping server
    Ping = 0x0e,
    /// Prepare statement
    StmtPrepare = 0x16,
    /// Execute prepared statement
    StmtExecute = 0x17,
    /// Send long data for prepared statement
    StmtSendLongData = 0x18,
    /// Close prepared statement
    StmtClose = 0x19,
    /// Reset prepared statement
    StmtReset = 0x1a,
    /// Fetch rows from a server-side cursor
    StmtFetch = 0x1c,
    /// Reset connection state
    ResetConnection = 0x1f,
}

/// MySQL server status flags, carried in OK and EOF packets.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_QUERY_WAS_SLOW: u16 = 0x0800;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 2^24 - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00, or short 0xFE when EOF is deprecated)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE with payload < 9 bytes)
    Eof,
    /// LOCAL INFILE request (0xFB)
    LocalInfile,
    /// Data packet (result set row, column definition, etc.)
    Data,
}

impl PacketType {
    /// Detect packet type from the first byte of a payload.
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Human-readable info string
    pub info: String,
}

impl OkPacket {
    /// Whether another result set follows this one.
    pub const fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    /// Whether the statement opened a server-side cursor.
    pub const fn cursor_exists(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_CURSOR_EXISTS != 0
    }

    /// Encode to a payload (header byte 0x00 included).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut w = writer::PacketWriter::new();
        w.write_u8(0x00);
        w.write_lenenc_int(self.affected_rows);
        w.write_lenenc_int(self.last_insert_id);
        w.write_u16_le(self.status_flags);
        w.write_u16_le(self.warnings);
        w.write_bytes(self.info.as_bytes());
        w.into_bytes()
    }
}

/// Parsed ERR packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQLSTATE (5 characters, empty when the server omitted it)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

impl ErrPacket {
    /// Encode to a payload (header byte 0xFF included).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut w = writer::PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(self.error_code);
        if !self.sql_state.is_empty() {
            w.write_u8(b'#');
            w.write_fixed_string(&self.sql_state, 5);
        }
        w.write_bytes(self.error_message.as_bytes());
        w.into_bytes()
    }
}

/// Parsed EOF packet (legacy, absent when CLIENT_DEPRECATE_EOF is on).
#[derive(Debug, Clone, Copy, Default)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}

impl EofPacket {
    pub const fn more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    /// Encode to a payload (header byte 0xFE included).
    pub fn to_payload(&self) -> Vec<u8> {
        let mut w = writer::PacketWriter::new();
        w.write_u8(0xFE);
        w.write_u16_le(self.warnings);
        w.write_u16_le(self.status_flags);
        w.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_roundtrip() {
        let header = PacketHeader {
            payload_length: 0x0012_3456,
            sequence_id: 7,
        };
        let parsed = PacketHeader::from_bytes(&header.to_bytes());
        assert_eq!(header.payload_length, parsed.payload_length);
        assert_eq!(header.sequence_id, parsed.sequence_id);
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn test_packet_header_max_size() {
        let header = PacketHeader {
            payload_length: MAX_PACKET_SIZE as u32,
            sequence_id: 255,
        };
        assert_eq!(header.to_bytes(), [0xFF, 0xFF, 0xFF, 255]);
    }

    #[test]
    fn test_packet_type_detection() {
        assert_eq!(PacketType::from_first_byte(0x00, 10), PacketType::Ok);
        assert_eq!(PacketType::from_first_byte(0xFF, 10), PacketType::Error);
        assert_eq!(PacketType::from_first_byte(0xFE, 5), PacketType::Eof);
        assert_eq!(PacketType::from_first_byte(0xFE, 100), PacketType::Data);
        assert_eq!(
            PacketType::from_first_byte(0xFB, 10),
            PacketType::LocalInfile
        );
        assert_eq!(PacketType::from_first_byte(0x42, 10), PacketType::Data);
    }

    #[test]
    fn test_capability_words() {
        let caps = CapabilityFlags::DEFAULT_CLIENT | CapabilityFlags::SSL;
        let rebuilt = CapabilityFlags::from_words(caps.low_word(), caps.high_word());
        assert_eq!(caps, rebuilt);
        assert!(rebuilt.contains(CapabilityFlags::SSL));
        assert!(rebuilt.contains(CapabilityFlags::PROTOCOL_41));
    }

    #[test]
    fn test_capability_negotiation_is_intersection() {
        let client = CapabilityFlags::DEFAULT_CLIENT | CapabilityFlags::COMPRESS;
        let server = CapabilityFlags::PROTOCOL_41
            | CapabilityFlags::SECURE_CONNECTION
            | CapabilityFlags::PLUGIN_AUTH;
        let effective = client & server;
        assert!(effective.contains(CapabilityFlags::PROTOCOL_41));
        assert!(!effective.contains(CapabilityFlags::COMPRESS));
        assert!(!effective.contains(CapabilityFlags::DEPRECATE_EOF));
    }

    #[test]
    fn test_ok_packet_roundtrip() {
        let ok = OkPacket {
            affected_rows: 2,
            last_insert_id: 42,
            status_flags: server_status::SERVER_STATUS_AUTOCOMMIT,
            warnings: 1,
            info: "Records: 2".to_string(),
        };
        let payload = ok.to_payload();
        let mut reader = PacketReader::new(&payload);
        let parsed = reader.parse_ok_packet().unwrap();
        assert_eq!(parsed.affected_rows, 2);
        assert_eq!(parsed.last_insert_id, 42);
        assert_eq!(parsed.status_flags, ok.status_flags);
        assert_eq!(parsed.warnings, 1);
        assert_eq!(parsed.info, "Records: 2");
    }

    #[test]
    fn test_err_packet_roundtrip() {
        let err = ErrPacket {
            error_code: 1045,
            sql_state: "28000".to_string(),
            error_message: "Access denied".to_string(),
        };
        let payload = err.to_payload();
        let mut reader = PacketReader::new(&payload);
        let parsed = reader.parse_err_packet().unwrap();
        assert_eq!(parsed.error_code, 1045);
        assert_eq!(parsed.sql_state, "28000");
        assert_eq!(parsed.error_message, "Access denied");
    }

    #[test]
    fn test_eof_packet_roundtrip() {
        let eof = EofPacket {
            warnings: 3,
            status_flags: server_status::SERVER_MORE_RESULTS_EXISTS,
        };
        let payload = eof.to_payload();
        assert!(payload.len() < 9);
        let mut reader = PacketReader::new(&payload);
        let parsed = reader.parse_eof_packet().unwrap();
        assert_eq!(parsed.warnings, 3);
        assert!(parsed.more_results());
    }
}
