//! Character set registry.
//!
//! MySQL identifies collations by a numeric id exchanged in the handshake and
//! in every column definition. The registry maps the ids this client can
//! negotiate to their names and back, and answers the one question the row
//! decoders ask: is this column's charset the binary pseudo-charset?

/// A known character set / collation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    /// Collation id as used on the wire
    pub id: u16,
    /// Charset name as used in `SET NAMES`
    pub name: &'static str,
}

/// The binary pseudo-charset id. Columns carrying it decode to raw bytes.
pub const BINARY_ID: u16 = 63;

/// Default charset for new connections.
pub const DEFAULT: Charset = UTF8MB4;

pub const LATIN1: Charset = Charset {
    id: 8,
    name: "latin1",
};
pub const UTF8: Charset = Charset {
    id: 33,
    name: "utf8",
};
pub const BINARY: Charset = Charset {
    id: 63,
    name: "binary",
};
pub const UTF8MB4: Charset = Charset {
    id: 45,
    name: "utf8mb4",
};
pub const ASCII: Charset = Charset {
    id: 11,
    name: "ascii",
};

const REGISTRY: &[Charset] = &[LATIN1, ASCII, UTF8, BINARY, UTF8MB4];

/// Look up a charset by name, as given in connection options.
pub fn by_name(name: &str) -> Option<Charset> {
    REGISTRY
        .iter()
        .find(|cs| cs.name.eq_ignore_ascii_case(name))
        .copied()
}

/// Look up a charset by collation id.
///
/// Collation ids above 255 (e.g. utf8mb4_0900_ai_ci = 255, and the 0900
/// family beyond) all belong to utf8mb4; MySQL only transmits the low byte in
/// the v10 handshake, so the id-to-charset mapping folds them together.
pub fn by_id(id: u16) -> Option<Charset> {
    match id {
        8 => Some(LATIN1),
        11 => Some(ASCII),
        33 => Some(UTF8),
        63 => Some(BINARY),
        45 | 46 | 224..=247 | 255..=323 => Some(UTF8MB4),
        _ => None,
    }
}

/// Whether a column collation id means "raw bytes, not text".
pub const fn is_binary(id: u16) -> bool {
    id == BINARY_ID
}
