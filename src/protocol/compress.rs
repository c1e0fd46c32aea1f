//! Compressed protocol framing.
//!
//! When `CLIENT_COMPRESS` (zlib) or `CLIENT_ZSTD_COMPRESSION_ALGORITHM` is
//! negotiated, every group of ordinary packets travels inside a compressed
//! frame with its own 7-byte header:
//!
//! ```text
//! 3 bytes  compressed payload length (little-endian)
//! 1 byte   compressed sequence id
//! 3 bytes  uncompressed payload length; 0 means stored uncompressed
//! ```
//!
//! Tiny payloads are stored as-is: compressing them would grow them, so the
//! header's uncompressed length is set to zero and the receiver passes the
//! body through. The ordinary packet framer never sees any of this; the
//! transport decompresses frames into a byte stream the framer reads from.

use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Compressed frame header size in bytes.
pub const COMPRESSED_HEADER_SIZE: usize = 7;

/// Payloads at or below this size are stored uncompressed.
pub const MIN_COMPRESS_LENGTH: usize = 50;

/// Negotiated compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Zlib,
    Zstd { level: i32 },
}

/// Header of one compressed frame.
#[derive(Debug, Clone, Copy)]
pub struct CompressedHeader {
    /// Length of the (possibly compressed) body that follows
    pub compressed_length: u32,
    /// Compressed-protocol sequence id
    pub sequence_id: u8,
    /// Original payload length; 0 when the body is stored uncompressed
    pub uncompressed_length: u32,
}

impl CompressedHeader {
    pub fn from_bytes(bytes: &[u8; COMPRESSED_HEADER_SIZE]) -> Self {
        let compressed_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        let uncompressed_length =
            u32::from(bytes[4]) | (u32::from(bytes[5]) << 8) | (u32::from(bytes[6]) << 16);
        Self {
            compressed_length,
            sequence_id: bytes[3],
            uncompressed_length,
        }
    }

    pub fn to_bytes(&self) -> [u8; COMPRESSED_HEADER_SIZE] {
        [
            (self.compressed_length & 0xFF) as u8,
            ((self.compressed_length >> 8) & 0xFF) as u8,
            ((self.compressed_length >> 16) & 0xFF) as u8,
            self.sequence_id,
            (self.uncompressed_length & 0xFF) as u8,
            ((self.uncompressed_length >> 8) & 0xFF) as u8,
            ((self.uncompressed_length >> 16) & 0xFF) as u8,
        ]
    }
}

/// Wrap a run of framed packets into a single compressed frame.
#[allow(clippy::cast_possible_truncation)]
pub fn build_frame(codec: Codec, payload: &[u8], sequence_id: u8) -> Result<Vec<u8>> {
    let (body, uncompressed_length) = if payload.len() <= MIN_COMPRESS_LENGTH {
        (payload.to_vec(), 0)
    } else {
        (compress(codec, payload)?, payload.len() as u32)
    };

    let header = CompressedHeader {
        compressed_length: body.len() as u32,
        sequence_id,
        uncompressed_length,
    };

    let mut frame = Vec::with_capacity(COMPRESSED_HEADER_SIZE + body.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Recover the packet bytes carried by one compressed frame body.
pub fn unwrap_frame(codec: Codec, header: &CompressedHeader, body: &[u8]) -> Result<Vec<u8>> {
    if header.uncompressed_length == 0 {
        return Ok(body.to_vec());
    }
    let payload = decompress(codec, body, header.uncompressed_length as usize)?;
    if payload.len() != header.uncompressed_length as usize {
        return Err(Error::protocol(format!(
            "compressed frame declared {} uncompressed bytes but produced {}",
            header.uncompressed_length,
            payload.len()
        )));
    }
    Ok(payload)
}

fn compress(codec: Codec, payload: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(payload)?;
            Ok(encoder.finish()?)
        }
        Codec::Zstd { level } => {
            zstd::bulk::compress(payload, level).map_err(Error::Io)
        }
    }
}

fn decompress(codec: Codec, body: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    match codec {
        Codec::Zlib => {
            let mut decoder = flate2::read::ZlibDecoder::new(body);
            let mut out = Vec::with_capacity(expected_len);
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        Codec::Zstd { .. } => {
            zstd::bulk::decompress(body, expected_len).map_err(Error::Io)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = CompressedHeader {
            compressed_length: 0x0004_5678,
            sequence_id: 9,
            uncompressed_length: 0x0012_3456,
        };
        let parsed = CompressedHeader::from_bytes(&header.to_bytes());
        assert_eq!(parsed.compressed_length, header.compressed_length);
        assert_eq!(parsed.sequence_id, 9);
        assert_eq!(parsed.uncompressed_length, header.uncompressed_length);
    }

    #[test]
    fn test_small_payload_stored_uncompressed() {
        let payload = b"SELECT 1";
        let frame = build_frame(Codec::Zlib, payload, 0).unwrap();

        let header =
            CompressedHeader::from_bytes(&frame[..COMPRESSED_HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.uncompressed_length, 0);
        assert_eq!(&frame[COMPRESSED_HEADER_SIZE..], payload);

        let recovered =
            unwrap_frame(Codec::Zlib, &header, &frame[COMPRESSED_HEADER_SIZE..]).unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn test_zlib_roundtrip() {
        let payload = vec![b'a'; 4096];
        let frame = build_frame(Codec::Zlib, &payload, 2).unwrap();

        let header =
            CompressedHeader::from_bytes(&frame[..COMPRESSED_HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.sequence_id, 2);
        assert_eq!(header.uncompressed_length as usize, payload.len());
        // Repetitive data must actually shrink
        assert!((header.compressed_length as usize) < payload.len());

        let recovered =
            unwrap_frame(Codec::Zlib, &header, &frame[COMPRESSED_HEADER_SIZE..]).unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn test_zstd_roundtrip() {
        let codec = Codec::Zstd { level: 3 };
        let payload = vec![b'z'; 4096];
        let frame = build_frame(codec, &payload, 0).unwrap();

        let header =
            CompressedHeader::from_bytes(&frame[..COMPRESSED_HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.uncompressed_length as usize, payload.len());

        let recovered = unwrap_frame(codec, &header, &frame[COMPRESSED_HEADER_SIZE..]).unwrap();
        assert_eq!(recovered, payload);
    }

    #[test]
    fn test_length_mismatch_is_protocol_error() {
        let payload = vec![b'a'; 1024];
        let frame = build_frame(Codec::Zlib, &payload, 0).unwrap();
        let mut header =
            CompressedHeader::from_bytes(&frame[..COMPRESSED_HEADER_SIZE].try_into().unwrap());
        header.uncompressed_length += 1;

        let err = unwrap_frame(Codec::Zlib, &header, &frame[COMPRESSED_HEADER_SIZE..]).unwrap_err();
        assert!(err.is_fatal());
    }
}
