//! Record framing for the relay's on-disk log.
//!
//! Each record is framed as:
//! ```text
//! [version: 1 byte][length: 4 bytes LE][payload: N bytes JSON][crc32: 4 bytes LE]
//! ```
//! and every file starts with a 5-byte header (`MAGIC` + version).

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current record format version.
const FORMAT_VERSION: u8 = 1;

/// Magic bytes identifying relay log files.
pub const MAGIC: [u8; 4] = *b"TKRL";

/// Size of the file header in bytes.
pub const HEADER_LEN: u64 = 5;

/// Records larger than this are treated as corruption rather than allocated.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

fn invalid(msg: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, msg)
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Frames `value` into a byte buffer ready to append.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload = serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    if payload.len() > MAX_PAYLOAD {
        return Err(invalid(format!(
            "record of {} bytes exceeds maximum {MAX_PAYLOAD}",
            payload.len()
        )));
    }
    let len = u32::try_from(payload.len()).map_err(|_| invalid("record length overflow".to_string()))?;

    let mut out = Vec::with_capacity(payload.len() + 9);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(out)
}

/// Reads one framed record.
///
/// # Errors
/// - `UnexpectedEof` if the stream ends inside a record (torn write)
/// - `InvalidData` on version mismatch, oversized length, or checksum failure
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut prefix = [0u8; 5];
    reader.read_exact(&mut prefix)?;

    if prefix[0] != FORMAT_VERSION {
        return Err(invalid(format!(
            "unsupported record version {} (expected {FORMAT_VERSION})",
            prefix[0]
        )));
    }

    let len = u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(invalid(format!("record length {len} exceeds maximum {MAX_PAYLOAD}")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut crc = [0u8; 4];
    reader.read_exact(&mut crc)?;
    let stored = u32::from_le_bytes(crc);
    let computed = checksum(&payload);
    if stored != computed {
        return Err(invalid(format!(
            "checksum mismatch: stored={stored:08x} computed={computed:08x}"
        )));
    }

    serde_json::from_slice(&payload).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

/// Writes the file header.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[FORMAT_VERSION])
}

/// Reads and validates the file header, returning its version byte.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(invalid(format!("not a relay log (magic {:?})", &header[..4])));
    }
    Ok(header[4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn decodes_what_it_encodes() {
        let encoded = encode(&vec![1u64, 2, 3]).unwrap();
        let decoded: Vec<u64> = decode(&mut Cursor::new(encoded)).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn flipped_payload_byte_is_detected() {
        let mut encoded = encode(&"offset for t1".to_string()).unwrap();
        encoded[7] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn torn_record_reports_eof() {
        let encoded = encode(&"complete record".to_string()).unwrap();
        let torn = &encoded[..encoded.len() - 3];
        let err = decode::<String>(&mut Cursor::new(torn)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_length_is_rejected_without_allocating() {
        let mut bad = vec![FORMAT_VERSION];
        bad.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = decode::<String>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn header_checks_magic() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(read_header(&mut Cursor::new(&buf)).unwrap(), FORMAT_VERSION);

        buf[0] = b'X';
        assert!(read_header(&mut Cursor::new(&buf)).is_err());
    }
}
