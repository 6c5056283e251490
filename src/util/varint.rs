//! Variable-length integer encoding utilities.
//!
//! This module provides efficient variable-length integer encoding and decoding,
//! similar to what's used in protocol buffers and other binary formats. The
//! index and data file bodies use these for counts, file offsets, and field
//! numbers.

use byteorder::ReadBytesExt;
use std::io::{Read, Write};

use crate::error::{Result, YariError};

/// Encode a u32 value using variable-length encoding.
///
/// Uses 7 bits per byte with a continuation bit, allowing efficient
/// encoding of small numbers.
pub fn encode_u32(value: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Write a variable-length encoded u32 to a writer.
pub fn write_u32<W: Write + ?Sized>(writer: &mut W, value: u32) -> Result<usize> {
    let bytes = encode_u32(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u32 from a reader.
pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32> {
    let mut result = 0u32;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 32 {
            return Err(YariError::corruption("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u32) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write + ?Sized>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 64 {
            return Err(YariError::corruption("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_write_read_u32() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u32::MAX];

        for &value in &test_values {
            let mut buffer = Vec::new();
            let bytes_written = write_u32(&mut buffer, value).unwrap();
            assert_eq!(bytes_written, buffer.len());

            let mut cursor = Cursor::new(buffer);
            let decoded = read_u32(&mut cursor).unwrap();

            assert_eq!(value, decoded);
        }
    }

    #[test]
    fn test_write_read_u64() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX];

        for &value in &test_values {
            let mut buffer = Vec::new();
            let bytes_written = write_u64(&mut buffer, value).unwrap();
            assert_eq!(bytes_written, buffer.len());

            let mut cursor = Cursor::new(buffer);
            let decoded = read_u64(&mut cursor).unwrap();

            assert_eq!(value, decoded);
        }
    }

    #[test]
    fn test_encoding_efficiency() {
        // Small values should use fewer bytes
        assert_eq!(encode_u32(0).len(), 1);
        assert_eq!(encode_u32(127).len(), 1);
        assert_eq!(encode_u32(128).len(), 2);
        assert_eq!(encode_u32(16383).len(), 2);
        assert_eq!(encode_u32(16384).len(), 3);

        // Large values should use more bytes
        assert!(encode_u32(u32::MAX).len() <= 5);
        assert!(encode_u64(u64::MAX).len() <= 10);
    }

    #[test]
    fn test_incomplete_varint() {
        // Continuation bit set but no more data
        let mut cursor = Cursor::new(vec![0x80]);
        assert!(read_u32(&mut cursor).is_err());

        let mut cursor = Cursor::new(vec![0x80]);
        assert!(read_u64(&mut cursor).is_err());
    }

    #[test]
    fn test_overflow() {
        // Too many continuation bytes for a u32
        let mut cursor = Cursor::new(vec![0xFF; 10]);
        let result = read_u32(&mut cursor);
        assert!(result.is_err());
    }
}
