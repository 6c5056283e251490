//! Binary codec framing: headers, checksum trailers, and verification.
//!
//! Every per-segment artifact starts with a header (magic, codec name, format
//! version, segment identity, segment suffix) and ends with a footer carrying
//! a CRC32 checksum of the entire stream before it. Readers verify the footer
//! before trusting any content, so silent corruption is detected on open.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Result, YariError};
use crate::storage::Storage;
use crate::util::varint;

/// Magic value identifying a Yari codec stream.
pub const CODEC_MAGIC: u32 = 0x3FD7_6C17;

/// Magic value opening the checksum footer.
pub const FOOTER_MAGIC: u32 = !CODEC_MAGIC;

/// Length of a segment identity token in bytes.
pub const SEGMENT_ID_LEN: usize = 16;

/// Total footer length: footer magic, algorithm id, checksum.
pub const FOOTER_LEN: u64 = 12;

/// An output wrapper that counts bytes and accumulates a CRC32 checksum over
/// everything written through it.
///
/// All writes for one artifact go through a single `ChecksumOutput` so the
/// footer checksum covers the full stream, header included.
#[derive(Debug)]
pub struct ChecksumOutput<W: Write> {
    writer: W,
    hasher: crc32fast::Hasher,
    position: u64,
}

impl<W: Write> ChecksumOutput<W> {
    /// Create a new checksummed output.
    pub fn new(writer: W) -> Self {
        ChecksumOutput {
            writer,
            hasher: crc32fast::Hasher::new(),
            position: 0,
        }
    }

    /// Current position in the stream (bytes written so far).
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Checksum of everything written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_raw(&[value])
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write a variable-length encoded u32.
    pub fn write_vu32(&mut self, value: u32) -> Result<()> {
        let encoded = varint::encode_u32(value);
        self.write_raw(&encoded)
    }

    /// Write a variable-length encoded u64.
    pub fn write_vu64(&mut self, value: u64) -> Result<()> {
        let encoded = varint::encode_u64(value);
        self.write_raw(&encoded)
    }

    /// Write a string with a varint length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let bytes = value.as_bytes();
        self.write_vu32(bytes.len() as u32)?;
        self.write_raw(bytes)
    }

    /// Write raw bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Write the checksum footer and return the inner writer.
    ///
    /// The checksum covers every byte before it, including the footer magic
    /// and algorithm id. This is the last write on the stream.
    pub fn finish(mut self) -> Result<W> {
        self.write_u32(FOOTER_MAGIC)?;
        self.write_u32(0)?; // checksum algorithm id, only CRC32 is defined
        let checksum = self.hasher.clone().finalize();
        self.writer.write_all(&checksum.to_le_bytes())?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Write a codec header: magic, codec name, version, segment id, suffix.
pub fn write_header<W: Write>(
    out: &mut ChecksumOutput<W>,
    codec_name: &str,
    version: u32,
    segment_id: &[u8; SEGMENT_ID_LEN],
    segment_suffix: &str,
) -> Result<()> {
    out.write_u32(CODEC_MAGIC)?;
    out.write_string(codec_name)?;
    out.write_u32(version)?;
    out.write_raw(segment_id)?;
    out.write_string(segment_suffix)?;
    Ok(())
}

/// Read a varint-length-prefixed string.
pub fn read_string<R: Read + ?Sized>(input: &mut R) -> Result<String> {
    let len = varint::read_u32(input)? as usize;
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| YariError::corruption(format!("invalid string: {e}")))
}

/// Check a codec header and return the format version it declares.
///
/// Magic, codec-name, and version problems surface as [`YariError::Format`]
/// since they may indicate a legitimately different format; a wrong segment
/// id or suffix on an otherwise well-formed header means the file belongs to
/// another segment and surfaces as [`YariError::Corruption`].
pub fn check_header<R: Read + ?Sized>(
    input: &mut R,
    codec_name: &str,
    min_version: u32,
    max_version: u32,
    segment_id: &[u8; SEGMENT_ID_LEN],
    segment_suffix: &str,
) -> Result<u32> {
    let magic = input.read_u32::<LittleEndian>()?;
    if magic != CODEC_MAGIC {
        return Err(YariError::format(format!(
            "codec magic mismatch: expected {CODEC_MAGIC:#x}, found {magic:#x}"
        )));
    }

    let actual_name = read_string(input)?;
    if actual_name != codec_name {
        return Err(YariError::format(format!(
            "codec name mismatch: expected \"{codec_name}\", found \"{actual_name}\""
        )));
    }

    let version = input.read_u32::<LittleEndian>()?;
    if version < min_version || version > max_version {
        return Err(YariError::format(format!(
            "unsupported version {version} for codec \"{codec_name}\": \
             supported range is [{min_version}..{max_version}]"
        )));
    }

    let mut actual_id = [0u8; SEGMENT_ID_LEN];
    input.read_exact(&mut actual_id)?;
    if &actual_id != segment_id {
        return Err(YariError::corruption(format!(
            "segment id mismatch: expected {segment_id:02x?}, found {actual_id:02x?}"
        )));
    }

    let actual_suffix = read_string(input)?;
    if actual_suffix != segment_suffix {
        return Err(YariError::corruption(format!(
            "segment suffix mismatch: expected \"{segment_suffix}\", found \"{actual_suffix}\""
        )));
    }

    Ok(version)
}

/// Verify the checksum trailer of an entire file.
///
/// Recomputes CRC32 over every byte before the stored checksum word and
/// compares. Any mismatch, truncation, or malformed footer is reported as
/// [`YariError::Corruption`].
pub fn verify_file_checksum(storage: &dyn Storage, name: &str) -> Result<()> {
    let mut input = storage.open_input(name)?;
    let size = input.size()?;
    if size < FOOTER_LEN {
        return Err(YariError::corruption(format!(
            "file \"{name}\" is too short to hold a footer: {size} bytes"
        )));
    }

    let mut content = Vec::with_capacity(size as usize);
    input.read_to_end(&mut content)?;
    if content.len() as u64 != size {
        return Err(YariError::corruption(format!(
            "file \"{name}\" shorter than reported size"
        )));
    }

    let footer_start = content.len() - FOOTER_LEN as usize;
    let footer = &content[footer_start..];

    let magic = u32::from_le_bytes(footer[0..4].try_into().unwrap());
    if magic != FOOTER_MAGIC {
        return Err(YariError::corruption(format!(
            "footer magic mismatch in \"{name}\": expected {FOOTER_MAGIC:#x}, found {magic:#x}"
        )));
    }

    let algorithm = u32::from_le_bytes(footer[4..8].try_into().unwrap());
    if algorithm != 0 {
        return Err(YariError::corruption(format!(
            "unknown checksum algorithm {algorithm} in \"{name}\""
        )));
    }

    let stored = u32::from_le_bytes(footer[8..12].try_into().unwrap());
    let actual = crc32fast::hash(&content[..content.len() - 4]);
    if stored != actual {
        return Err(YariError::corruption(format!(
            "checksum failed on \"{name}\": stored {stored:#x}, computed {actual:#x}"
        )));
    }

    Ok(())
}
