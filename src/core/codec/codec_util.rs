// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

//! Utility functions for reading and writing versioned headers.
//!
//! Writing codec headers is useful to ensure that a file is in
//! the format you think it is.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::core::store::{read_file, Directory, IOContext, IndexOutput};
use crate::error::ErrorKind::{CorruptIndex, IllegalArgument};
use crate::error::Result;

use std::io::Write;

/// Constant to identify the start of a codec header.
pub const CODEC_MAGIC: u32 = 0x3FD7_6C17;
/// Constant to identify the start of a codec footer.
pub const FOOTER_MAGIC: u32 = !CODEC_MAGIC;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Length of the footer: magic, algorithm id and the crc32 checksum.
pub const FOOTER_LENGTH: usize = 12;

/// Writes a codec header, which records both a string to identify the file and a version number.
///
/// CodecHeader --> Magic,CodecName,Version
/// * Magic --> u32. This identifies the start of the header. It is always `CODEC_MAGIC`.
/// * CodecName --> length prefixed ascii string
/// * Version --> u32. Records the version of the file.
pub fn write_header(out: &mut Vec<u8>, codec: &str, version: u32) -> Result<()> {
    let clen = codec.len();
    if clen >= 128 || !codec.is_ascii() {
        bail!(IllegalArgument(format!(
            "codec must be simple ASCII less than 128 characters, got {}[length={}]",
            codec, clen,
        )));
    }
    out.write_u32::<BigEndian>(CODEC_MAGIC)?;
    out.write_u8(clen as u8)?;
    out.write_all(codec.as_bytes())?;
    out.write_u32::<BigEndian>(version)?;
    Ok(())
}

/// Computes the length of a codec header.
pub fn header_length(codec: &str) -> usize {
    9 + codec.len()
}

/// Validates the header at the start of `bytes` and returns its version.
pub fn check_header(bytes: &[u8], codec: &str, min_version: u32, max_version: u32) -> Result<u32> {
    if bytes.len() < header_length(codec) {
        bail!(CorruptIndex(format!("truncated header, expected codec {}", codec)));
    }
    let magic = BigEndian::read_u32(&bytes[0..4]);
    if magic != CODEC_MAGIC {
        bail!(CorruptIndex(format!(
            "codec header mismatch: actual header={} vs expected header={}",
            magic, CODEC_MAGIC
        )));
    }
    let clen = bytes[4] as usize;
    if bytes.len() < 9 + clen {
        bail!(CorruptIndex(format!("truncated header, expected codec {}", codec)));
    }
    let actual = &bytes[5..5 + clen];
    if actual != codec.as_bytes() {
        bail!(CorruptIndex(format!(
            "codec mismatch: actual codec={} vs expected codec={}",
            String::from_utf8_lossy(actual),
            codec
        )));
    }
    let version = BigEndian::read_u32(&bytes[5 + clen..9 + clen]);
    if version < min_version || version > max_version {
        bail!(CorruptIndex(format!(
            "index format {} of {} not in [{}, {}]",
            version, codec, min_version, max_version
        )));
    }
    Ok(version)
}

/// Appends a codec footer, which records the checksum of every byte before it.
///
/// CodecFooter --> Magic,AlgorithmID,Checksum
/// * AlgorithmID --> u32, always 0 for zlib-crc32.
/// * Checksum --> u32 crc32 over all previous bytes, including Magic and AlgorithmID.
pub fn write_footer(out: &mut Vec<u8>) -> Result<()> {
    out.write_u32::<BigEndian>(FOOTER_MAGIC)?;
    out.write_u32::<BigEndian>(0)?;
    let checksum = CHECKSUM.checksum(&out[..]);
    out.write_u32::<BigEndian>(checksum)?;
    Ok(())
}

/// Validates the footer at the end of `bytes`.
pub fn check_footer(bytes: &[u8]) -> Result<()> {
    if bytes.len() < FOOTER_LENGTH {
        bail!(CorruptIndex("misplaced codec footer (file truncated?)".into()));
    }
    let footer = &bytes[bytes.len() - FOOTER_LENGTH..];
    let magic = BigEndian::read_u32(&footer[0..4]);
    if magic != FOOTER_MAGIC {
        bail!(CorruptIndex(format!(
            "codec footer mismatch: actual footer={} vs expected footer={}",
            magic, FOOTER_MAGIC
        )));
    }
    let algorithm_id = BigEndian::read_u32(&footer[4..8]);
    if algorithm_id != 0 {
        bail!(CorruptIndex(format!(
            "codec footer mismatch: unknown algorithmID: {}",
            algorithm_id
        )));
    }
    let expected = BigEndian::read_u32(&footer[8..12]);
    let actual = CHECKSUM.checksum(&bytes[..bytes.len() - 4]);
    if expected != actual {
        bail!(CorruptIndex(format!(
            "checksum failed (hardware problem?): expected={:x} actual={:x}",
            expected, actual
        )));
    }
    Ok(())
}

/// Writes `payload` framed by a header and footer into a new file.
pub fn write_index_file(
    dir: &dyn Directory,
    name: &str,
    codec: &str,
    version: u32,
    payload: &[u8],
    ctx: &IOContext,
) -> Result<()> {
    let mut bytes = Vec::with_capacity(header_length(codec) + payload.len() + FOOTER_LENGTH);
    write_header(&mut bytes, codec, version)?;
    bytes.extend_from_slice(payload);
    write_footer(&mut bytes)?;
    let mut output: Box<dyn IndexOutput> = dir.create_output(name, ctx)?;
    output.write_all(&bytes)?;
    output.flush()?;
    Ok(())
}

/// Reads a file written by `write_index_file`, verifying both header and
/// checksum, and returns the payload.
pub fn read_index_file(
    dir: &dyn Directory,
    name: &str,
    codec: &str,
    min_version: u32,
    max_version: u32,
    ctx: &IOContext,
) -> Result<Vec<u8>> {
    let bytes = read_file(dir, name, ctx)?;
    check_header(&bytes, codec, min_version, max_version)?;
    check_footer(&bytes)?;
    let start = header_length(codec);
    if bytes.len() < start + FOOTER_LENGTH {
        bail!(CorruptIndex(format!("file {} is truncated", name)));
    }
    Ok(bytes[start..bytes.len() - FOOTER_LENGTH].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{write_file, RAMDirectory};

    #[test]
    fn test_header_footer_detect_corruption() -> Result<()> {
        let dir = RAMDirectory::new();
        write_index_file(&dir, "_0.si", "SegmentInfo", 1, b"payload", &IOContext::Default)?;
        let payload = read_index_file(&dir, "_0.si", "SegmentInfo", 0, 1, &IOContext::READ)?;
        assert_eq!(payload, b"payload".to_vec());

        // wrong codec and wrong version range
        assert!(read_index_file(&dir, "_0.si", "Other", 0, 1, &IOContext::READ).is_err());
        assert!(read_index_file(&dir, "_0.si", "SegmentInfo", 2, 3, &IOContext::READ).is_err());

        let mut bytes = read_file(&dir, "_0.si", &IOContext::READ)?;
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        write_file(&dir, "_1.si", &bytes, &IOContext::Default)?;
        assert!(read_index_file(&dir, "_1.si", "SegmentInfo", 0, 1, &IOContext::READ).is_err());
        Ok(())
    }
}
