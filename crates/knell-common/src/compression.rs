// compression.rs -- Deflate envelope for serialized savegame output
//
// Output uses raw deflate (no zlib header, windowBits = -15 equivalent) so
// the buffer can be dropped into a zip container unchanged. The CRC is taken
// over the uncompressed text.

use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Read;

use crc::{Crc, CRC_32_ISO_HDLC};

/// Stored (uncompressed) method id, zip-compatible.
pub const METHOD_STORED: u16 = 0;
/// Raw deflate method id, zip-compatible.
pub const METHOD_DEFLATE: u16 = 8;

const CRC_CALC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC32 of a block of data (zlib polynomial).
pub fn crc32(data: &[u8]) -> u32 {
    CRC_CALC.checksum(data)
}

/// A finished serializer payload plus the metadata a zip-style container
/// needs to store it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBuffer {
    pub size: u32,
    pub compressed_size: u32,
    pub zip_flags: u16,
    pub method: u16,
    pub crc32: u32,
    pub buffer: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("unknown compression method {0}")]
    UnknownMethod(u16),
    #[error("decompression failed: {0}")]
    Inflate(#[from] std::io::Error),
    #[error("size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("CRC mismatch: expected {expected:#010x}, got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
}

impl CompressedBuffer {
    /// Compress `data` with maximum-effort raw deflate. Falls back to storing
    /// the bytes unchanged when compression fails.
    pub fn pack(data: &[u8]) -> Self {
        let crc = crc32(data);
        let mut encoder = DeflateEncoder::new(data, Compression::best());
        let mut compressed = Vec::with_capacity(data.len());

        match encoder.read_to_end(&mut compressed) {
            Ok(_) => CompressedBuffer {
                size: data.len() as u32,
                compressed_size: compressed.len() as u32,
                zip_flags: 0,
                method: METHOD_DEFLATE,
                crc32: crc,
                buffer: compressed,
            },
            Err(_) => CompressedBuffer {
                size: data.len() as u32,
                compressed_size: data.len() as u32,
                zip_flags: 0,
                method: METHOD_STORED,
                crc32: crc,
                buffer: data.to_vec(),
            },
        }
    }

    /// Recover the original bytes, verifying length and CRC.
    pub fn unpack(&self) -> Result<Vec<u8>, UnpackError> {
        let data = match self.method {
            METHOD_STORED => self.buffer.clone(),
            METHOD_DEFLATE => {
                let mut decoder = DeflateDecoder::new(self.buffer.as_slice());
                let mut out = Vec::with_capacity(self.size as usize);
                decoder.read_to_end(&mut out)?;
                out
            }
            other => return Err(UnpackError::UnknownMethod(other)),
        };

        if data.len() != self.size as usize {
            return Err(UnpackError::SizeMismatch {
                expected: self.size as usize,
                got: data.len(),
            });
        }
        let got = crc32(&data);
        if got != self.crc32 {
            return Err(UnpackError::CrcMismatch {
                expected: self.crc32,
                got,
            });
        }
        Ok(data)
    }
}
