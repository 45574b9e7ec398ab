//! Optional whole-payload compression applied after encoding.

use std::io::{Read, Write};
use std::str::FromStr;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::CodecError;

/// Cap on inflated size; a larger payload is treated as corrupt.
const MAX_INFLATED_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    /// Compress `bytes`. Empty input stays empty.
    pub fn compress(self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Compression::None => Ok(bytes.to_vec()),
            Compression::Gzip => {
                let mut enc = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), flate2::Compression::default());
                enc.write_all(bytes).map_err(CodecError::Compression)?;
                enc.finish().map_err(CodecError::Compression)
            }
        }
    }

    /// Inverse of [`Compression::compress`]. Empty input stays empty.
    pub fn decompress(self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Compression::None => Ok(bytes.to_vec()),
            Compression::Gzip => {
                let mut out = Vec::with_capacity(bytes.len() * 2);
                let mut dec = GzDecoder::new(bytes).take(MAX_INFLATED_BYTES + 1);
                dec.read_to_end(&mut out).map_err(CodecError::Compression)?;
                if out.len() as u64 > MAX_INFLATED_BYTES {
                    return Err(CodecError::TooLarge(out.len()));
                }
                Ok(out)
            }
        }
    }
}

impl FromStr for Compression {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(Compression::None),
            "gzip" | "gz" => Ok(Compression::Gzip),
            other => Err(CodecError::UnknownCompression(other.to_string())),
        }
    }
}
