//! Value framing for the durable store.
//!
//! Every stored value starts with a one-byte format tag followed by the
//! compressed bytes. New values are written with LZ4; Snappy framed values
//! from older databases remain readable.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Compression format of a stored value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionFormat {
    /// LZ4 block with the uncompressed size prepended
    #[default]
    Lz4,
    /// Snappy frame format (legacy)
    Snappy,
}

impl CompressionFormat {
    fn tag(self) -> u8 {
        match self {
            Self::Lz4 => 1,
            Self::Snappy => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Snappy),
            other => Err(Error::Compression(format!("unknown format tag {}", other))),
        }
    }
}

/// Compress `bytes` and prefix the format tag
pub fn compress(format: CompressionFormat, bytes: &[u8]) -> Result<Vec<u8>> {
    match format {
        CompressionFormat::Lz4 => {
            let body = lz4_flex::compress_prepend_size(bytes);
            let mut out = Vec::with_capacity(1 + body.len());
            out.push(format.tag());
            out.extend_from_slice(&body);
            Ok(out)
        }
        CompressionFormat::Snappy => {
            let mut encoder = snap::write::FrameEncoder::new(vec![format.tag()]);
            encoder.write_all(bytes)?;
            encoder
                .into_inner()
                .map_err(|e| Error::Compression(e.to_string()))
        }
    }
}

/// Decode a tagged value in either format
pub fn decompress(value: &[u8]) -> Result<Vec<u8>> {
    let (&tag, body) = value
        .split_first()
        .ok_or_else(|| Error::Compression("empty value".into()))?;

    match CompressionFormat::from_tag(tag)? {
        CompressionFormat::Lz4 => lz4_flex::decompress_size_prepended(body)
            .map_err(|e| Error::Compression(e.to_string())),
        CompressionFormat::Snappy => {
            let mut out = Vec::new();
            snap::read::FrameDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| Error::Compression(e.to_string()))?;
            Ok(out)
        }
    }
}
