use std::io::{Read, Write};

use anyhow::{Context, Result};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::{Codec, Compressed, Compressor};

/// Upper bound on inflated output; guards against corrupt or hostile blobs.
const MAX_INFLATED_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: u32,
}

impl GzipCompressor {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl Compressor for GzipCompressor {
    fn id(&self) -> &'static str {
        "gzip"
    }

    fn codec(&self) -> Codec {
        Codec::Gzip
    }

    fn compress(&self, input: &[u8]) -> Result<Compressed> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(input).context("gzip encode")?;
        let payload = encoder.finish().context("gzip finish")?;
        tracing::trace!(
            original = input.len(),
            compressed = payload.len(),
            "gzip compressed payload"
        );
        Ok(Compressed {
            codec: Codec::Gzip,
            payload: Bytes::from(payload),
            original_len: input.len(),
        })
    }

    fn decompress(&self, blob: &Compressed) -> Result<Vec<u8>> {
        anyhow::ensure!(
            blob.codec == Codec::Gzip,
            "decompress: codec mismatch (expected gzip, got {})",
            blob.codec.as_str()
        );
        let mut out = Vec::with_capacity(blob.original_len);
        GzDecoder::new(blob.payload.as_ref())
            .take(MAX_INFLATED_BYTES)
            .read_to_end(&mut out)
            .context("gzip decode")?;
        anyhow::ensure!(
            out.len() == blob.original_len,
            "gzip decode produced {} bytes, expected {}",
            out.len(),
            blob.original_len
        );
        Ok(out)
    }
}
