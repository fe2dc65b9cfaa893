//! Payload compression codecs shared by the scribe caches.

mod gzip;
mod noop;

pub use gzip::GzipCompressor;
pub use noop::NoopCompressor;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Codec used to produce a [`Compressed`] blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Bytes stored verbatim.
    Identity,
    /// DEFLATE stream in a gzip container.
    Gzip,
}

impl Codec {
    pub fn as_str(self) -> &'static str {
        match self {
            Codec::Identity => "identity",
            Codec::Gzip => "gzip",
        }
    }
}

/// Result payload for compression backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Compressed {
    pub codec: Codec,
    pub payload: Bytes,
    /// Length of the uncompressed input in bytes.
    pub original_len: usize,
}

impl Compressed {
    /// Compressed size over original size; 1.0 for empty inputs.
    pub fn ratio(&self) -> f64 {
        if self.original_len == 0 {
            return 1.0;
        }
        self.payload.len() as f64 / self.original_len as f64
    }
}

/// Compression engine contract.
pub trait Compressor: Send + Sync {
    /// Stable identifier for telemetry.
    fn id(&self) -> &'static str;

    /// Codec produced by this compressor.
    fn codec(&self) -> Codec;

    /// Compress `input`.
    fn compress(&self, input: &[u8]) -> Result<Compressed>;

    /// Rehydrate a blob produced by this compressor.
    fn decompress(&self, blob: &Compressed) -> Result<Vec<u8>>;
}

/// Decompress a blob with whichever built-in codec produced it.
pub fn decompress_any(blob: &Compressed) -> Result<Vec<u8>> {
    match blob.codec {
        Codec::Identity => NoopCompressor.decompress(blob),
        Codec::Gzip => GzipCompressor::default().decompress(blob),
    }
}
