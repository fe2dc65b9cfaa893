use crate::{Codec, Compressed, Compressor};
use anyhow::Result;
use bytes::Bytes;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn id(&self) -> &'static str {
        "noop"
    }

    fn codec(&self) -> Codec {
        Codec::Identity
    }

    fn compress(&self, input: &[u8]) -> Result<Compressed> {
        Ok(Compressed {
            codec: Codec::Identity,
            payload: Bytes::copy_from_slice(input),
            original_len: input.len(),
        })
    }

    fn decompress(&self, blob: &Compressed) -> Result<Vec<u8>> {
        anyhow::ensure!(
            blob.codec == Codec::Identity,
            "decompress: codec mismatch (expected identity, got {})",
            blob.codec.as_str()
        );
        Ok(blob.payload.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_roundtrips() {
        let blob = NoopCompressor.compress(b"hello world").expect("compress");
        assert_eq!(blob.original_len, 11);
        assert_eq!(NoopCompressor.decompress(&blob).unwrap(), b"hello world");
    }
}
