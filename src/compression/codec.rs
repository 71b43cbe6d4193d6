//! zstd and DEFLATE body codecs.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use tracing::{trace, warn};

use crate::core::{
    COMPRESSION_THRESHOLD, CompressionError, CompressionType, MAX_UNCOMPRESSED_SIZE,
    ZSTD_COMPRESSION_LEVEL,
};

/// Compresses outgoing bodies and restores incoming ones.
#[derive(Debug, Clone)]
pub struct Compressor {
    kind: CompressionType,
    threshold: usize,
    dictionary: Option<Arc<[u8]>>,
}

impl Compressor {
    /// Create a compressor; `None` for [`CompressionType::None`].
    pub fn new(kind: CompressionType) -> Option<Self> {
        if kind == CompressionType::None {
            return None;
        }
        Some(Self {
            kind,
            threshold: COMPRESSION_THRESHOLD,
            dictionary: None,
        })
    }

    /// Bodies shorter than `threshold` bytes are sent as they are.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Prime zstd with a dictionary shared with the server.
    ///
    /// DEFLATE has no dictionary support; it is ignored there.
    pub fn with_dictionary(mut self, dictionary: &[u8]) -> Self {
        if self.kind != CompressionType::Zstd {
            warn!(kind = %self.kind, "compression dictionary ignored");
            return self;
        }
        self.dictionary = (!dictionary.is_empty()).then(|| Arc::from(dictionary));
        self
    }

    /// The algorithm in use.
    pub fn kind(&self) -> CompressionType {
        self.kind
    }

    /// Minimum body length that is compressed.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Compress `body` if it is long enough and compression pays off.
    ///
    /// Returns `None` when the body should go out uncompressed.
    pub fn compress(&self, body: &[u8]) -> Result<Option<Vec<u8>>, CompressionError> {
        if body.is_empty() || body.len() < self.threshold {
            return Ok(None);
        }

        let packed = match self.kind {
            CompressionType::None => return Ok(None),
            CompressionType::Zstd => self.zstd_compress(body),
            CompressionType::Deflate => deflate_compress(body),
        }
        .map_err(|e| CompressionError::CompressionFailed(e.to_string()))?;

        if packed.is_empty() || packed.len() >= body.len() {
            trace!(size = body.len(), "compression does not pay off");
            return Ok(None);
        }
        trace!(from = body.len(), to = packed.len(), "compressed body");
        Ok(Some(packed))
    }

    /// Restore a body announced as `expected` bytes long.
    pub fn decompress(&self, body: &[u8], expected: usize) -> Result<Vec<u8>, CompressionError> {
        if expected > MAX_UNCOMPRESSED_SIZE {
            return Err(CompressionError::SizeExceeded {
                size: expected,
                limit: MAX_UNCOMPRESSED_SIZE,
            });
        }

        let restored = match self.kind {
            CompressionType::None => return Err(CompressionError::NotConfigured),
            CompressionType::Zstd => self.zstd_decompress(body, expected),
            CompressionType::Deflate => deflate_decompress(body, expected),
        }
        .map_err(|e| CompressionError::DecompressionFailed(e.to_string()))?;

        if restored.len() != expected {
            return Err(CompressionError::SizeMismatch {
                expected,
                actual: restored.len(),
            });
        }
        trace!(from = body.len(), to = restored.len(), "decompressed body");
        Ok(restored)
    }

    fn zstd_compress(&self, body: &[u8]) -> std::io::Result<Vec<u8>> {
        match &self.dictionary {
            Some(dict) => {
                zstd::bulk::Compressor::with_dictionary(ZSTD_COMPRESSION_LEVEL, dict)?.compress(body)
            }
            None => zstd::bulk::compress(body, ZSTD_COMPRESSION_LEVEL),
        }
    }

    fn zstd_decompress(&self, body: &[u8], expected: usize) -> std::io::Result<Vec<u8>> {
        match &self.dictionary {
            Some(dict) => zstd::bulk::Decompressor::with_dictionary(dict)?.decompress(body, expected),
            None => zstd::bulk::decompress(body, expected),
        }
    }
}

fn deflate_compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(body.len()), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

fn deflate_decompress(body: &[u8], expected: usize) -> std::io::Result<Vec<u8>> {
    // One byte past the announced size is enough to detect a mismatch.
    let mut restored = Vec::with_capacity(expected);
    DeflateDecoder::new(body)
        .take(expected as u64 + 1)
        .read_to_end(&mut restored)?;
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut body = Vec::new();
        for i in 0..40 {
            body.extend_from_slice(format!("{{\"x\":{i},\"y\":0,\"name\":\"player\"}}").as_bytes());
        }
        body
    }

    #[test]
    fn test_none_has_no_compressor() {
        assert!(Compressor::new(CompressionType::None).is_none());
    }

    #[test]
    fn test_zstd_restores_body() {
        let c = Compressor::new(CompressionType::Zstd).unwrap();
        let body = sample();
        let packed = c.compress(&body).unwrap().unwrap();
        assert!(packed.len() < body.len());
        assert_eq!(c.decompress(&packed, body.len()).unwrap(), body);
    }

    #[test]
    fn test_deflate_restores_body() {
        let c = Compressor::new(CompressionType::Deflate).unwrap();
        let body = sample();
        let packed = c.compress(&body).unwrap().unwrap();
        assert!(packed.len() < body.len());
        assert_eq!(c.decompress(&packed, body.len()).unwrap(), body);
    }

    #[test]
    fn test_below_threshold_is_left_alone() {
        let c = Compressor::new(CompressionType::Zstd).unwrap();
        assert_eq!(c.threshold(), 128);
        assert_eq!(c.compress(&[b'a'; 127]).unwrap(), None);
        assert!(c.compress(&[b'a'; 128]).unwrap().is_some());

        let c = c.with_threshold(1024);
        assert_eq!(c.compress(&sample()).unwrap(), None);
    }

    #[test]
    fn test_incompressible_body_is_left_alone() {
        let c = Compressor::new(CompressionType::Deflate).unwrap();
        let noise: Vec<u8> = (0..512u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();
        if let Some(packed) = c.compress(&noise).unwrap() {
            assert!(packed.len() < noise.len());
        }
    }

    #[test]
    fn test_wrong_announced_size() {
        let c = Compressor::new(CompressionType::Deflate).unwrap();
        let body = sample();
        let packed = c.compress(&body).unwrap().unwrap();
        assert_eq!(
            c.decompress(&packed, body.len() + 5),
            Err(CompressionError::SizeMismatch {
                expected: body.len() + 5,
                actual: body.len()
            })
        );
        assert!(c.decompress(&packed, body.len() - 5).is_err());
    }

    #[test]
    fn test_announced_size_limit() {
        let c = Compressor::new(CompressionType::Zstd).unwrap();
        assert!(matches!(
            c.decompress(b"", MAX_UNCOMPRESSED_SIZE + 1),
            Err(CompressionError::SizeExceeded { .. })
        ));
    }

    #[test]
    fn test_garbage_fails() {
        let c = Compressor::new(CompressionType::Zstd).unwrap();
        assert!(matches!(
            c.decompress(b"not zstd at all", 64),
            Err(CompressionError::DecompressionFailed(_))
        ));
    }

    #[test]
    fn test_zstd_with_dictionary() {
        let dict = sample();
        let c = Compressor::new(CompressionType::Zstd)
            .unwrap()
            .with_dictionary(&dict);
        let body = sample();
        let packed = c.compress(&body).unwrap().unwrap();
        assert_eq!(c.decompress(&packed, body.len()).unwrap(), body);
    }

    #[test]
    fn test_deflate_ignores_dictionary() {
        let c = Compressor::new(CompressionType::Deflate)
            .unwrap()
            .with_dictionary(b"shared");
        assert!(c.dictionary.is_none());
    }
}
