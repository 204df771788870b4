//! Block compression for shuffle output and serialized cache entries.
//!
//! Every encoded block starts with a one byte codec tag so a reader never
//! needs to know which codec the writer was configured with.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{CommonError, Result};

const ZSTD_LEVEL: i32 = 3;

/// Compression algorithm types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is.
    None,
    /// LZ4 compression - extremely fast compression and decompression.
    #[default]
    Lz4,
    /// Zstd compression - high compression ratio.
    Zstd,
    /// Snappy compression - balanced compression ratio and speed.
    Snappy,
}

impl CompressionAlgorithm {
    fn tag(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd => 2,
            CompressionAlgorithm::Snappy => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Lz4),
            2 => Ok(CompressionAlgorithm::Zstd),
            3 => Ok(CompressionAlgorithm::Snappy),
            other => Err(CommonError::decompression_error(format!(
                "Unknown codec tag {}",
                other
            ))),
        }
    }

    /// Compress raw bytes with this algorithm, without a header.
    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            CompressionAlgorithm::Zstd => zstd::encode_all(data, ZSTD_LEVEL).map_err(|e| {
                CommonError::compression_error_with_source("Zstd compression failed", e)
            }),
            CompressionAlgorithm::Snappy => {
                let mut encoder = snap::write::FrameEncoder::new(Vec::new());
                std::io::copy(&mut std::io::Cursor::new(data), &mut encoder).map_err(|e| {
                    CommonError::compression_error_with_source("Snappy compression failed", e)
                })?;
                encoder.into_inner().map_err(|e| {
                    CommonError::compression_error(format!(
                        "Snappy compression finalization failed: {}",
                        e
                    ))
                })
            }
        }
    }

    /// Reverse of [`CompressionAlgorithm::compress`].
    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data).map_err(|e| {
                CommonError::decompression_error_with_source("LZ4 decompression failed", e)
            }),
            CompressionAlgorithm::Zstd => zstd::decode_all(data).map_err(|e| {
                CommonError::decompression_error_with_source("Zstd decompression failed", e)
            }),
            CompressionAlgorithm::Snappy => {
                let mut decompressed = Vec::new();
                let mut decoder = snap::read::FrameDecoder::new(data);
                std::io::copy(&mut decoder, &mut decompressed).map_err(|e| {
                    CommonError::decompression_error_with_source("Snappy decompression failed", e)
                })?;
                Ok(decompressed)
            }
        }
    }
}

/// Compression statistics information.
#[derive(Debug, Clone, Default)]
pub struct CompressionStats {
    pub blocks_compressed: u64,
    pub blocks_stored_raw: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
}

impl CompressionStats {
    /// Output bytes over input bytes; 0.0 when nothing was encoded.
    pub fn compression_ratio(&self) -> f64 {
        if self.input_bytes == 0 {
            0.0
        } else {
            self.output_bytes as f64 / self.input_bytes as f64
        }
    }
}

/// Encodes and decodes tagged blocks, compressing only blocks above a size
/// hint.
#[derive(Debug)]
pub struct BlockCodec {
    algorithm: CompressionAlgorithm,
    threshold: usize,
    compressed: AtomicU64,
    raw: AtomicU64,
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
}

impl BlockCodec {
    /// Blocks of `threshold` bytes or fewer are stored uncompressed.
    pub fn new(algorithm: CompressionAlgorithm, threshold: usize) -> Self {
        Self {
            algorithm,
            threshold,
            compressed: AtomicU64::new(0),
            raw: AtomicU64::new(0),
            input_bytes: AtomicU64::new(0),
            output_bytes: AtomicU64::new(0),
        }
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Encode `data` into a tagged block.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let algorithm = if data.len() > self.threshold {
            self.algorithm
        } else {
            CompressionAlgorithm::None
        };

        let payload = algorithm.compress(data)?;
        let mut block = Vec::with_capacity(payload.len() + 1);
        block.push(algorithm.tag());
        block.extend_from_slice(&payload);

        if algorithm == CompressionAlgorithm::None {
            self.raw.fetch_add(1, Ordering::Relaxed);
        } else {
            self.compressed.fetch_add(1, Ordering::Relaxed);
        }
        self.input_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.output_bytes
            .fetch_add(block.len() as u64, Ordering::Relaxed);

        Ok(block)
    }

    /// Decode a block produced by [`BlockCodec::encode`] with any codec.
    pub fn decode(&self, block: &[u8]) -> Result<Vec<u8>> {
        decode_block(block)
    }

    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            blocks_compressed: self.compressed.load(Ordering::Relaxed),
            blocks_stored_raw: self.raw.load(Ordering::Relaxed),
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Decode a tagged block.
pub fn decode_block(block: &[u8]) -> Result<Vec<u8>> {
    let (tag, payload) = block
        .split_first()
        .ok_or_else(|| CommonError::decompression_error("Empty block"))?;
    CompressionAlgorithm::from_tag(*tag)?.decompress(payload)
}
