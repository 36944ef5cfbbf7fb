//! Compression codec with a configured default and allow-list.

use crate::core::{BackupError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use xz2::stream::{Check, LzmaOptions, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    Zstd,
    Lz4,
    /// Legacy `.lzma` container.
    Lzma,
    /// LZMA2 inside an `.xz` container.
    Lzma2,
    /// Stored as-is.
    None,
}

impl CompressionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Zstd => "zstd",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Lzma => "lzma",
            CompressionAlgorithm::Lzma2 => "lzma2",
            CompressionAlgorithm::None => "none",
        }
    }

    /// File extension appended to artifact names.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Zstd => "zst",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Lzma => "lzma",
            CompressionAlgorithm::Lzma2 => "xz",
            CompressionAlgorithm::None => "bin",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zstd" => Ok(CompressionAlgorithm::Zstd),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            "lzma" => Ok(CompressionAlgorithm::Lzma),
            "lzma2" | "xz" => Ok(CompressionAlgorithm::Lzma2),
            "none" => Ok(CompressionAlgorithm::None),
            other => Err(BackupError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub default: CompressionAlgorithm,
    #[serde(default = "default_allowed")]
    pub allowed: Vec<CompressionAlgorithm>,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
    /// 0..=9, shared by `lzma` and `lzma2`.
    #[serde(default = "default_lzma_preset")]
    pub lzma_preset: u32,
}

fn default_algorithm() -> CompressionAlgorithm {
    CompressionAlgorithm::Zstd
}

fn default_allowed() -> Vec<CompressionAlgorithm> {
    vec![CompressionAlgorithm::Zstd, CompressionAlgorithm::Lz4]
}

fn default_zstd_level() -> i32 {
    3
}

fn default_lzma_preset() -> u32 {
    6
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default: default_algorithm(),
            allowed: default_allowed(),
            zstd_level: default_zstd_level(),
            lzma_preset: default_lzma_preset(),
        }
    }
}

/// Compresses artifacts with any allow-listed algorithm.
#[derive(Debug, Clone)]
pub struct Codec {
    default: CompressionAlgorithm,
    allowed: Vec<CompressionAlgorithm>,
    zstd_level: i32,
    lzma_preset: u32,
}

impl Codec {
    pub fn new(config: &CompressionConfig) -> Result<Self> {
        if !config.allowed.contains(&config.default) {
            return Err(BackupError::UnsupportedAlgorithm(format!(
                "default algorithm '{}' is not in the allow-list",
                config.default
            )));
        }
        if config.lzma_preset > 9 {
            return Err(BackupError::ConfigError(format!(
                "lzma preset must be 0..=9, got {}",
                config.lzma_preset
            )));
        }
        Ok(Self {
            default: config.default,
            allowed: config.allowed.clone(),
            zstd_level: config.zstd_level,
            lzma_preset: config.lzma_preset,
        })
    }

    pub fn default_algorithm(&self) -> CompressionAlgorithm {
        self.default
    }

    pub fn is_allowed(&self, algorithm: CompressionAlgorithm) -> bool {
        self.allowed.contains(&algorithm)
    }

    fn ensure_allowed(&self, algorithm: CompressionAlgorithm) -> Result<()> {
        if self.is_allowed(algorithm) {
            Ok(())
        } else {
            Err(BackupError::UnsupportedAlgorithm(algorithm.to_string()))
        }
    }

    pub fn compress(&self, bytes: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
        self.ensure_allowed(algorithm)?;
        match algorithm {
            CompressionAlgorithm::Zstd => zstd::stream::encode_all(bytes, self.zstd_level)
                .map_err(|err| BackupError::CodecError(format!("zstd compress: {}", err))),
            CompressionAlgorithm::Lz4 => {
                let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(bytes.len() / 2));
                encoder
                    .write_all(bytes)
                    .map_err(|err| BackupError::CodecError(format!("lz4 compress: {}", err)))?;
                encoder
                    .finish()
                    .map_err(|err| BackupError::CodecError(format!("lz4 finish: {}", err)))
            }
            CompressionAlgorithm::Lzma | CompressionAlgorithm::Lzma2 => {
                let stream = self.lzma_encoder(algorithm)?;
                let mut encoder = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
                encoder
                    .write_all(bytes)
                    .map_err(|err| BackupError::CodecError(format!("{} compress: {}", algorithm, err)))?;
                encoder
                    .finish()
                    .map_err(|err| BackupError::CodecError(format!("{} finish: {}", algorithm, err)))
            }
            CompressionAlgorithm::None => Ok(bytes.to_vec()),
        }
    }

    pub fn decompress(&self, bytes: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>> {
        self.ensure_allowed(algorithm)?;
        match algorithm {
            CompressionAlgorithm::Zstd => zstd::stream::decode_all(bytes)
                .map_err(|err| BackupError::CodecError(format!("zstd decompress: {}", err))),
            CompressionAlgorithm::Lz4 => {
                let mut decoder = lz4_flex::frame::FrameDecoder::new(bytes);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|err| BackupError::CodecError(format!("lz4 decompress: {}", err)))?;
                Ok(out)
            }
            CompressionAlgorithm::Lzma | CompressionAlgorithm::Lzma2 => {
                let stream = match algorithm {
                    CompressionAlgorithm::Lzma => Stream::new_lzma_decoder(u64::MAX),
                    _ => Stream::new_stream_decoder(u64::MAX, 0),
                }
                .map_err(|err| BackupError::CodecError(format!("{} decoder: {}", algorithm, err)))?;
                let mut decoder = xz2::read::XzDecoder::new_stream(bytes, stream);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|err| BackupError::CodecError(format!("{} decompress: {}", algorithm, err)))?;
                Ok(out)
            }
            CompressionAlgorithm::None => Ok(bytes.to_vec()),
        }
    }

    fn lzma_encoder(&self, algorithm: CompressionAlgorithm) -> Result<Stream> {
        let stream = match algorithm {
            CompressionAlgorithm::Lzma => LzmaOptions::new_preset(self.lzma_preset)
                .and_then(|options| Stream::new_lzma_encoder(&options)),
            _ => Stream::new_easy_encoder(self.lzma_preset, Check::Crc64),
        };
        stream.map_err(|err| BackupError::CodecError(format!("{} encoder: {}", algorithm, err)))
    }
}

/// Hex SHA-256 of an artifact, recorded in the ledger and checked on restore.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec_allowing(allowed: &[CompressionAlgorithm]) -> Codec {
        Codec::new(&CompressionConfig {
            default: allowed[0],
            allowed: allowed.to_vec(),
            zstd_level: 3,
            lzma_preset: 1,
        })
        .unwrap()
    }

    fn payloads() -> Vec<Vec<u8>> {
        let mut repetitive = Vec::new();
        for i in 0..4096u32 {
            repetitive.extend_from_slice(format!("{{\"seq\":{},\"side\":\"buy\"}}\n", i % 17).as_bytes());
        }
        let noisy: Vec<u8> = (0..10_000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        vec![Vec::new(), vec![0u8], b"BTC-USD".to_vec(), repetitive, noisy]
    }

    #[test]
    fn test_round_trip_for_every_algorithm() {
        let all = [
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Lzma,
            CompressionAlgorithm::Lzma2,
            CompressionAlgorithm::None,
        ];
        let codec = codec_allowing(&all);
        for algorithm in all {
            for payload in payloads() {
                let packed = codec.compress(&payload, algorithm).unwrap();
                let unpacked = codec.decompress(&packed, algorithm).unwrap();
                assert_eq!(unpacked, payload, "{algorithm} len={}", payload.len());
            }
        }
    }

    #[test]
    fn test_algorithm_outside_allow_list_rejected() {
        let codec = codec_allowing(&[CompressionAlgorithm::Zstd]);
        let err = codec.compress(b"abc", CompressionAlgorithm::Lz4).unwrap_err();
        assert!(matches!(err, BackupError::UnsupportedAlgorithm(_)));
        let err = codec.decompress(b"abc", CompressionAlgorithm::None).unwrap_err();
        assert!(matches!(err, BackupError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_default_must_be_allowed() {
        let err = Codec::new(&CompressionConfig {
            default: CompressionAlgorithm::Lz4,
            allowed: vec![CompressionAlgorithm::Zstd],
            zstd_level: 3,
            lzma_preset: 6,
        })
        .unwrap_err();
        assert!(matches!(err, BackupError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_corrupt_input_is_codec_error() {
        let codec = codec_allowing(&[
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Lzma,
            CompressionAlgorithm::Lzma2,
        ]);
        let garbage = b"definitely not a compressed frame";
        assert!(matches!(
            codec.decompress(garbage, CompressionAlgorithm::Zstd),
            Err(BackupError::CodecError(_))
        ));
        assert!(matches!(
            codec.decompress(garbage, CompressionAlgorithm::Lz4),
            Err(BackupError::CodecError(_))
        ));
        assert!(matches!(
            codec.decompress(garbage, CompressionAlgorithm::Lzma2),
            Err(BackupError::CodecError(_))
        ));
    }

    #[test]
    fn test_lzma_formats_are_distinct_containers() {
        let codec = codec_allowing(&[CompressionAlgorithm::Lzma, CompressionAlgorithm::Lzma2]);
        let payload = b"BTC-USD,42000.5,0.1\n".repeat(64);

        let xz = codec.compress(&payload, CompressionAlgorithm::Lzma2).unwrap();
        assert!(xz.starts_with(&[0xFD, b'7', b'z', b'X', b'Z', 0x00]));
        assert!(xz.len() < payload.len());

        let legacy = codec.compress(&payload, CompressionAlgorithm::Lzma).unwrap();
        assert!(!legacy.starts_with(&[0xFD, b'7', b'z']));
        assert!(codec.decompress(&legacy, CompressionAlgorithm::Lzma2).is_err());
    }

    #[test]
    fn test_lzma_preset_out_of_range_rejected() {
        let err = Codec::new(&CompressionConfig {
            lzma_preset: 10,
            ..CompressionConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, BackupError::ConfigError(_)));
    }

    #[test]
    fn test_unknown_algorithm_name() {
        assert!(matches!(
            "brotli".parse::<CompressionAlgorithm>(),
            Err(BackupError::UnsupportedAlgorithm(_))
        ));
        assert_eq!(
            "lzma2".parse::<CompressionAlgorithm>().unwrap(),
            CompressionAlgorithm::Lzma2
        );
        assert_eq!("ZSTD".parse::<CompressionAlgorithm>().unwrap(), CompressionAlgorithm::Zstd);
    }

    #[test]
    fn test_checksum_is_stable_hex() {
        let digest = checksum(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
