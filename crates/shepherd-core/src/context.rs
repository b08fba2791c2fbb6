//! Task context compression: gzip + base64 on ingress, bounded decompression
//! on read (§4.1, §8 round-trip property).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

/// Decompression aborts once the expanded size would exceed this, to defeat
/// decompression bombs (§4.1).
pub const MAX_DECOMPRESSED_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to compress context: {0}")]
    Compress(String),
    #[error("failed to decompress context: {0}")]
    Decompress(String),
    #[error("decompressed context exceeds the {MAX_DECOMPRESSED_BYTES} byte limit")]
    TooLarge,
}

/// gzips `context` and base64-encodes the result. Returns the compressed,
/// base64-encoded string and its byte length (the length that is checked
/// against the ingress size cap).
pub fn compress_context(context: &str) -> Result<(String, usize), ContextError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(context.as_bytes())
        .map_err(|e| ContextError::Compress(e.to_string()))?;
    let gzipped = encoder
        .finish()
        .map_err(|e| ContextError::Compress(e.to_string()))?;
    let encoded = BASE64.encode(gzipped);
    let len = encoded.len();
    Ok((encoded, len))
}

/// Reverses `compress_context`, bounding the expanded size to
/// `MAX_DECOMPRESSED_BYTES`.
pub fn decompress_context(encoded: &str) -> Result<String, ContextError> {
    let gzipped = BASE64
        .decode(encoded)
        .map_err(|e| ContextError::Decompress(e.to_string()))?;
    let mut decoder = GzDecoder::new(gzipped.as_slice());
    let mut buf = Vec::new();
    let mut limited = (&mut decoder).take(MAX_DECOMPRESSED_BYTES as u64 + 1);
    limited
        .read_to_end(&mut buf)
        .map_err(|e| ContextError::Decompress(e.to_string()))?;
    if buf.len() > MAX_DECOMPRESSED_BYTES {
        return Err(ContextError::TooLarge);
    }
    String::from_utf8(buf).map_err(|e| ContextError::Decompress(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_string() {
        let original = "bug report: login fails when the session cookie expires mid-request\n".repeat(50);
        let (encoded, _) = compress_context(&original).unwrap();
        let decoded = decompress_context(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn empty_string_round_trips() {
        let (encoded, _) = compress_context("").unwrap();
        assert_eq!(decompress_context(&encoded).unwrap(), "");
    }

    #[test]
    fn rejects_garbage_base64() {
        assert!(decompress_context("not valid base64!!!").is_err());
    }

    #[test]
    fn rejects_oversized_decompressed_payload() {
        // Highly compressible input that expands past the 10 MiB bound.
        let original = "a".repeat(MAX_DECOMPRESSED_BYTES + 1024);
        let (encoded, _) = compress_context(&original).unwrap();
        assert!(matches!(decompress_context(&encoded), Err(ContextError::TooLarge)));
    }
}
