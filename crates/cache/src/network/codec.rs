//! Stored payload format: serialized value -> raw deflate -> base64

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Compress and base64-encode serialized value bytes
pub fn encode(serialized: &[u8]) -> Result<String, PayloadError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(serialized)?;
    let compressed = encoder.finish()?;
    Ok(STANDARD.encode(compressed))
}

/// Reverse of [`encode`]
pub fn decode(encoded: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let compressed = STANDARD.decode(encoded)?;
    let mut decoder = DeflateDecoder::new(&compressed[..]);
    let mut serialized = Vec::new();
    decoder.read_to_end(&mut serialized)?;
    Ok(serialized)
}

/// Split encoded text into pieces of at most `size` bytes
///
/// Encoded text is ASCII, so every split falls on a character boundary.
/// Empty text still yields one empty piece.
pub fn chunks(encoded: &str, size: usize) -> Vec<&str> {
    if encoded.is_empty() || size == 0 {
        return vec![encoded];
    }
    encoded
        .as_bytes()
        .chunks(size)
        .filter_map(|piece| std::str::from_utf8(piece).ok())
        .collect()
}
