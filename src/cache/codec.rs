//! Compact text codec for persisted records
//!
//! Values are encoded as JSON, gzip-compressed, then base64-encoded so they can
//! live in any text-oriented key-value medium. Decoding falls back to a plain
//! JSON parse for records written before compression was introduced.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Errors that can occur while compressing a value
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),
}

/// Encode a value to compressed text (JSON -> gzip -> base64)
pub fn compress<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    let json = serde_json::to_vec(value)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;

    Ok(STANDARD.encode(compressed))
}

/// Decode text produced by [`compress`], or a legacy uncompressed JSON record
///
/// Returns `None` if the input is neither. Never panics on corrupt input.
pub fn decompress<T: DeserializeOwned>(text: &str) -> Option<T> {
    if let Some(value) = decode_compressed(text) {
        return Some(value);
    }

    match serde_json::from_str(text) {
        Ok(value) => {
            tracing::debug!("Decoded legacy uncompressed record");
            Some(value)
        }
        Err(e) => {
            tracing::debug!("Record is neither compressed nor legacy JSON: {}", e);
            None
        }
    }
}

fn decode_compressed<T: DeserializeOwned>(text: &str) -> Option<T> {
    let compressed = STANDARD.decode(text.trim()).ok()?;

    let mut decoder = GzDecoder::new(&compressed[..]);
    let mut json = Vec::new();
    decoder.read_to_end(&mut json).ok()?;

    serde_json::from_slice(&json).ok()
}
