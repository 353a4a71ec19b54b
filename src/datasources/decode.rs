//! Value decoding for transport payloads
//!
//! Any value read from a transport may be paired with a `<key>.encoding`
//! sibling naming how it was packed by the host.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use tracing::{debug, warn};

use crate::BootstrapError;

/// Gzip magic bytes
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Encoding declared for a transport value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// Plain text, returned unchanged
    #[default]
    None,
    /// `base64` / `b64`
    Base64,
    /// `gzip+base64` / `gz+b64`
    GzipBase64,
}

impl Encoding {
    /// Parse an encoding tag; unknown tags fall back to [`Encoding::None`]
    pub fn parse(tag: Option<&str>) -> Self {
        let Some(tag) = tag else {
            return Self::None;
        };

        match tag.trim().to_lowercase().as_str() {
            "" | "none" => Self::None,
            "base64" | "b64" => Self::Base64,
            "gzip+base64" | "gz+b64" => Self::GzipBase64,
            other => {
                warn!("Unknown encoding '{}', treating value as plain text", other);
                Self::None
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Base64 => "base64",
            Self::GzipBase64 => "gzip+base64",
        }
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode `data` according to `encoding`
///
/// `key` only names the value in errors and logs.
pub fn decode(key: &str, encoding: Encoding, data: &[u8]) -> Result<Vec<u8>, BootstrapError> {
    debug!("Decoding {} as {}", key, encoding);

    match encoding {
        Encoding::None => Ok(data.to_vec()),
        Encoding::Base64 => decode_base64(key, data),
        Encoding::GzipBase64 => {
            let compressed = decode_base64(key, data)?;
            gunzip(&compressed).map_err(|e| BootstrapError::decode(key, e.to_string()))
        }
    }
}

/// Decode a text value with an optional encoding tag, returning text
pub fn decode_value(key: &str, tag: Option<&str>, data: &str) -> Result<String, BootstrapError> {
    let raw = decode(key, Encoding::parse(tag), data.as_bytes())?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Encode `data`; the inverse of [`decode`]
pub fn encode(encoding: Encoding, data: &[u8]) -> Result<String, BootstrapError> {
    match encoding {
        Encoding::None => Ok(String::from_utf8_lossy(data).into_owned()),
        Encoding::Base64 => Ok(STANDARD.encode(data)),
        Encoding::GzipBase64 => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            Ok(STANDARD.encode(encoder.finish()?))
        }
    }
}

/// Whether `data` starts with the gzip magic bytes
pub fn is_gzip(data: &[u8]) -> bool {
    data.starts_with(&GZIP_MAGIC)
}

/// Decompress gzip data if needed
pub fn decompress_if_needed(data: &[u8]) -> Result<Vec<u8>, BootstrapError> {
    if is_gzip(data) {
        debug!("Decompressing gzip payload");
        gunzip(data).map_err(|e| BootstrapError::decode("payload", e.to_string()))
    } else {
        Ok(data.to_vec())
    }
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

fn decode_base64(key: &str, data: &[u8]) -> Result<Vec<u8>, BootstrapError> {
    let clean: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    STANDARD
        .decode(&clean)
        .map_err(|e| BootstrapError::decode(key, format!("base64: {e}")))
}
