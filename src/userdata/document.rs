//! User-data documents
//!
//! [`parse_document`] turns the raw blob a datasource hands over into a tree
//! of [`Part`]s. The processor later flattens that tree into a [`Document`]:
//! an ordered list of leaf parts, each with a filename.

use base64::Engine;
use std::borrow::Cow;
use tracing::debug;

use super::mime;
use super::types::{ContentType, NOT_MULTIPART, looks_like_base64, normalize_mime};
use crate::BootstrapError;
use crate::datasources::decode::{decompress_if_needed, is_gzip};

/// How far into a blob to look for MIME headers
const MIME_SNIFF_WINDOW: usize = 4096;

/// One piece of user-data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    /// Lower-cased MIME type without parameters
    pub content_type: String,
    pub filename: Option<String>,
    pub payload: Vec<u8>,
    /// Headers other than the structural MIME ones, names lower-cased
    pub headers: Vec<(String, String)>,
    /// Sections of a `multipart/*` part
    pub children: Vec<Part>,
}

impl Part {
    pub fn new(content_type: impl AsRef<str>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: normalize_mime(content_type.as_ref()),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// A `multipart/*` part holding `children`
    pub fn container(content_type: impl AsRef<str>, children: Vec<Part>) -> Self {
        Self {
            content_type: normalize_mime(content_type.as_ref()),
            children,
            ..Default::default()
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_lowercase(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type.starts_with("multipart/")
    }

    /// Known type of this part, if any
    pub fn kind(&self) -> Option<ContentType> {
        ContentType::from_mime(&self.content_type)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Leaf parts in document order
    pub fn leaves(&self) -> Vec<&Part> {
        if !self.is_multipart() {
            return vec![self];
        }
        self.children.iter().flat_map(Part::leaves).collect()
    }
}

/// Flattened user-data ready for dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    parts: Vec<Part>,
    attached: usize,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a leaf part, naming it `part-NNN` if it has no filename
    pub fn attach(&mut self, mut part: Part) {
        self.attached += 1;
        if part.filename.is_none() {
            part.filename = Some(format!("part-{:03}", self.attached));
        }
        self.parts.push(part);
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<Part> {
        self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Parse a raw user-data blob
///
/// Gzip and base64-wrapped blobs are unwrapped first. Anything carrying MIME
/// headers is parsed as a MIME message; any other blob becomes a single
/// `text/x-not-multipart` part whose real type is sniffed later.
pub fn parse_document(raw: &[u8]) -> Result<Part, BootstrapError> {
    let data = decompress_if_needed(raw)
        .map_err(|e| BootstrapError::Parse(format!("user-data: {e}")))?;
    let data = unwrap_base64(data);

    let window = &data[..data.len().min(MIME_SNIFF_WINDOW)];
    let head = String::from_utf8_lossy(window).to_lowercase();
    let head = head.trim_start();

    if head.starts_with("content-type: multipart/") || head.contains("mime-version:") {
        debug!("User-data is a MIME document");
        return mime::parse_message(&data);
    }

    Ok(Part::new(NOT_MULTIPART, data))
}

/// Decoded bytes when the blob is base64 of something recognizable
fn unwrap_base64(data: Vec<u8>) -> Vec<u8> {
    if !looks_like_base64(&data) {
        return data;
    }

    let clean: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(clean) else {
        return data;
    };

    if is_gzip(&decoded) {
        match decompress_if_needed(&decoded) {
            Ok(inflated) => {
                debug!("User-data was base64 wrapped gzip");
                return inflated;
            }
            Err(_) => return data,
        }
    }

    let lower = String::from_utf8_lossy(&decoded[..decoded.len().min(MIME_SNIFF_WINDOW)])
        .to_lowercase();
    if ContentType::sniff(&decoded).is_some() || lower.contains("mime-version:") {
        debug!("User-data was base64 wrapped");
        return decoded;
    }

    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::decode::{Encoding, encode};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_bare_script_is_placeholder() {
        let part = parse_document(b"#!/bin/sh\necho hi\n").unwrap();
        assert_eq!(part.content_type, "text/x-not-multipart");
        assert_eq!(part.payload, b"#!/bin/sh\necho hi\n");
    }

    #[test]
    fn test_gzip_blob() {
        let part = parse_document(&gzip(b"#cloud-config\na: 1\n")).unwrap();
        assert_eq!(part.text(), "#cloud-config\na: 1\n");
    }

    #[test]
    fn test_base64_blob() {
        let encoded = encode(Encoding::Base64, b"#cloud-config\na: 1\n").unwrap();
        let part = parse_document(encoded.as_bytes()).unwrap();
        assert_eq!(part.text(), "#cloud-config\na: 1\n");

        let encoded = encode(Encoding::GzipBase64, b"#!/bin/sh\n").unwrap();
        let part = parse_document(encoded.as_bytes()).unwrap();
        assert_eq!(part.text(), "#!/bin/sh\n");
    }

    #[test]
    fn test_base64_of_unknown_kept_raw() {
        let part = parse_document(b"aGVsbG8gd29ybGQ=").unwrap();
        assert_eq!(part.payload, b"aGVsbG8gd29ybGQ=");
    }

    #[test]
    fn test_mime_document() {
        let doc = b"Content-Type: multipart/mixed; boundary=x\nMIME-Version: 1.0\n\n--x\nContent-Type: text/cloud-config\n\na: 1\n--x--\n";
        let part = parse_document(doc).unwrap();
        assert!(part.is_multipart());
        assert_eq!(part.leaves().len(), 1);
    }

    #[test]
    fn test_corrupt_gzip_is_parse_error() {
        let err = parse_document(&[0x1f, 0x8b, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, BootstrapError::Parse(_)));
    }

    #[test]
    fn test_attach_names_parts() {
        let mut doc = Document::new();
        doc.attach(Part::new("text/x-shellscript", "a"));
        doc.attach(Part::new("text/x-shellscript", "b").with_filename("named.sh"));
        doc.attach(Part::new("text/x-shellscript", "c"));

        let names: Vec<_> = doc.parts().iter().map(|p| p.filename.clone().unwrap()).collect();
        assert_eq!(names, ["part-001", "named.sh", "part-003"]);
    }
}
