//! MIME parsing for user-data documents
//!
//! Only what user-data needs: headers with continuation lines, multipart
//! bodies (nested), `Content-Disposition` filenames and the `base64` /
//! `quoted-printable` transfer encodings.

use base64::Engine;
use tracing::debug;

use super::document::Part;
use super::types::{PLAIN_TEXT, normalize_mime};
use crate::BootstrapError;

/// Deepest multipart nesting accepted
const MAX_NESTING: usize = 16;

/// Headers consumed by the parser and not carried on the part
const STRUCTURAL_HEADERS: [&str; 4] = [
    "content-type",
    "content-disposition",
    "content-transfer-encoding",
    "mime-version",
];

/// Parse a MIME message into a part tree
///
/// A multipart message becomes a container part whose children are the
/// sections; a single-part message becomes one leaf part. Bodies are kept
/// as bytes, so 8bit payloads pass through unchanged.
pub fn parse_message(data: &[u8]) -> Result<Part, BootstrapError> {
    parse_entity(data, 0)
}

fn parse_entity(data: &[u8], depth: usize) -> Result<Part, BootstrapError> {
    if depth > MAX_NESTING {
        return Err(BootstrapError::Parse(format!(
            "multipart nesting deeper than {MAX_NESTING}"
        )));
    }

    let (headers, body) = split_headers(data);
    let raw_type = header(&headers, "content-type").unwrap_or(PLAIN_TEXT);
    let content_type = normalize_mime(raw_type);

    if content_type.starts_with("multipart/") {
        let boundary = extract_param(raw_type, "boundary")
            .or_else(|| guess_boundary(body))
            .ok_or_else(|| {
                BootstrapError::Parse(format!("{content_type} message without a boundary"))
            })?;
        debug!("MIME boundary: {}", boundary);

        let children = split_sections(body, &boundary)
            .into_iter()
            .filter(|section| !section.iter().all(u8::is_ascii_whitespace))
            .map(|section| parse_entity(section, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Parsed {} MIME parts", children.len());
        let mut part = Part::container(content_type, children);
        part.headers = extra_headers(headers);
        return Ok(part);
    }

    let filename = header(&headers, "content-disposition").and_then(|cd| extract_param(cd, "filename"));
    let payload = match header(&headers, "content-transfer-encoding")
        .map(|e| e.trim().to_lowercase())
        .as_deref()
    {
        Some("base64") => decode_base64(body)?,
        Some("quoted-printable") => decode_quoted_printable(body),
        _ => body.to_vec(),
    };

    let mut part = Part::new(content_type, payload);
    part.filename = filename;
    part.headers = extra_headers(headers);
    Ok(part)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split an entity into its headers and body
fn split_headers(data: &[u8]) -> (Vec<(String, String)>, &[u8]) {
    let first_line = data.split(|b| *b == b'\n').next().unwrap_or_default();

    let (head, body) = if let Some(body) = data.strip_prefix(b"\r\n") {
        (&b""[..], body)
    } else if let Some(body) = data.strip_prefix(b"\n") {
        (&b""[..], body)
    } else if let Some(idx) = find(data, b"\r\n\r\n") {
        (&data[..idx], &data[idx + 4..])
    } else if let Some(idx) = find(data, b"\n\n") {
        (&data[..idx], &data[idx + 2..])
    } else if first_line.contains(&b':') {
        (data, &b""[..])
    } else {
        (&b""[..], data)
    };

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in String::from_utf8_lossy(head).lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    (headers, body)
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn extra_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| !STRUCTURAL_HEADERS.contains(&name.as_str()))
        .collect()
}

/// Value of a `name=value` or `name="value"` header parameter
fn extract_param(header: &str, name: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Boundary taken from the first delimiter-looking line of the body
fn guess_boundary(body: &[u8]) -> Option<String> {
    body.split(|b| *b == b'\n').find_map(|line| {
        let line = std::str::from_utf8(line).ok()?;
        let candidate = line.strip_prefix("--")?.trim();
        if candidate.is_empty() || candidate.starts_with('-') || candidate.contains(':') {
            return None;
        }
        Some(candidate.to_string())
    })
}

/// Sections between `--boundary` delimiter lines, up to `--boundary--`
///
/// The line break before a delimiter belongs to the delimiter.
fn split_sections<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{boundary}");
    let closing = format!("--{boundary}--");

    let mut sections = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in body.split_inclusive(|b| *b == b'\n') {
        let trimmed = line.trim_ascii_end();
        if trimmed == delimiter.as_bytes() || trimmed == closing.as_bytes() {
            if let Some(s) = start {
                sections.push(strip_line_break(&body[s..offset]));
            }
            if trimmed == closing.as_bytes() {
                return sections;
            }
            start = Some(offset + line.len());
        }
        offset += line.len();
    }

    if let Some(s) = start.filter(|s| *s < body.len()) {
        sections.push(&body[s..]);
    }
    sections
}

fn strip_line_break(section: &[u8]) -> &[u8] {
    section
        .strip_suffix(b"\r\n")
        .or_else(|| section.strip_suffix(b"\n"))
        .unwrap_or(section)
}

fn decode_base64(data: &[u8]) -> Result<Vec<u8>, BootstrapError> {
    let clean: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(clean)
        .map_err(|e| BootstrapError::Parse(format!("base64 part body: {e}")))
}

fn decode_quoted_printable(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'=' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        match bytes.get(i + 1..i + 3) {
            Some([b'\r', b'\n']) => i += 3,
            Some([b'\n', _]) => i += 2,
            None if bytes.get(i + 1) == Some(&b'\n') => i += 2,
            Some(hex) => match std::str::from_utf8(hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                Some(byte) => {
                    out.push(byte);
                    i += 3;
                }
                None => {
                    out.push(b'=');
                    i += 1;
                }
            },
            None => {
                out.push(b'=');
                i += 1;
            }
        }
    }

    out
}

/// Render leaf parts as a `multipart/mixed` message
pub fn create_multipart(parts: &[Part], boundary: &str) -> String {
    let mut output = String::new();
    output.push_str("MIME-Version: 1.0\r\n");
    output.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n"
    ));

    for part in parts {
        output.push_str(&format!("--{boundary}\r\n"));
        output.push_str(&format!("Content-Type: {}\r\n", part.content_type));
        if let Some(filename) = &part.filename {
            output.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{filename}\"\r\n"
            ));
        }
        for (name, value) in &part.headers {
            output.push_str(&format!("{name}: {value}\r\n"));
        }
        output.push_str("\r\n");
        output.push_str(&part.text());
        output.push_str("\r\n");
    }

    output.push_str(&format!("--{boundary}--\r\n"));
    output
}
