//! User-data content types
//!
//! Parts carry their content type as a plain lower-cased MIME string, since
//! part handlers can claim arbitrary types. This module holds the known
//! vocabulary and the prefix table used to sniff the type of a part whose
//! declared type is only a placeholder.

use std::fmt;

pub const CLOUD_CONFIG: &str = "text/cloud-config";
pub const CLOUD_CONFIG_ARCHIVE: &str = "text/cloud-config-archive";
pub const SHELL_SCRIPT: &str = "text/x-shellscript";
pub const SHELL_SCRIPT_PER_BOOT: &str = "text/x-shellscript-per-boot";
pub const SHELL_SCRIPT_PER_INSTANCE: &str = "text/x-shellscript-per-instance";
pub const SHELL_SCRIPT_PER_ONCE: &str = "text/x-shellscript-per-once";
pub const CLOUD_BOOTHOOK: &str = "text/cloud-boothook";
pub const UPSTART_JOB: &str = "text/upstart-job";
pub const PART_HANDLER: &str = "text/part-handler";
pub const INCLUDE_URL: &str = "text/x-include-url";
pub const INCLUDE_ONCE_URL: &str = "text/x-include-once-url";
pub const JINJA: &str = "text/jinja2";
pub const PGP_ARMORED: &str = "text/x-pgp-armored";
pub const PLAIN_TEXT: &str = "text/plain";
pub const NOT_MULTIPART: &str = "text/x-not-multipart";
pub const GZIP: &str = "application/gzip";
pub const X_GZIP: &str = "application/x-gzip";

/// Known user-data content types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    CloudConfig,
    CloudConfigArchive,
    ShellScript,
    ShellScriptPerBoot,
    ShellScriptPerInstance,
    ShellScriptPerOnce,
    CloudBoothook,
    UpstartJob,
    PartHandler,
    IncludeUrl,
    IncludeOnceUrl,
    JinjaTemplate,
    PgpArmored,
    /// Placeholder for parts without a real declared type
    PlainText,
    /// Placeholder for a blob that was not a MIME document
    NotMultipart,
    Gzip,
    Multipart,
}

/// Payload prefixes, longest first so that `#include-once` is not taken
/// for `#include`
const SNIFF_TABLE: &[(&str, ContentType)] = &[
    ("-----begin pgp message-----", ContentType::PgpArmored),
    ("#cloud-config-archive", ContentType::CloudConfigArchive),
    ("## template: jinja", ContentType::JinjaTemplate),
    ("## template:jinja", ContentType::JinjaTemplate),
    ("#cloud-boothook", ContentType::CloudBoothook),
    ("#include-once", ContentType::IncludeOnceUrl),
    ("#cloud-config", ContentType::CloudConfig),
    ("#part-handler", ContentType::PartHandler),
    ("#upstart-job", ContentType::UpstartJob),
    ("#include", ContentType::IncludeUrl),
    ("#!", ContentType::ShellScript),
];

/// Longest prefix the sniffer needs to look at
const SNIFF_WINDOW: usize = 64;

impl ContentType {
    /// MIME type string for this content type
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::CloudConfig => CLOUD_CONFIG,
            Self::CloudConfigArchive => CLOUD_CONFIG_ARCHIVE,
            Self::ShellScript => SHELL_SCRIPT,
            Self::ShellScriptPerBoot => SHELL_SCRIPT_PER_BOOT,
            Self::ShellScriptPerInstance => SHELL_SCRIPT_PER_INSTANCE,
            Self::ShellScriptPerOnce => SHELL_SCRIPT_PER_ONCE,
            Self::CloudBoothook => CLOUD_BOOTHOOK,
            Self::UpstartJob => UPSTART_JOB,
            Self::PartHandler => PART_HANDLER,
            Self::IncludeUrl => INCLUDE_URL,
            Self::IncludeOnceUrl => INCLUDE_ONCE_URL,
            Self::JinjaTemplate => JINJA,
            Self::PgpArmored => PGP_ARMORED,
            Self::PlainText => PLAIN_TEXT,
            Self::NotMultipart => NOT_MULTIPART,
            Self::Gzip => GZIP,
            Self::Multipart => "multipart/mixed",
        }
    }

    /// Known type for a MIME string, ignoring parameters and case
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = normalize_mime(mime);
        let kind = match mime.as_str() {
            CLOUD_CONFIG | "text/x-cloud-config" => Self::CloudConfig,
            CLOUD_CONFIG_ARCHIVE => Self::CloudConfigArchive,
            SHELL_SCRIPT | "text/x-sh" => Self::ShellScript,
            SHELL_SCRIPT_PER_BOOT => Self::ShellScriptPerBoot,
            SHELL_SCRIPT_PER_INSTANCE => Self::ShellScriptPerInstance,
            SHELL_SCRIPT_PER_ONCE => Self::ShellScriptPerOnce,
            CLOUD_BOOTHOOK => Self::CloudBoothook,
            UPSTART_JOB => Self::UpstartJob,
            PART_HANDLER => Self::PartHandler,
            INCLUDE_URL => Self::IncludeUrl,
            INCLUDE_ONCE_URL => Self::IncludeOnceUrl,
            JINJA | "text/x-jinja2" => Self::JinjaTemplate,
            PGP_ARMORED => Self::PgpArmored,
            PLAIN_TEXT => Self::PlainText,
            NOT_MULTIPART => Self::NotMultipart,
            GZIP | X_GZIP => Self::Gzip,
            s if s.starts_with("multipart/") => Self::Multipart,
            _ => return None,
        };
        Some(kind)
    }

    /// Sniff the type from the first bytes of a payload
    pub fn sniff(payload: &[u8]) -> Option<Self> {
        let start = payload
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(payload.len());
        let end = payload.len().min(start + SNIFF_WINDOW);
        let head = String::from_utf8_lossy(&payload[start..end]).to_lowercase();

        SNIFF_TABLE
            .iter()
            .find(|(prefix, _)| head.starts_with(prefix))
            .map(|(_, kind)| *kind)
    }

    /// Whether parts of this type need their real type sniffed
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::PlainText | Self::NotMultipart)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mime_type())
    }
}

/// Lower-cased MIME essence without parameters
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';').next().unwrap_or(mime).trim().to_lowercase()
}

/// Whether the data looks like base64 text rather than prose or a script
pub fn looks_like_base64(data: &[u8]) -> bool {
    let all_valid = data.iter().all(|&b| {
        b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=' || b.is_ascii_whitespace()
    });
    if !all_valid {
        return false;
    }

    let significant = data.iter().filter(|b| !b.is_ascii_whitespace()).count();
    if significant < 4 {
        return false;
    }

    let has_word_spaces = data
        .windows(3)
        .any(|w| w[0].is_ascii_alphabetic() && w[1] == b' ' && w[2].is_ascii_alphabetic());

    !has_word_spaces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_cloud_config() {
        assert_eq!(
            ContentType::sniff(b"#cloud-config\nhostname: test"),
            Some(ContentType::CloudConfig)
        );
        assert_eq!(
            ContentType::sniff(b"  \n#Cloud-Config\n"),
            Some(ContentType::CloudConfig)
        );
    }

    #[test]
    fn test_sniff_prefers_longest_prefix() {
        assert_eq!(
            ContentType::sniff(b"#include-once\nhttp://x/a"),
            Some(ContentType::IncludeOnceUrl)
        );
        assert_eq!(
            ContentType::sniff(b"#include http://x/a"),
            Some(ContentType::IncludeUrl)
        );
        assert_eq!(
            ContentType::sniff(b"#cloud-config-archive\n- a"),
            Some(ContentType::CloudConfigArchive)
        );
    }

    #[test]
    fn test_sniff_scripts_and_others() {
        assert_eq!(
            ContentType::sniff(b"#!/bin/sh\necho hi"),
            Some(ContentType::ShellScript)
        );
        assert_eq!(
            ContentType::sniff(b"#cloud-boothook\n#!/bin/sh"),
            Some(ContentType::CloudBoothook)
        );
        assert_eq!(
            ContentType::sniff(b"## template: jinja\n#cloud-config"),
            Some(ContentType::JinjaTemplate)
        );
        assert_eq!(
            ContentType::sniff(b"-----BEGIN PGP MESSAGE-----\n\nhQEM"),
            Some(ContentType::PgpArmored)
        );
        assert_eq!(
            ContentType::sniff(b"#part-handler\n"),
            Some(ContentType::PartHandler)
        );
    }

    #[test]
    fn test_sniff_unknown() {
        assert_eq!(ContentType::sniff(b"hostname: myserver"), None);
        assert_eq!(ContentType::sniff(b""), None);
        assert_eq!(ContentType::sniff(&[0x1f, 0x8b, 0x08]), None);
    }

    #[test]
    fn test_from_mime() {
        assert_eq!(
            ContentType::from_mime("text/x-shellscript; charset=utf-8"),
            Some(ContentType::ShellScript)
        );
        assert_eq!(
            ContentType::from_mime("Multipart/Mixed; boundary=abc"),
            Some(ContentType::Multipart)
        );
        assert_eq!(ContentType::from_mime("application/x-gzip"), Some(ContentType::Gzip));
        assert_eq!(ContentType::from_mime("text/x-custom"), None);
    }

    #[test]
    fn test_placeholders() {
        assert!(ContentType::PlainText.is_placeholder());
        assert!(ContentType::NotMultipart.is_placeholder());
        assert!(!ContentType::ShellScript.is_placeholder());
    }

    #[test]
    fn test_looks_like_base64() {
        assert!(looks_like_base64(b"SGVsbG8gV29ybGQh"));
        assert!(looks_like_base64(b"SGVsbG8g\nV29ybGQh"));
        assert!(!looks_like_base64(b"Hello World!"));
        assert!(!looks_like_base64(b"#!/bin/sh"));
    }
}
