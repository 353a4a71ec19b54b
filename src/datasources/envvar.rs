//! Environment-variable transport
//!
//! Containers and test rigs can pass the same keys as the guestinfo channel
//! through the environment, e.g. `VMX_GUESTINFO_METADATA` together with
//! `VMX_GUESTINFO_METADATA_ENCODING`. The transport is only considered when
//! `VMX_GUESTINFO` itself is set.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::decode::{self, Encoding};
use super::{Transport, TransportData};
use crate::BootstrapError;
use crate::config::EnvVarConfig;

const TRANSPORT_NAME: &str = "envvar";

/// Environment-variable transport over a snapshot of the environment
#[derive(Debug, Clone)]
pub struct EnvVar {
    prefix: String,
    namespace: String,
    vars: HashMap<String, String>,
}

impl EnvVar {
    /// Snapshot the process environment
    pub fn from_env(config: &EnvVarConfig) -> Self {
        Self::with_vars(config, std::env::vars().collect())
    }

    /// Use an explicit variable map
    pub fn with_vars(config: &EnvVarConfig, vars: HashMap<String, String>) -> Self {
        Self {
            prefix: config.prefix.to_uppercase(),
            namespace: config.namespace.to_uppercase(),
            vars,
        }
    }

    /// The `<PREFIX>_<NAMESPACE>` switch is set
    pub fn is_enabled(&self) -> bool {
        self.vars
            .contains_key(&format!("{}_{}", self.prefix, self.namespace))
    }

    /// Raw value of a key; `None` when unset, blank or `---`
    pub fn get_value(&self, key: &str) -> Option<&str> {
        let name = self.key_name(key);
        let value = self.vars.get(&name)?.trim_end_matches(['\r', '\n']);

        if value.trim().is_empty() || value.trim() == "---" {
            debug!("No usable value in {}", name);
            return None;
        }
        Some(value)
    }

    /// Decoded value using the `<KEY>_ENCODING` sibling
    pub fn get_decoded(&self, key: &str) -> Result<Option<Vec<u8>>, BootstrapError> {
        let Some(value) = self.get_value(key) else {
            return Ok(None);
        };
        let tag = self.get_value(&format!("{key}.encoding"));
        decode::decode(key, Encoding::parse(tag), value.as_bytes()).map(Some)
    }

    /// Decoded user/vendor data; a bad value is dropped on its own
    fn get_optional(&self, key: &str) -> Option<Vec<u8>> {
        self.get_decoded(key).unwrap_or_else(|e| {
            warn!("Ignoring {}: {}", self.key_name(key), e);
            None
        })
    }
}

#[async_trait]
impl Transport for EnvVar {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn requires_platform(&self) -> bool {
        false
    }

    fn key_name(&self, key: &str) -> String {
        format!("{}_{}_{}", self.prefix, self.namespace, key)
            .to_uppercase()
            .replace('.', "_")
    }

    async fn fetch(&self, _cancel: &CancellationToken) -> Result<TransportData, BootstrapError> {
        if !self.is_enabled() {
            debug!("{}_{} not set, envvar transport disabled", self.prefix, self.namespace);
            return Ok(TransportData::default());
        }

        Ok(TransportData {
            metadata: self
                .get_decoded("metadata")?
                .map(|v| String::from_utf8_lossy(&v).into_owned()),
            userdata: self.get_optional("userdata"),
            vendordata: self.get_optional("vendordata"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envvar(vars: &[(&str, &str)]) -> EnvVar {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvVar::with_vars(&EnvVarConfig::default(), vars)
    }

    #[test]
    fn test_key_name() {
        let env = envvar(&[]);
        assert_eq!(env.key_name("metadata"), "VMX_GUESTINFO_METADATA");
        assert_eq!(env.key_name("metadata.encoding"), "VMX_GUESTINFO_METADATA_ENCODING");
    }

    #[tokio::test]
    async fn test_disabled_without_switch() {
        let env = envvar(&[("VMX_GUESTINFO_METADATA", "instance-id: i-1")]);
        assert!(!env.is_enabled());
        let data = env.fetch(&CancellationToken::new()).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_with_encoding() {
        let env = envvar(&[
            ("VMX_GUESTINFO", "1"),
            ("VMX_GUESTINFO_METADATA", "aW5zdGFuY2UtaWQ6IGktMQo="),
            ("VMX_GUESTINFO_METADATA_ENCODING", "b64"),
            ("VMX_GUESTINFO_USERDATA", "#cloud-config\n"),
            ("VMX_GUESTINFO_VENDORDATA", "---"),
        ]);

        let data = env.fetch(&CancellationToken::new()).await.unwrap();
        assert_eq!(data.metadata.as_deref(), Some("instance-id: i-1\n"));
        assert_eq!(data.userdata.as_deref(), Some(&b"#cloud-config"[..]));
        assert_eq!(data.vendordata, None);
    }

    #[tokio::test]
    async fn test_bad_encoding_fails_fetch() {
        let env = envvar(&[
            ("VMX_GUESTINFO", "1"),
            ("VMX_GUESTINFO_METADATA", "!!!"),
            ("VMX_GUESTINFO_METADATA_ENCODING", "base64"),
        ]);
        assert!(env.fetch(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_bad_vendordata_keeps_metadata() {
        let env = envvar(&[
            ("VMX_GUESTINFO", "1"),
            ("VMX_GUESTINFO_METADATA", "instance-id: i-1"),
            ("VMX_GUESTINFO_USERDATA", "#!/bin/sh\n"),
            ("VMX_GUESTINFO_VENDORDATA", "!!!"),
            ("VMX_GUESTINFO_VENDORDATA_ENCODING", "base64"),
        ]);

        let data = env.fetch(&CancellationToken::new()).await.unwrap();
        assert_eq!(data.metadata.as_deref(), Some("instance-id: i-1"));
        assert_eq!(data.userdata.as_deref(), Some(&b"#!/bin/sh"[..]));
        assert_eq!(data.vendordata, None);
    }
}
