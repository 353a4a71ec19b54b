//! Network readiness waiting
//!
//! Metadata may ask the instance to hold off until it has an IPv4 and/or
//! IPv6 address:
//!
//! ```yaml
//! wait-on-network:
//!   ipv4: true
//!   ipv6: "no"
//! ```

use serde_json::{Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::hostinfo::{HostInfo, HostInfoSource};
use crate::BootstrapError;

/// Default delay between readiness polls
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Which address families must be present before setup continues
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WaitOnNetwork {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl WaitOnNetwork {
    /// Read the `wait-on-network` mapping from metadata
    pub fn from_metadata(metadata: &Map<String, Value>) -> Self {
        let Some(wait) = metadata.get("wait-on-network") else {
            return Self::default();
        };

        Self {
            ipv4: wait.get("ipv4").map(parse_flag).unwrap_or(false),
            ipv6: wait.get("ipv6").map(parse_flag).unwrap_or(false),
        }
    }

    pub fn any(&self) -> bool {
        self.ipv4 || self.ipv6
    }

    /// Whether `host` satisfies every requested family
    pub fn is_satisfied(&self, host: &HostInfo) -> bool {
        (!self.ipv4 || host.has_ipv4()) && (!self.ipv6 || host.has_ipv6())
    }
}

fn parse_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "yes" | "on" | "1"
        ),
        _ => false,
    }
}

/// Poll `source` until the requested families are up
///
/// A family counts as up when any interface holds an address of it that is
/// neither loopback nor link-local (169.254.0.0/16, fe80::/10). Returns the
/// snapshot that satisfied the condition. With nothing requested a single
/// snapshot is taken. There is no overall timeout; `cancel` is the
/// only way out of a wait that never succeeds.
pub async fn wait_on_network(
    source: &dyn HostInfoSource,
    wait: WaitOnNetwork,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<HostInfo, BootstrapError> {
    if !wait.any() {
        return source.snapshot().await;
    }

    info!(
        "Waiting on network (ipv4: {}, ipv6: {})",
        wait.ipv4, wait.ipv6
    );

    let mut attempts = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(BootstrapError::Cancelled("waiting on network".into()));
        }

        attempts += 1;
        match source.snapshot().await {
            Ok(host) if wait.is_satisfied(&host) => {
                info!("Network ready after {} check(s)", attempts);
                return Ok(host);
            }
            Ok(host) => debug!(
                "Network not ready (ipv4: {}, ipv6: {})",
                host.has_ipv4(),
                host.has_ipv6()
            ),
            Err(e) => warn!("Failed to read host network state: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BootstrapError::Cancelled("waiting on network".into()));
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::hostinfo::NetInterface;
    use crate::datasources::mock::MockHostInfo;
    use serde_json::json;

    fn with_v4() -> HostInfo {
        let iface = NetInterface::new("eth0").with_addr("10.0.0.5".parse().unwrap(), 24);
        HostInfo::from_interfaces(None, vec![iface], Some("eth0"), None)
    }

    #[test]
    fn test_from_metadata() {
        let md = json!({"wait-on-network": {"ipv4": true, "ipv6": "no"}});
        assert_eq!(
            WaitOnNetwork::from_metadata(md.as_object().unwrap()),
            WaitOnNetwork { ipv4: true, ipv6: false }
        );

        let md = json!({"wait-on-network": {"ipv6": "Yes"}});
        assert_eq!(
            WaitOnNetwork::from_metadata(md.as_object().unwrap()),
            WaitOnNetwork { ipv4: false, ipv6: true }
        );

        assert!(!WaitOnNetwork::from_metadata(&Map::new()).any());
    }

    #[tokio::test]
    async fn test_no_wait_takes_one_snapshot() {
        let source = MockHostInfo::new(vec![HostInfo::default()]);
        let cancel = CancellationToken::new();
        wait_on_network(&source, WaitOnNetwork::default(), DEFAULT_INTERVAL, &cancel)
            .await
            .unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_waits_until_ipv4_appears() {
        let source = MockHostInfo::new(vec![HostInfo::default(), HostInfo::default(), with_v4()]);
        let cancel = CancellationToken::new();
        let wait = WaitOnNetwork { ipv4: true, ipv6: false };

        let host = wait_on_network(&source, wait, Duration::from_millis(1), &cancel)
            .await
            .unwrap();
        assert!(host.has_ipv4());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn test_unrequested_family_ignored() {
        let source = MockHostInfo::new(vec![with_v4()]);
        let cancel = CancellationToken::new();
        let wait = WaitOnNetwork { ipv4: true, ipv6: false };

        wait_on_network(&source, wait, Duration::from_millis(1), &cancel)
            .await
            .unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_wait() {
        let source = MockHostInfo::new(vec![HostInfo::default()]);
        let cancel = CancellationToken::new();
        let wait = WaitOnNetwork { ipv4: false, ipv6: true };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = wait_on_network(&source, wait, Duration::from_millis(5), &cancel).await;
        assert!(matches!(result, Err(BootstrapError::Cancelled(_))));
    }
}
