//! Tunables for a scan run.
//!
//! Every timeout and batch size the engine uses lives here so the CLI and the HTTP surface
//! can share one definition. Values load from a JSON file; absent fields keep their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Slow-path connect timeout ceiling.
pub const MAX_CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub connect_timeout_ms: u64,
    pub slow_batch_size: usize,
    pub batch_pause_ms: u64,
    pub slow_error_cap: usize,
    pub result_error_cap: usize,

    pub fast_path_enabled: bool,
    pub fast_batch_threshold: usize,
    pub fast_batch_size: usize,
    pub fast_batch_timeout_ms: u64,
    pub fast_per_host_timeout_ms: u64,
    pub fast_output_limit_bytes: usize,
    pub fingerprint_concurrency: usize,

    pub fingerprint: FingerprintConfig,

    pub route_table_path: PathBuf,
    pub private_sweep_enabled: bool,
    pub private_sweep_timeout_ms: u64,
    pub tool_timeout_ms: u64,

    /// Finished scan sessions are dropped this long after they finish.
    pub session_ttl_secs: u64,
    pub session_prune_interval_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1500,
            slow_batch_size: 100,
            batch_pause_ms: 100,
            slow_error_cap: 50,
            result_error_cap: 10,

            fast_path_enabled: true,
            fast_batch_threshold: 100,
            fast_batch_size: 50,
            fast_batch_timeout_ms: 60_000,
            fast_per_host_timeout_ms: 1_000,
            fast_output_limit_bytes: 10 * 1024 * 1024,
            fingerprint_concurrency: 16,

            fingerprint: FingerprintConfig::default(),

            route_table_path: PathBuf::from("/proc/net/route"),
            private_sweep_enabled: true,
            private_sweep_timeout_ms: 30_000,
            tool_timeout_ms: 5_000,

            session_ttl_secs: 3_600,
            session_prune_interval_ms: 60_000,
        }
    }
}

impl ScanConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Connect timeout for the slow path, never above [`MAX_CONNECT_TIMEOUT`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms).min(MAX_CONNECT_TIMEOUT)
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn fast_batch_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_batch_timeout_ms)
    }

    /// Timeout for a single unbatched fast-path invocation over `hosts` addresses.
    pub fn fast_single_timeout(&self, hosts: usize) -> Duration {
        let scaled = self.fast_per_host_timeout_ms.saturating_mul(hosts.max(1) as u64);
        Duration::from_millis(scaled.min(self.fast_batch_timeout_ms))
    }

    pub fn private_sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.private_sweep_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Never zero; `tokio::time::interval` rejects a zero period.
    pub fn session_prune_interval(&self) -> Duration {
        Duration::from_millis(self.session_prune_interval_ms.max(1))
    }
}

/// Per-probe settings for fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    pub snmp_community: String,
    pub snmp_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub ipp_timeout_ms: u64,
    pub ipp_port: u16,
    pub raw_tcp_timeout_ms: u64,
    pub tls_timeout_ms: u64,
    pub http_body_limit_bytes: usize,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            snmp_community: "public".to_string(),
            snmp_timeout_ms: 2_000,
            http_timeout_ms: 2_000,
            ipp_timeout_ms: 3_000,
            ipp_port: 631,
            raw_tcp_timeout_ms: 3_000,
            tls_timeout_ms: 2_000,
            http_body_limit_bytes: 256 * 1024,
        }
    }
}

impl FingerprintConfig {
    pub fn snmp_timeout(&self) -> Duration {
        Duration::from_millis(self.snmp_timeout_ms)
    }
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
    pub fn ipp_timeout(&self) -> Duration {
        Duration::from_millis(self.ipp_timeout_ms)
    }
    pub fn raw_tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.raw_tcp_timeout_ms)
    }
    pub fn tls_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_timeout_ms)
    }
}

/// Environment-derived hints about the network namespace we run in, captured once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvHints {
    pub in_container: bool,
    pub networks: Vec<Ipv4Net>,
}

/// Explicit CIDR list, comma or whitespace separated.
pub const NETWORK_HINT_VAR: &str = "MFPSCAN_NETWORK_HINT";

impl EnvHints {
    pub fn from_env() -> Self {
        let in_container = ["KUBERNETES_SERVICE_HOST", "container", "DOCKER_CONTAINER"]
            .iter()
            .any(|v| std::env::var_os(v).is_some())
            || Path::new("/.dockerenv").exists();
        let networks = std::env::var(NETWORK_HINT_VAR)
            .map(|v| parse_network_hint(&v))
            .unwrap_or_default();
        Self {
            in_container,
            networks,
        }
    }
}

/// Parse a hint list, skipping entries that are not IPv4 CIDRs.
pub fn parse_network_hint(raw: &str) -> Vec<Ipv4Net> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse::<Ipv4Net>() {
            Ok(n) => Some(n.trunc()),
            Err(_) => {
                tracing::warn!(entry = s, "ignoring malformed network hint");
                None
            }
        })
        .collect()
}
