use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::fingerprint::Fingerprinter;
use crate::transport::Transport;
use crate::types::DeviceDescriptor;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// What the in-process scan produced. Always usable, even when some hosts failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlowPathOutcome {
    pub devices: Vec<DeviceDescriptor>,
    pub errors: Vec<String>,
    pub hosts_probed: u64,
}

/// Counters and accumulators shared by every host task of a run.
#[derive(Clone, Debug, Default)]
pub struct SharedProgress {
    pub hosts_done: Arc<AtomicU64>,
    pub found: Arc<AtomicU64>,
    pub devices: Arc<Mutex<Vec<DeviceDescriptor>>>,
    pub errors: Arc<Mutex<Vec<String>>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

/// In-process fallback scanner.
///
/// - Hosts are processed in sequential batches; hosts within a batch run concurrently.
/// - Each host tries the requested ports in order and stops at the first open one.
/// - Connect time is bounded by `ScanConfig::connect_timeout` (at most 1.5s).
/// - Found devices and errors go through mutex-guarded accumulators.
pub struct SlowPathScanner<T, R> {
    transport: Arc<T>,
    fingerprinter: Arc<Fingerprinter<T, R>>,
    config: Arc<ScanConfig>,
}

impl<T: Transport, R: crate::command::CommandRunner> SlowPathScanner<T, R> {
    pub fn new(
        transport: Arc<T>,
        fingerprinter: Arc<Fingerprinter<T, R>>,
        config: Arc<ScanConfig>,
    ) -> Self {
        Self {
            transport,
            fingerprinter,
            config,
        }
    }

    pub async fn scan(
        &self,
        ips: &[Ipv4Addr],
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> Result<SlowPathOutcome> {
        self.scan_with_shared(ips, ports, cancel, SharedProgress::new())
            .await
    }

    /// Variant that reports into caller-owned counters, so progress can be observed while the
    /// scan runs. Only cancellation makes it fail.
    pub async fn scan_with_shared(
        &self,
        ips: &[Ipv4Addr],
        ports: &[u16],
        cancel: &CancellationToken,
        shared: SharedProgress,
    ) -> Result<SlowPathOutcome> {
        let batch_size = self.config.slow_batch_size.max(1);
        let timeout = self.config.connect_timeout();
        let error_cap = self.config.slow_error_cap;
        let batches = ips.len().div_ceil(batch_size);

        for (batch, chunk) in ips.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let mut set = JoinSet::new();
            for &ip in chunk {
                let transport = self.transport.clone();
                let fingerprinter = self.fingerprinter.clone();
                let ports = ports.to_vec();
                let cancel = cancel.clone();
                let shared = shared.clone();

                set.spawn(async move {
                    let (hit, failures) = tokio::select! {
                        _ = cancel.cancelled() => (None, Vec::new()),
                        host = scan_host(&*transport, &fingerprinter, ip, &ports, timeout) => host,
                    };
                    if !failures.is_empty() {
                        let mut errors = shared.errors.lock().await;
                        let room = error_cap.saturating_sub(errors.len());
                        errors.extend(failures.into_iter().take(room));
                    }
                    if let Some(device) = hit {
                        let mut guard = shared.devices.lock().await;
                        if !guard.iter().any(|d| d.key() == device.key()) {
                            guard.push(device);
                            shared.found.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    shared.hosts_done.fetch_add(1, Ordering::Relaxed);
                    ip
                });
            }

            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    tracing::warn!(batch, error = %e, "host task failed");
                    let mut errors = shared.errors.lock().await;
                    if errors.len() < error_cap {
                        errors.push(format!("host probe task failed: {e}"));
                    }
                }
            }

            tracing::debug!(
                batch,
                batches,
                hosts = chunk.len(),
                found = shared.found.load(Ordering::Relaxed),
                "slow path batch done"
            );
            if batch + 1 < batches {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                    _ = time::sleep(self.config.batch_pause()) => {}
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let devices = shared.devices.lock().await.clone();
        let errors = shared.errors.lock().await.clone();
        Ok(SlowPathOutcome {
            devices,
            errors,
            hosts_probed: shared.hosts_done.load(Ordering::Relaxed),
        })
    }
}

/// Probe `ports` in order; fingerprint the first that accepts a connection.
///
/// Refused and timed-out ports are skipped silently. Any other connect failure is returned
/// alongside the result.
async fn scan_host<T: Transport, R: crate::command::CommandRunner>(
    transport: &T,
    fingerprinter: &Fingerprinter<T, R>,
    ip: Ipv4Addr,
    ports: &[u16],
    timeout: std::time::Duration,
) -> (Option<DeviceDescriptor>, Vec<String>) {
    let mut failures = Vec::new();
    for &port in ports {
        let latency = match transport.connect(SocketAddrV4::new(ip, port), timeout).await {
            Ok(latency) => latency,
            Err(e) if e.is_closed_port() => continue,
            Err(e) => {
                tracing::debug!(%ip, port, error = %e, "connect failed");
                failures.push(e.to_string());
                continue;
            }
        };
        let fp = fingerprinter.fingerprint(ip, port).await;
        if !fp.indicates_scanner() {
            tracing::debug!(%ip, port, "open port is not a scanner");
            return (None, failures);
        }
        let mut device = DeviceDescriptor::from_fingerprint(ip, port, fp);
        device.response_time_ms = Some(u32::try_from(latency.as_millis()).unwrap_or(u32::MAX));
        tracing::info!(%ip, port, vendor = ?device.vendor, "scanner found");
        return (Some(device), failures);
    }
    (None, failures)
}

/// Remove repeated `(ip, port)` keys, keeping the first occurrence.
pub fn dedup_devices(devices: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|d| seen.insert(d.key()))
        .collect()
}
