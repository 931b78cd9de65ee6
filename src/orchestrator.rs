//! Top-level scan coordination: validate, resolve, fast path, slow path, aggregate.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandRunner, SystemRunner};
use crate::config::{EnvHints, ScanConfig};
use crate::error::{Result, ScanError};
use crate::fastpath::FastPathScanner;
use crate::fingerprint::Fingerprinter;
use crate::netdetect::{AddressResolver, InterfaceSource};
use crate::scanner::{dedup_devices, SlowPathScanner};
use crate::transport::{NetTransport, Transport};
use crate::types::{ScanRequest, ScanResult};

/// Orchestrator wired to real sockets and real subprocesses.
pub type SystemOrchestrator = ScanOrchestrator<NetTransport, SystemRunner>;

pub struct ScanOrchestrator<T, R> {
    resolver: AddressResolver<R>,
    fast: FastPathScanner<T, R>,
    slow: SlowPathScanner<T, R>,
    config: Arc<ScanConfig>,
}

impl SystemOrchestrator {
    pub fn system(config: ScanConfig) -> Result<Self> {
        let transport = Arc::new(NetTransport::new(config.fingerprint.http_body_limit_bytes)?);
        let runner = Arc::new(SystemRunner::new(config.fast_output_limit_bytes));
        Ok(Self::new(transport, runner, config, EnvHints::from_env()))
    }
}

impl<T: Transport, R: CommandRunner> ScanOrchestrator<T, R> {
    pub fn new(transport: Arc<T>, runner: Arc<R>, config: ScanConfig, hints: EnvHints) -> Self {
        let config = Arc::new(config);
        let fingerprinter = Arc::new(Fingerprinter::new(
            transport.clone(),
            runner.clone(),
            config.fingerprint.clone(),
        ));
        Self {
            resolver: AddressResolver::new(runner.clone(), config.clone(), hints),
            fast: FastPathScanner::new(runner, fingerprinter.clone(), config.clone()),
            slow: SlowPathScanner::new(transport, fingerprinter, config.clone()),
            config,
        }
    }

    /// Replace interface enumeration for local-network detection.
    pub fn with_interfaces(mut self, interfaces: InterfaceSource) -> Self {
        self.resolver = self.resolver.with_interfaces(interfaces);
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub async fn execute(&self, req: &ScanRequest) -> Result<ScanResult> {
        self.execute_with_cancel(req, CancellationToken::new()).await
    }

    /// Run one scan. Validation and range checks happen before any network I/O. A scan that
    /// finds nothing is a successful, empty result.
    pub async fn execute_with_cancel(
        &self,
        req: &ScanRequest,
        cancel: CancellationToken,
    ) -> Result<ScanResult> {
        let started = Instant::now();
        let validated = req.validate()?;
        let ips = self.resolver.resolve(&validated).await?;
        let ports = validated.ports;
        tracing::info!(hosts = ips.len(), ports = ?ports, "scan started");

        let mut errors = Vec::new();
        let mut devices = Vec::new();

        if self.config.fast_path_enabled {
            match self.fast.scan(&ips, &ports, &cancel).await {
                Ok(out) => {
                    tracing::info!(found = out.devices.len(), "fast path finished");
                    errors.extend(out.errors);
                    devices = out.devices;
                }
                Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
                Err(e @ ScanError::ToolUnavailable { .. }) => {
                    tracing::info!(error = %e, "fast path unavailable, using slow path");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "fast path failed, using slow path");
                    errors.push(e.to_string());
                }
            }
        }

        if devices.is_empty() {
            let out = self.slow.scan(&ips, &ports, &cancel).await?;
            tracing::info!(
                found = out.devices.len(),
                probed = out.hosts_probed,
                "slow path finished"
            );
            errors.extend(out.errors);
            devices = out.devices;
        }

        let mut printers = dedup_devices(devices);
        printers.retain(|d| d.has_scanner);
        printers.sort_by_key(|d| (u32::from(d.ip), d.port));
        errors.truncate(self.config.result_error_cap);

        let result = ScanResult {
            printers,
            total_scanned: u32::try_from(ips.len()).unwrap_or(u32::MAX),
            scan_duration_ms: u32::try_from(started.elapsed().as_millis()).unwrap_or(u32::MAX),
            errors,
        };
        tracing::info!(
            found = result.printers.len(),
            total = result.total_scanned,
            duration_ms = result.scan_duration_ms,
            "scan finished"
        );
        Ok(result)
    }
}
