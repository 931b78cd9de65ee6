//! Bulk reachability through an external `nmap` binary.
//!
//! Large host sets are split into sequential batches so a single child process never holds the
//! whole sweep. Open (ip, port) pairs from the greppable output are fingerprinted with bounded
//! concurrency and only scanner-capable devices are kept.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::command::{args, CommandRunner};
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::fingerprint::Fingerprinter;
use crate::transport::Transport;
use crate::types::DeviceDescriptor;

pub const NMAP: &str = "nmap";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FastPathOutcome {
    pub devices: Vec<DeviceDescriptor>,
    pub errors: Vec<String>,
}

/// `(ip, port)` pairs reported open in `nmap -oG` output, restricted to `wanted` ports.
pub fn parse_greppable(text: &str, wanted: &[u16]) -> Vec<(Ipv4Addr, u16)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.strip_prefix("Host:") else {
            continue;
        };
        let Some(ip) = rest
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<Ipv4Addr>().ok())
        else {
            continue;
        };
        let Some((_, ports)) = rest.split_once("Ports:") else {
            continue;
        };
        // Fields after Ports are tab separated ("Ignored State: ...").
        let ports = ports.split('\t').next().unwrap_or("");
        for entry in ports.split(',') {
            let mut fields = entry.trim().split('/');
            let port = fields.next().and_then(|p| p.parse::<u16>().ok());
            let state = fields.next();
            if let (Some(port), Some("open")) = (port, state) {
                if wanted.contains(&port) && seen.insert((ip, port)) {
                    out.push((ip, port));
                }
            }
        }
    }
    out
}

fn port_list(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub struct FastPathScanner<T, R> {
    runner: Arc<R>,
    fingerprinter: Arc<Fingerprinter<T, R>>,
    config: Arc<ScanConfig>,
}

impl<T: Transport, R: CommandRunner> FastPathScanner<T, R> {
    pub fn new(
        runner: Arc<R>,
        fingerprinter: Arc<Fingerprinter<T, R>>,
        config: Arc<ScanConfig>,
    ) -> Self {
        Self {
            runner,
            fingerprinter,
            config,
        }
    }

    /// Fails with [`ScanError::ToolUnavailable`] when `nmap` cannot be run at all, and with
    /// [`ScanError::Cancelled`] when `cancel` fires. A failing batch is logged and skipped.
    pub async fn scan(
        &self,
        ips: &[Ipv4Addr],
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> Result<FastPathOutcome> {
        let mut outcome = FastPathOutcome::default();
        if ips.is_empty() || ports.is_empty() {
            return Ok(outcome);
        }

        let (batch_size, timeout) = if ips.len() > self.config.fast_batch_threshold {
            (
                self.config.fast_batch_size.max(1),
                self.config.fast_batch_timeout(),
            )
        } else {
            (ips.len(), self.config.fast_single_timeout(ips.len()))
        };

        let mut seen = HashSet::new();
        let mut pairs = Vec::new();
        for (batch, chunk) in ips.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let mut argv = args(["-p"]);
            argv.push(port_list(ports));
            argv.extend(args(["--open", "-oG", "-"]));
            argv.extend(chunk.iter().map(Ipv4Addr::to_string));

            let run = tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::Cancelled),
                r = self.runner.run(NMAP, &argv, timeout) => r,
            };
            match run {
                Ok(out) => {
                    let found = parse_greppable(&out.stdout, ports);
                    tracing::debug!(batch, hosts = chunk.len(), open = found.len(), "nmap batch done");
                    pairs.extend(found.into_iter().filter(|p| seen.insert(*p)));
                }
                Err(e @ ScanError::ToolUnavailable { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(batch, error = %e, "nmap batch failed, continuing");
                    outcome.errors.push(format!("fast path batch {batch}: {e}"));
                }
            }
        }

        outcome.devices = self.fingerprint_pairs(pairs, cancel).await?;
        Ok(outcome)
    }

    async fn fingerprint_pairs(
        &self,
        pairs: Vec<(Ipv4Addr, u16)>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceDescriptor>> {
        let sem = Arc::new(Semaphore::new(self.config.fingerprint_concurrency.max(1)));
        let mut set = JoinSet::new();
        for (ip, port) in pairs {
            let sem = sem.clone();
            let fingerprinter = self.fingerprinter.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                let fp = fingerprinter.fingerprint(ip, port).await;
                fp.indicates_scanner()
                    .then(|| DeviceDescriptor::from_fingerprint(ip, port, fp))
            });
        }

        let mut devices = Vec::new();
        while let Some(res) = set.join_next().await {
            match res {
                Ok(Some(d)) => devices.push(d),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "fingerprint task failed"),
            }
        }
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, ScriptedRunner};
    use crate::transport::FixtureTransport;

    const GREPPABLE: &str = "# Nmap 7.94 scan initiated as: nmap -p 9100,631 --open -oG - 10.0.0.5 10.0.0.6\n\
Host: 10.0.0.5 ()\tStatus: Up\n\
Host: 10.0.0.5 ()\tPorts: 9100/open/tcp//jetdirect///, 631/open/tcp//ipp///, 22/open/tcp//ssh///\tIgnored State: closed (1)\n\
Host: 10.0.0.6 (printer.lan)\tPorts: 631/filtered/tcp//ipp///\n\
# Nmap done at Mon Oct 19 10:00:00 2026 -- 2 IP addresses (1 host up) scanned in 0.31 seconds\n";

    #[test]
    fn greppable_output_open_ports_only() {
        let pairs = parse_greppable(GREPPABLE, &[9100, 631]);
        assert_eq!(
            pairs,
            vec![
                (Ipv4Addr::new(10, 0, 0, 5), 9100),
                (Ipv4Addr::new(10, 0, 0, 5), 631)
            ]
        );
        assert!(parse_greppable("garbage\nHost: nope\n", &[9100]).is_empty());
    }

    fn scanner(
        transport: FixtureTransport,
        runner: ScriptedRunner,
        config: ScanConfig,
    ) -> (FastPathScanner<FixtureTransport, ScriptedRunner>, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let config = Arc::new(config);
        let fp = Arc::new(Fingerprinter::new(
            Arc::new(transport),
            runner.clone(),
            config.fingerprint.clone(),
        ));
        (FastPathScanner::new(runner.clone(), fp, config), runner)
    }

    fn hosts(n: u8) -> Vec<Ipv4Addr> {
        (1..=n).map(|i| Ipv4Addr::new(10, 0, 1, i)).collect()
    }

    #[tokio::test]
    async fn missing_tool_is_reported() {
        let (fast, _) = scanner(FixtureTransport::new(), ScriptedRunner::new(), ScanConfig::default());
        let err = fast
            .scan(&hosts(3), &[9100], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::ToolUnavailable { .. }));
    }

    #[tokio::test]
    async fn large_sets_are_batched() {
        let runner = ScriptedRunner::new().with(NMAP, |_| Ok(CommandOutput::ok("")));
        let (fast, runner) = scanner(FixtureTransport::new(), runner, ScanConfig::default());
        let out = fast
            .scan(&hosts(120), &[9100], &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.devices.is_empty());
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        // 50 + 50 + 20 hosts, each after "-p 9100 --open -oG -"
        let sizes: Vec<usize> = calls.iter().map(|(_, a)| a.len() - 5).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
    }

    #[tokio::test]
    async fn failed_batch_does_not_stop_the_rest() {
        let runner = ScriptedRunner::new().with(NMAP, |argv| {
            if argv.iter().any(|a| a == "10.0.1.1") {
                Err(ScanError::Command {
                    program: NMAP.into(),
                    reason: "exit status 1".into(),
                })
            } else {
                Ok(CommandOutput::ok(
                    "Host: 10.0.1.60 ()\tPorts: 9100/open/tcp//jetdirect///\n",
                ))
            }
        });
        let ip = Ipv4Addr::new(10, 0, 1, 60);
        let transport = FixtureTransport::new()
            .open(ip, 9100)
            .page("http://10.0.1.60/", 200, "<title>Epson WF-4830 Series</title>");
        let (fast, _) = scanner(transport, runner, ScanConfig::default());
        let out = fast
            .scan(&hosts(120), &[9100], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.devices.len(), 1);
        let d = &out.devices[0];
        assert_eq!((d.ip, d.port), (ip, 9100));
        assert_eq!(d.vendor.as_deref(), Some("Epson"));
        assert_eq!(d.scanner_type.as_deref(), Some("Raw TCP Scanner"));
    }

    #[tokio::test]
    async fn non_scanner_devices_are_dropped() {
        let runner = ScriptedRunner::new().with_stdout(
            NMAP,
            "Host: 10.0.1.2 ()\tPorts: 80/open/tcp//http///\n",
        );
        let transport = FixtureTransport::new()
            .open(Ipv4Addr::new(10, 0, 1, 2), 80)
            .page("http://10.0.1.2:80/", 200, "<title>Router admin</title>");
        let (fast, _) = scanner(transport, runner, ScanConfig::default());
        let out = fast
            .scan(&hosts(3), &[80], &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.devices.is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let runner = ScriptedRunner::new().with_stdout(NMAP, "");
        let (fast, runner) = scanner(FixtureTransport::new(), runner, ScanConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fast.scan(&hosts(3), &[9100], &cancel).await.unwrap_err();
        assert!(matches!(err, ScanError::Cancelled));
        assert_eq!(runner.calls_to(NMAP), 0);
    }
}
