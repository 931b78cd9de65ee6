use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mfp_scan_rs::config::ScanConfig;
use mfp_scan_rs::orchestrator::SystemOrchestrator;
use mfp_scan_rs::registry::{DeviceRegistry, NewDevice};
use mfp_scan_rs::server::{self, AppState};
use mfp_scan_rs::types::{ScanRequest, ScanResult};
use mfp_scan_rs::ports;

/// Find network scanners and multifunction printers on the local network.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "mfp-scan-rs",
    version,
    about = "Find network scanners and multifunction printers on the local network.",
    long_about = None
)]
struct Cli {
    /// CIDR to scan, /24 or narrower (e.g. 192.168.1.0/24).
    #[arg(long = "network-range")]
    network_range: Option<String>,

    /// First address of an explicit range (requires --end-ip).
    #[arg(long = "start-ip")]
    start_ip: Option<String>,

    /// Last address of an explicit range, inclusive.
    #[arg(long = "end-ip")]
    end_ip: Option<String>,

    /// Comma separated ports or ranges. Defaults to 9100,631,515,80,443.
    #[arg(long)]
    ports: Option<String>,

    /// Ports list file (one port or range per line). Ignored when --ports is given.
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// JSON file with scan tunables.
    #[arg(long, env = "MFPSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Connect timeout in milliseconds (capped at 1500).
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Never invoke nmap; probe every host in-process.
    #[arg(long = "no-fast-path", default_value_t = false)]
    no_fast_path: bool,

    /// Never sweep whole private ranges when local networks cannot be detected.
    #[arg(long = "no-private-sweep", default_value_t = false)]
    no_private_sweep: bool,

    /// Write results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Device registry file. Found devices are saved to it after a scan.
    #[arg(long)]
    register: Option<PathBuf>,

    /// Serve the HTTP API on this address instead of scanning once (e.g. 127.0.0.1:8080).
    #[arg(long)]
    serve: Option<String>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid --log-level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&cli)?;
    tracing::debug!(?config, "effective configuration");
    let orchestrator = Arc::new(SystemOrchestrator::system(config)?);

    if let Some(bind) = cli.serve.as_deref() {
        let registry = match cli.register.as_deref() {
            Some(path) => DeviceRegistry::open(path).await?,
            None => DeviceRegistry::in_memory(),
        };
        let state = AppState::new(orchestrator, Arc::new(registry));
        tokio::select! {
            res = server::spawn_server(bind, state) => res?,
            _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        }
        return Ok(());
    }

    let request = build_request(&cli)?;
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    let result = orchestrator.execute_with_cancel(&request, cancel).await?;
    print_results_table(&result);

    if let Some(path) = cli.output.as_deref() {
        write_results_json(path, &result)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        println!("Wrote JSON results to {}", path.display());
    }

    if let Some(path) = cli.register.as_deref() {
        let registry = DeviceRegistry::open(path).await?;
        for device in &result.printers {
            registry.upsert(NewDevice::confirm(device, None)).await?;
        }
        println!(
            "Registered {} device(s) in {}",
            result.printers.len(),
            path.display()
        );
    }

    Ok(())
}

fn build_config(cli: &Cli) -> Result<ScanConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => ScanConfig::load(path)?,
        None => ScanConfig::default(),
    };
    if let Some(ms) = cli.timeout_ms {
        config.connect_timeout_ms = ms;
    }
    if cli.no_fast_path {
        config.fast_path_enabled = false;
    }
    if cli.no_private_sweep {
        config.private_sweep_enabled = false;
    }
    Ok(config)
}

fn build_request(cli: &Cli) -> Result<ScanRequest> {
    let ports = match (&cli.ports, &cli.ports_file) {
        (Some(list), _) => ports::parse_ports_str(list)?,
        (None, Some(path)) => ports::load_ports_from_path(path)?,
        (None, None) => ports::default_ports(),
    };
    Ok(ScanRequest {
        network_range: cli.network_range.clone(),
        start_ip: cli.start_ip.clone(),
        end_ip: cli.end_ip.clone(),
        ports: ports.into_iter().map(i64::from).collect(),
    })
}

fn print_results_table(result: &ScanResult) {
    let cell = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    let mut ip_w = "ip".len();
    let mut vendor_w = "vendor".len();
    let mut model_w = "model".len();
    let mut type_w = "type".len();
    for d in &result.printers {
        ip_w = ip_w.max(d.ip.to_string().len());
        vendor_w = vendor_w.max(cell(&d.vendor).len());
        model_w = model_w.max(cell(&d.model).len());
        type_w = type_w.max(cell(&d.scanner_type).chars().count());
    }
    let port_w = 5usize;
    let lat_w = "latency_ms".len();

    println!(
        "\nScanners found: {} (hosts scanned: {}, {} ms)",
        result.printers.len(),
        result.total_scanned,
        result.scan_duration_ms
    );
    println!(
        "{:<ip_w$}  {:>port_w$}  {:<vendor_w$}  {:<model_w$}  {:<type_w$}  {:>lat_w$}",
        "ip", "port", "vendor", "model", "type", "latency_ms",
    );
    println!(
        "{:-<ip_w$}  {:-<port_w$}  {:-<vendor_w$}  {:-<model_w$}  {:-<type_w$}  {:-<lat_w$}",
        "", "", "", "", "", "",
    );
    for d in &result.printers {
        let latency = d
            .response_time_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<ip_w$}  {:>port_w$}  {:<vendor_w$}  {:<model_w$}  {:<type_w$}  {:>lat_w$}",
            d.ip.to_string(),
            d.port,
            cell(&d.vendor),
            cell(&d.model),
            cell(&d.scanner_type),
            latency,
        );
    }
    for e in &result.errors {
        println!("error: {e}");
    }
}

fn write_results_json(path: &Path, result: &ScanResult) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, result)?;
    Ok(())
}
