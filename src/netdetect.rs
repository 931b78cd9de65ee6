//! Address-space resolution: CIDR, explicit ranges and local-network auto-detection.
//!
//! Loopback and link-local addresses never leave this module. Local detection walks a chain of
//! strategies and stops at the first that produces at least one address; the last link in the
//! chain always succeeds.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};

use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;
use regex::Regex;

use crate::command::{args, CommandRunner};
use crate::config::{EnvHints, ScanConfig};
use crate::error::{Result, ScanError};
use crate::types::{ScanTarget, ValidatedRequest};

/// Loosest prefix accepted for an explicit CIDR.
pub const MIN_PREFIX: u8 = 24;
/// Largest allowed `end - start` for an explicit range.
pub const MAX_RANGE_SPAN: u32 = 1000;
/// Hosts taken from any single detected subnet.
pub const SUBNET_HOST_CAP: usize = 254;

/// Private ranges swept when every structured detection method failed.
pub const PRIVATE_RANGES: [&str; 3] = ["192.168.0.0/16", "10.0.0.0/8", "172.16.0.0/12"];

/// Last-resort /24s: the most common private subnets.
pub const FALLBACK_NETWORKS: [&str; 7] = [
    "192.168.0.0/24",
    "192.168.1.0/24",
    "192.168.2.0/24",
    "10.0.0.0/24",
    "10.0.1.0/24",
    "172.16.0.0/24",
    "172.17.0.0/24",
];

/// Loopback, link-local and the unspecified address are never scanned.
pub fn is_excluded(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, 24).expect("/24 is always valid")
}

/// Every host address of `net`, excluding network and broadcast.
pub fn expand_network(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if end <= start.saturating_add(1) {
        return Vec::new();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

/// Host addresses of a detected subnet, truncated to the first [`SUBNET_HOST_CAP`].
pub fn expand_capped(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let net = net.trunc();
    if net.prefix_len() < MIN_PREFIX {
        tracing::warn!(
            network = %net,
            cap = SUBNET_HOST_CAP,
            "subnet larger than /24, scanning only its first hosts"
        );
    }
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if end <= start.saturating_add(1) {
        return Vec::new();
    }
    (start + 1..end)
        .take(SUBNET_HOST_CAP)
        .map(Ipv4Addr::from)
        .collect()
}

/// Hosts of an explicit CIDR. Prefixes looser than /24 are refused.
pub fn network_hosts(net: Ipv4Net) -> Result<Vec<Ipv4Addr>> {
    if net.prefix_len() < MIN_PREFIX {
        let requested = (1u64 << (32 - u32::from(net.prefix_len()))) - 2;
        return Err(ScanError::RangeTooLarge {
            requested,
            limit: SUBNET_HOST_CAP as u64,
        });
    }
    Ok(expand_network(net.trunc())
        .into_iter()
        .filter(|ip| !is_excluded(*ip))
        .collect())
}

/// Every address from `start` to `end` inclusive, in ascending order.
pub fn range_hosts(start: Ipv4Addr, end: Ipv4Addr) -> Result<Vec<Ipv4Addr>> {
    let (s, e) = (u32::from(start), u32::from(end));
    if e < s {
        return Err(ScanError::validation("endIp", "must not be lower than startIp"));
    }
    if e - s > MAX_RANGE_SPAN {
        return Err(ScanError::RangeTooLarge {
            requested: u64::from(e - s) + 1,
            limit: u64::from(MAX_RANGE_SPAN) + 1,
        });
    }
    Ok((s..=e)
        .map(Ipv4Addr::from)
        .filter(|ip| !is_excluded(*ip))
        .collect())
}

/// Deduplicate while keeping first-seen order, dropping excluded addresses.
pub fn dedup_hosts(ips: impl IntoIterator<Item = Ipv4Addr>) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    ips.into_iter()
        .filter(|ip| !is_excluded(*ip) && seen.insert(*ip))
        .collect()
}

fn expand_all(nets: &[Ipv4Net]) -> Vec<Ipv4Addr> {
    dedup_hosts(
        nets.iter()
            .filter(|n| !is_excluded(n.addr()))
            .flat_map(|n| expand_capped(*n)),
    )
}

/// One IPv4 address bound to a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl LocalInterface {
    /// The subnet to scan for this interface. Point-to-point style /31 and /32 assignments
    /// fall back to the surrounding /24.
    pub fn network(&self) -> Ipv4Net {
        match Ipv4Net::new(self.addr, self.prefix) {
            Ok(n) if self.prefix <= 30 => n.trunc(),
            _ => ipv4_to_default_cidr(self.addr),
        }
    }
}

/// Non-loopback IPv4 interfaces as reported by the OS.
pub fn local_interfaces() -> std::io::Result<Vec<LocalInterface>> {
    let mut out = Vec::new();
    for iface in get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        if let IfAddr::V4(v4) = &iface.addr {
            if is_excluded(v4.ip) {
                continue;
            }
            let prefix = ipnet::ipv4_mask_to_prefix(v4.netmask).unwrap_or(24);
            out.push(LocalInterface {
                name: iface.name.clone(),
                addr: v4.ip,
                prefix,
            });
        }
    }
    Ok(out)
}

fn inet_cidr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"inet (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})/(\d{1,2})").expect("valid pattern")
    })
}

fn inet_addr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"inet (?:addr:)?(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})").expect("valid pattern")
    })
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").expect("valid pattern")
    })
}

/// Parse `ip -o -4 addr show` (or plain `ip addr show`) into interface/CIDR pairs.
pub fn parse_ip_addr_output(text: &str) -> Vec<LocalInterface> {
    let mut out = Vec::new();
    for line in text.lines() {
        let Some(caps) = inet_cidr_re().captures(line) else { continue };
        let (Ok(addr), Ok(prefix)) = (caps[1].parse::<Ipv4Addr>(), caps[2].parse::<u8>()) else {
            continue;
        };
        if prefix > 32 || is_excluded(addr) {
            continue;
        }
        // one-line format: "2: eth0    inet 10.0.0.5/24 ..."
        let name = line
            .split_whitespace()
            .nth(1)
            .filter(|_| line.trim_start().starts_with(|c: char| c.is_ascii_digit()))
            .unwrap_or("")
            .trim_end_matches(':')
            .to_string();
        out.push(LocalInterface { name, addr, prefix });
    }
    out
}

/// Parse legacy `ifconfig` output; both `inet addr:X` and `inet X` forms.
pub fn parse_ifconfig_output(text: &str) -> Vec<Ipv4Addr> {
    inet_addr_re()
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<Ipv4Addr>().ok())
        .filter(|ip| !is_excluded(*ip))
        .collect()
}

/// Interfaces carrying a default route in `/proc/net/route`.
pub fn parse_route_table(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in text.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 3 {
            continue;
        }
        if cols[1] == "00000000" && !out.iter().any(|i| i == cols[0]) {
            out.push(cols[0].to_string());
        }
    }
    out
}

/// Whitespace-separated addresses as printed by `hostname -I`.
pub fn parse_hostname_ips(text: &str) -> Vec<Ipv4Addr> {
    text.split_whitespace()
        .filter_map(|t| t.parse::<Ipv4Addr>().ok())
        .filter(|ip| !is_excluded(*ip))
        .collect()
}

/// Responsive hosts from an `nmap -sn` ping sweep.
pub fn parse_ping_sweep(text: &str) -> Vec<Ipv4Addr> {
    text.lines()
        .filter(|l| l.starts_with("Nmap scan report for"))
        .filter_map(|l| ipv4_re().captures_iter(l).last())
        .filter_map(|c| c[1].parse::<Ipv4Addr>().ok())
        .filter(|ip| !is_excluded(*ip))
        .collect()
}

pub fn fallback_networks() -> Vec<Ipv4Net> {
    FALLBACK_NETWORKS
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect()
}

/// Where local interface information comes from.
#[derive(Debug, Clone)]
pub enum InterfaceSource {
    System,
    Fixed(Vec<LocalInterface>),
}

impl InterfaceSource {
    fn list(&self) -> Vec<LocalInterface> {
        match self {
            InterfaceSource::System => local_interfaces().unwrap_or_else(|e| {
                tracing::debug!(error = %e, "interface enumeration failed");
                Vec::new()
            }),
            InterfaceSource::Fixed(v) => v.clone(),
        }
    }
}

/// Turns a validated request into the concrete list of addresses to scan.
pub struct AddressResolver<R> {
    runner: Arc<R>,
    config: Arc<ScanConfig>,
    hints: EnvHints,
    interfaces: InterfaceSource,
}

impl<R: CommandRunner> AddressResolver<R> {
    pub fn new(runner: Arc<R>, config: Arc<ScanConfig>, hints: EnvHints) -> Self {
        Self {
            runner,
            config,
            hints,
            interfaces: InterfaceSource::System,
        }
    }

    pub fn with_interfaces(mut self, interfaces: InterfaceSource) -> Self {
        self.interfaces = interfaces;
        self
    }

    pub async fn resolve(&self, req: &ValidatedRequest) -> Result<Vec<Ipv4Addr>> {
        match req.target {
            ScanTarget::Network(net) => network_hosts(net),
            ScanTarget::Range { start, end } => range_hosts(start, end),
            ScanTarget::LocalNetwork => Ok(self.detect_local().await),
        }
    }

    /// Local-network auto-detection. Never fails.
    pub async fn detect_local(&self) -> Vec<Ipv4Addr> {
        let ifaces = self.interfaces.list();

        let ips = self.from_interfaces(&ifaces).await;
        if !ips.is_empty() {
            tracing::info!(hosts = ips.len(), "local networks from interface enumeration");
            return ips;
        }

        let ips = self.from_ifconfig().await;
        if !ips.is_empty() {
            tracing::info!(hosts = ips.len(), "local networks from ifconfig");
            return ips;
        }

        let ips = self.from_route_table(&ifaces).await;
        if !ips.is_empty() {
            tracing::info!(hosts = ips.len(), "local networks from default routes");
            return ips;
        }

        let ips = self.from_container_hints().await;
        if !ips.is_empty() {
            tracing::info!(hosts = ips.len(), "local networks from container hints");
            return ips;
        }

        if self.config.private_sweep_enabled {
            let ips = self.from_private_sweep().await;
            if !ips.is_empty() {
                tracing::info!(hosts = ips.len(), "responsive hosts from private-range sweep");
                return ips;
            }
        }

        let ips = expand_all(&fallback_networks());
        tracing::warn!(
            hosts = ips.len(),
            "could not detect local networks, scanning common private subnets"
        );
        ips
    }

    async fn tool_stdout(&self, program: &str, argv: Vec<String>) -> Option<String> {
        match self
            .runner
            .run(program, &argv, self.config.tool_timeout())
            .await
        {
            Ok(out) if out.success() => Some(out.stdout),
            Ok(out) => {
                tracing::debug!(program, code = ?out.exit_code, "tool exited unsuccessfully");
                None
            }
            Err(e) => {
                tracing::debug!(program, error = %e, "tool unavailable");
                None
            }
        }
    }

    async fn from_interfaces(&self, ifaces: &[LocalInterface]) -> Vec<Ipv4Addr> {
        let mut nets: Vec<Ipv4Net> = ifaces.iter().map(LocalInterface::network).collect();
        if nets.is_empty() {
            if let Some(out) = self
                .tool_stdout("ip", args(["-o", "-4", "addr", "show"]))
                .await
            {
                nets = parse_ip_addr_output(&out)
                    .iter()
                    .map(LocalInterface::network)
                    .collect();
            }
        }
        for n in &nets {
            tracing::debug!(network = %n, "detected subnet");
        }
        expand_all(&nets)
    }

    async fn from_ifconfig(&self) -> Vec<Ipv4Addr> {
        let Some(out) = self.tool_stdout("ifconfig", Vec::new()).await else {
            return Vec::new();
        };
        let nets: Vec<Ipv4Net> = parse_ifconfig_output(&out)
            .into_iter()
            .map(ipv4_to_default_cidr)
            .collect();
        expand_all(&nets)
    }

    async fn from_route_table(&self, ifaces: &[LocalInterface]) -> Vec<Ipv4Addr> {
        let text = match tokio::fs::read_to_string(&self.config.route_table_path).await {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(
                    path = %self.config.route_table_path.display(),
                    error = %e,
                    "route table unreadable"
                );
                return Vec::new();
            }
        };
        let mut nets = Vec::new();
        for name in parse_route_table(&text) {
            let known: Vec<Ipv4Net> = ifaces
                .iter()
                .filter(|i| i.name == name)
                .map(LocalInterface::network)
                .collect();
            if !known.is_empty() {
                nets.extend(known);
                continue;
            }
            if let Some(out) = self
                .tool_stdout("ip", args(["-o", "-4", "addr", "show", "dev", name.as_str()]))
                .await
            {
                nets.extend(parse_ip_addr_output(&out).iter().map(LocalInterface::network));
            }
        }
        expand_all(&nets)
    }

    async fn from_container_hints(&self) -> Vec<Ipv4Addr> {
        if !self.hints.networks.is_empty() {
            return expand_all(&self.hints.networks);
        }
        if !self.hints.in_container {
            return Vec::new();
        }
        let Some(out) = self.tool_stdout("hostname", args(["-I"])).await else {
            return Vec::new();
        };
        let nets: Vec<Ipv4Net> = parse_hostname_ips(&out)
            .into_iter()
            .map(ipv4_to_default_cidr)
            .collect();
        expand_all(&nets)
    }

    async fn from_private_sweep(&self) -> Vec<Ipv4Addr> {
        tracing::warn!(
            ranges = ?PRIVATE_RANGES,
            "no local network detected, sweeping private ranges for responsive hosts"
        );
        let mut argv = args(["-sn", "-n", "-T4", "--max-retries", "0", "--host-timeout", "2s"]);
        argv.extend(PRIVATE_RANGES.iter().map(|s| s.to_string()));
        // The sweep rarely finishes in time; hosts reported before the deadline still count.
        match self
            .runner
            .run_partial("nmap", &argv, self.config.private_sweep_timeout())
            .await
        {
            Ok(out) => dedup_hosts(parse_ping_sweep(&out.stdout)),
            Err(e) => {
                tracing::debug!(error = %e, "private-range sweep failed");
                Vec::new()
            }
        }
    }
}
