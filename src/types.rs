use std::collections::HashSet;
use std::net::Ipv4Addr;

use ::time::{format_description::well_known, OffsetDateTime};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{FieldError, ScanError};
use crate::netdetect::is_excluded;
use crate::ports::default_ports;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// One discovered device. Identity is `(ip, port)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub has_scanner: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_type: Option<String>,
    pub last_seen: String,
}

impl DeviceDescriptor {
    pub fn online(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ip,
            port,
            status: DeviceStatus::Online,
            response_time_ms: None,
            vendor: None,
            model: None,
            has_scanner: false,
            scanner_type: None,
            last_seen: now_rfc3339(),
        }
    }

    pub fn key(&self) -> (Ipv4Addr, u16) {
        (self.ip, self.port)
    }

    /// Build a descriptor from an open port and what fingerprinting learned about it.
    pub fn from_fingerprint(ip: Ipv4Addr, port: u16, fp: Fingerprint) -> Self {
        let mut d = Self::online(ip, port);
        d.vendor = fp.vendor;
        d.model = fp.model;
        d.has_scanner = fp.has_scanner || fp.scanner_type.is_some();
        d.scanner_type = fp.scanner_type;
        d
    }
}

/// Partial device description produced by one or more fingerprinting probes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub has_scanner: bool,
    pub scanner_type: Option<String>,
}

impl Fingerprint {
    /// Fold `other` into `self`. Populated fields are never overwritten.
    pub fn merge(&mut self, other: Fingerprint) {
        if self.vendor.is_none() {
            self.vendor = other.vendor;
        }
        if self.model.is_none() {
            self.model = other.model;
        }
        if self.scanner_type.is_none() {
            self.scanner_type = other.scanner_type;
        }
        self.has_scanner |= other.has_scanner;
    }

    pub fn indicates_scanner(&self) -> bool {
        self.has_scanner || self.scanner_type.is_some()
    }

    pub fn needs_identity(&self) -> bool {
        self.vendor.is_none() || self.model.is_none()
    }
}

/// Aggregate outcome of one scan run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub printers: Vec<DeviceDescriptor>,
    pub total_scanned: u32,
    pub scan_duration_ms: u32,
    pub errors: Vec<String>,
}

/// Scan request as it arrives over the wire. Everything is optional or loosely typed so that
/// validation can report every bad field at once.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    #[serde(default)]
    pub network_range: Option<String>,
    #[serde(default)]
    pub start_ip: Option<String>,
    #[serde(default)]
    pub end_ip: Option<String>,
    #[serde(default = "default_request_ports")]
    pub ports: Vec<i64>,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            network_range: None,
            start_ip: None,
            end_ip: None,
            ports: default_request_ports(),
        }
    }
}

fn default_request_ports() -> Vec<i64> {
    default_ports().into_iter().map(i64::from).collect()
}

/// Which address space a validated request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTarget {
    Network(Ipv4Net),
    Range { start: Ipv4Addr, end: Ipv4Addr },
    LocalNetwork,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub target: ScanTarget,
    pub ports: Vec<u16>,
}

impl ScanRequest {
    pub fn range(start: &str, end: &str, ports: &[u16]) -> Self {
        Self {
            network_range: None,
            start_ip: Some(start.to_string()),
            end_ip: Some(end.to_string()),
            ports: ports.iter().map(|&p| i64::from(p)).collect(),
        }
    }

    pub fn network(cidr: &str, ports: &[u16]) -> Self {
        Self {
            network_range: Some(cidr.to_string()),
            ports: ports.iter().map(|&p| i64::from(p)).collect(),
            ..Self::default()
        }
    }

    /// Check every field and produce a typed request. All problems are reported together.
    pub fn validate(&self) -> Result<ValidatedRequest, ScanError> {
        let mut errors = Vec::new();

        let ports = validate_ports(&self.ports, &mut errors);

        let network = non_blank(&self.network_range);
        let start = non_blank(&self.start_ip);
        let end = non_blank(&self.end_ip);

        let target = if let Some(cidr) = network {
            if start.is_some() || end.is_some() {
                tracing::debug!("networkRange given, ignoring startIp/endIp");
            }
            validate_network(cidr, &mut errors).map(ScanTarget::Network)
        } else {
            match (start, end) {
                (Some(s), Some(e)) => {
                    let s = validate_ip("startIp", s, &mut errors);
                    let e = validate_ip("endIp", e, &mut errors);
                    match (s, e) {
                        (Some(s), Some(e)) if u32::from(e) < u32::from(s) => {
                            errors.push(FieldError::new("endIp", "must not be lower than startIp"));
                            None
                        }
                        (Some(start), Some(end)) => Some(ScanTarget::Range { start, end }),
                        _ => None,
                    }
                }
                (Some(_), None) => {
                    errors.push(FieldError::new("endIp", "required when startIp is given"));
                    None
                }
                (None, Some(_)) => {
                    errors.push(FieldError::new("startIp", "required when endIp is given"));
                    None
                }
                (None, None) => Some(ScanTarget::LocalNetwork),
            }
        };

        match target {
            Some(target) if errors.is_empty() => Ok(ValidatedRequest { target, ports }),
            _ => Err(ScanError::Validation(errors)),
        }
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn validate_ports(raw: &[i64], errors: &mut Vec<FieldError>) -> Vec<u16> {
    if raw.is_empty() {
        errors.push(FieldError::new("ports", "at least one port is required"));
        return Vec::new();
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for (idx, &p) in raw.iter().enumerate() {
        match u16::try_from(p) {
            Ok(port) if port != 0 => {
                if seen.insert(port) {
                    out.push(port);
                }
            }
            _ => errors.push(FieldError::new(
                format!("ports[{idx}]"),
                format!("{p} is outside 1-65535"),
            )),
        }
    }
    out
}

fn validate_ip(field: &str, raw: &str, errors: &mut Vec<FieldError>) -> Option<Ipv4Addr> {
    match raw.parse::<Ipv4Addr>() {
        Ok(ip) if is_excluded(ip) => {
            errors.push(FieldError::new(
                field,
                format!("{ip} is a loopback or link-local address"),
            ));
            None
        }
        Ok(ip) => Some(ip),
        Err(_) => {
            errors.push(FieldError::new(
                field,
                format!("'{raw}' is not a dotted IPv4 address"),
            ));
            None
        }
    }
}

fn validate_network(raw: &str, errors: &mut Vec<FieldError>) -> Option<Ipv4Net> {
    let net = match raw.parse::<Ipv4Net>() {
        Ok(n) => n.trunc(),
        Err(_) => {
            errors.push(FieldError::new(
                "networkRange",
                format!("'{raw}' is not an IPv4 CIDR such as 192.168.1.0/24"),
            ));
            return None;
        }
    };
    if net.prefix_len() > 30 {
        errors.push(FieldError::new(
            "networkRange",
            format!("/{} has no host addresses", net.prefix_len()),
        ));
        return None;
    }
    if is_excluded(net.network()) {
        errors.push(FieldError::new(
            "networkRange",
            format!("{net} is a loopback or link-local network"),
        ));
        return None;
    }
    Some(net)
}

/// RFC 3339 UTC timestamp.
pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
