//! Best-effort identification of a reachable host:port.
//!
//! Independent sub-probes (SNMP, HTTP banner, IPP, TLS certificate) run concurrently and are
//! merged in a fixed order so first-writer-wins is deterministic. The raw-TCP heuristic for
//! port 9100 runs last because it only fills what the others left empty. No probe error ever
//! reaches the caller; a failed probe contributes nothing.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::command::{args, CommandRunner};
use crate::config::FingerprintConfig;
use crate::ipp::{self, IppResponse};
use crate::matcher::{extract_model, match_capability, match_vendor, vendor_and_model};
use crate::transport::Transport;
use crate::types::Fingerprint;

/// JetDirect / raw print port.
pub const RAW_PRINT_PORT: u16 = 9100;
pub const HTTPS_PORT: u16 = 443;

pub const RAW_TCP_SCANNER: &str = "Raw TCP Scanner";
pub const IPP_SCANNER: &str = "IPP Scanner";

/// sysDescr, sysObjectID, hrDeviceDescr.1
pub const SNMP_OIDS: [&str; 3] = [
    "1.3.6.1.2.1.1.1.0",
    "1.3.6.1.2.1.1.2.0",
    "1.3.6.1.2.1.25.3.2.1.3.1",
];

/// IANA private enterprise numbers of printer vendors, for sysObjectID.
const ENTERPRISES: &[(u32, &str)] = &[
    (11, "HP"),
    (236, "Samsung"),
    (253, "Xerox"),
    (367, "Ricoh"),
    (641, "Lexmark"),
    (674, "Dell"),
    (1129, "Toshiba"),
    (1248, "Epson"),
    (1347, "Kyocera"),
    (1602, "Canon"),
    (2001, "OKI"),
    (2385, "Sharp"),
    (2435, "Brother"),
    (18334, "Konica Minolta"),
];

pub struct Fingerprinter<T, R> {
    transport: Arc<T>,
    runner: Arc<R>,
    config: FingerprintConfig,
}

impl<T: Transport, R: CommandRunner> Fingerprinter<T, R> {
    pub fn new(transport: Arc<T>, runner: Arc<R>, config: FingerprintConfig) -> Self {
        Self {
            transport,
            runner,
            config,
        }
    }

    pub async fn fingerprint(&self, ip: Ipv4Addr, port: u16) -> Fingerprint {
        let (snmp, http, ipp, tls) = tokio::join!(
            self.snmp_probe(ip),
            self.http_probe(ip, port),
            self.ipp_probe(ip),
            self.tls_probe(ip, port),
        );

        let mut fp = Fingerprint::default();
        for part in [snmp, http, ipp, tls] {
            fp.merge(part);
        }

        if port == RAW_PRINT_PORT {
            let raw = self.raw_tcp_probe(ip, port, fp.needs_identity()).await;
            fp.merge(raw);
        }

        tracing::debug!(
            %ip,
            port,
            vendor = ?fp.vendor,
            model = ?fp.model,
            scanner_type = ?fp.scanner_type,
            "fingerprint complete"
        );
        fp
    }

    async fn snmp_probe(&self, ip: Ipv4Addr) -> Fingerprint {
        let mut argv = args(["-v2c", "-c"]);
        argv.push(self.config.snmp_community.clone());
        let secs = self.config.snmp_timeout().as_secs().max(1).to_string();
        argv.extend(args(["-t", secs.as_str(), "-r", "0", "-Oqv"]));
        argv.push(ip.to_string());
        argv.extend(SNMP_OIDS.iter().map(|s| s.to_string()));

        match self
            .runner
            .run("snmpget", &argv, self.config.snmp_timeout())
            .await
        {
            Ok(out) => snmp_fingerprint(&out.stdout),
            Err(e) => {
                tracing::trace!(%ip, error = %e, "snmp probe produced nothing");
                Fingerprint::default()
            }
        }
    }

    async fn http_probe(&self, ip: Ipv4Addr, port: u16) -> Fingerprint {
        let scheme = if port == HTTPS_PORT { "https" } else { "http" };
        let url = format!("{scheme}://{ip}:{port}/");
        match self.transport.http_get(&url, self.config.http_timeout()).await {
            Ok(reply) if reply.is_success() => html_fingerprint(&reply.text()),
            Ok(reply) => {
                tracing::trace!(%url, status = reply.status, "http probe: non-success status");
                Fingerprint::default()
            }
            Err(e) => {
                tracing::trace!(%url, error = %e, "http probe produced nothing");
                Fingerprint::default()
            }
        }
    }

    async fn ipp_probe(&self, ip: Ipv4Addr) -> Fingerprint {
        let port = self.config.ipp_port;
        let url = format!("http://{ip}:{port}/ipp/print");
        let body = ipp::get_printer_attributes_request(&format!("ipp://{ip}:{port}/ipp/print"), 1);
        match self
            .transport
            .http_post(&url, ipp::CONTENT_TYPE, body, self.config.ipp_timeout())
            .await
        {
            Ok(reply) if reply.status == 200 => ipp_fingerprint(ipp::parse_response(&reply.body).as_ref()),
            Ok(_) => Fingerprint::default(),
            Err(e) => {
                tracing::trace!(%url, error = %e, "ipp probe produced nothing");
                Fingerprint::default()
            }
        }
    }

    async fn tls_probe(&self, ip: Ipv4Addr, port: u16) -> Fingerprint {
        if port != HTTPS_PORT {
            return Fingerprint::default();
        }
        let addr = SocketAddrV4::new(ip, port);
        match self
            .transport
            .peer_certificate(addr, self.config.tls_timeout())
            .await
        {
            Ok(der) => Fingerprint {
                vendor: certificate_vendor(&der),
                ..Fingerprint::default()
            },
            Err(e) => {
                tracing::trace!(%addr, error = %e, "tls probe produced nothing");
                Fingerprint::default()
            }
        }
    }

    /// A bare connect to the raw print port is weak evidence of a scanning-capable device.
    /// The device's plain web UI on port 80 may then name it.
    async fn raw_tcp_probe(&self, ip: Ipv4Addr, port: u16, want_identity: bool) -> Fingerprint {
        let addr = SocketAddrV4::new(ip, port);
        if self
            .transport
            .connect(addr, self.config.raw_tcp_timeout())
            .await
            .is_err()
        {
            return Fingerprint::default();
        }
        let mut fp = Fingerprint {
            has_scanner: true,
            scanner_type: Some(RAW_TCP_SCANNER.to_string()),
            ..Fingerprint::default()
        };
        if want_identity {
            let url = format!("http://{ip}/");
            if let Ok(reply) = self.transport.http_get(&url, self.config.http_timeout()).await {
                if reply.is_success() {
                    let (vendor, model) = html_identity(&reply.text());
                    fp.vendor = vendor;
                    fp.model = model;
                }
            }
        }
        fp
    }
}

/// Values from `snmpget -Oqv`, one per requested OID, `None` where the agent had nothing.
pub fn parse_snmp_values(stdout: &str) -> Vec<Option<String>> {
    stdout
        .lines()
        .map(|l| l.trim().trim_matches('"').trim())
        .map(|l| {
            let missing = l.is_empty()
                || l.contains("No Such Object")
                || l.contains("No Such Instance")
                || l.contains("No more variables")
                || l.starts_with("Timeout");
            (!missing).then(|| l.to_string())
        })
        .collect()
}

/// Vendor from a sysObjectID such as `iso.3.6.1.4.1.11.2.3.9.1` or
/// `SNMPv2-SMI::enterprises.1602.4.7`.
pub fn enterprise_vendor(object_id: &str) -> Option<&'static str> {
    let rest = object_id
        .split_once("enterprises.")
        .map(|(_, r)| r)
        .or_else(|| object_id.split_once("3.6.1.4.1.").map(|(_, r)| r))?;
    let number: u32 = rest.split('.').next()?.parse().ok()?;
    ENTERPRISES
        .iter()
        .find(|(n, _)| *n == number)
        .map(|(_, v)| *v)
}

fn looks_like_oid(v: &str) -> bool {
    v.starts_with("iso.") || v.starts_with('.') || v.contains("::") || {
        !v.is_empty() && v.chars().all(|c| c.is_ascii_digit() || c == '.')
    }
}

pub fn snmp_fingerprint(stdout: &str) -> Fingerprint {
    let values = parse_snmp_values(stdout);
    let text: Vec<&str> = values
        .iter()
        .flatten()
        .map(String::as_str)
        .filter(|v| !looks_like_oid(v))
        .collect();
    let joined = text.join(" ");

    let vendor = match_vendor(&joined).or_else(|| {
        values
            .iter()
            .flatten()
            .filter(|v| looks_like_oid(v))
            .find_map(|v| enterprise_vendor(v))
    });
    // hrDeviceDescr names the printer engine more precisely than sysDescr.
    let model = values
        .get(2)
        .and_then(|v| v.as_deref())
        .and_then(extract_model)
        .or_else(|| extract_model(&joined));

    Fingerprint {
        vendor: vendor.map(str::to_string),
        model,
        ..Fingerprint::default()
    }
}

struct HtmlPatterns {
    title: Regex,
    heading: Regex,
    meta: Regex,
    meta_name: Regex,
    meta_content: Regex,
    script_or_style: Regex,
    tag: Regex,
    entity: Regex,
}

fn html_patterns() -> &'static HtmlPatterns {
    static PATTERNS: OnceLock<HtmlPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("html pattern is valid");
        HtmlPatterns {
            title: re(r"(?is)<title[^>]*>(.*?)</title>"),
            heading: re(r"(?is)<h[12][^>]*>(.*?)</h[12]>"),
            meta: re(r"(?is)<meta\b[^>]*>"),
            meta_name: re(r#"(?i)\b(?:name|property)\s*=\s*["']([^"']*)["']"#),
            meta_content: re(r#"(?i)\bcontent\s*=\s*["']([^"']*)["']"#),
            script_or_style: re(r"(?is)<script\b.*?</script>|<style\b.*?</style>"),
            tag: re(r"(?s)<[^>]*>"),
            entity: re(r"&[#a-zA-Z0-9]+;"),
        }
    })
}

/// Page text with scripts, styles, markup and entities removed.
pub fn visible_text(html: &str) -> String {
    let p = html_patterns();
    let s = p.script_or_style.replace_all(html, " ");
    let s = p.tag.replace_all(&s, " ");
    let s = p.entity.replace_all(&s, " ");
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Short descriptive texts in priority order: title, h1/h2 headings, descriptive meta tags.
fn descriptive_texts(html: &str) -> Vec<String> {
    let p = html_patterns();
    let clean = |s: &str| visible_text(s);
    let mut out = Vec::new();
    out.extend(p.title.captures_iter(html).map(|c| clean(&c[1])));
    out.extend(p.heading.captures_iter(html).map(|c| clean(&c[1])));
    for m in p.meta.find_iter(html) {
        let tag = m.as_str();
        let describes = p
            .meta_name
            .captures(tag)
            .map(|c| {
                let n = c[1].to_ascii_lowercase();
                n.contains("title") || n.contains("description") || n.contains("product")
            })
            .unwrap_or(false);
        if describes {
            if let Some(c) = p.meta_content.captures(tag) {
                out.push(c[1].trim().to_string());
            }
        }
    }
    out.retain(|s| !s.is_empty());
    out
}

/// Vendor and model from a device web page.
pub fn html_identity(html: &str) -> (Option<String>, Option<String>) {
    let mut vendor = None;
    let mut model = None;
    for text in descriptive_texts(html) {
        let (v, m) = vendor_and_model(&text);
        vendor = vendor.or(v);
        model = model.or(m);
        if vendor.is_some() && model.is_some() {
            break;
        }
    }
    if vendor.is_none() {
        vendor = match_vendor(&visible_text(html)).map(str::to_string);
    }
    (vendor, model)
}

pub fn html_fingerprint(html: &str) -> Fingerprint {
    let (vendor, model) = html_identity(html);
    let scanner_type = match_capability(&visible_text(html)).map(str::to_string);
    Fingerprint {
        vendor,
        model,
        has_scanner: scanner_type.is_some(),
        scanner_type,
    }
}

/// Interpret a Get-Printer-Attributes answer. Scan capability needs a `scan`/`fax` token.
/// Replies carrying an IPP error status contribute nothing.
pub fn ipp_fingerprint(resp: Option<&IppResponse>) -> Fingerprint {
    let Some(resp) = resp.filter(|r| r.is_success()) else {
        return Fingerprint::default();
    };
    let scan_capable = resp.values().any(|v| {
        let v = v.to_ascii_lowercase();
        v.contains("scan") || v.contains("fax")
    });

    let make_and_model = resp.attribute("printer-make-and-model").unwrap_or("");
    let (mfg, mdl) = resp
        .attribute("printer-device-id")
        .map(ipp::parse_device_id)
        .unwrap_or((None, None));

    let vendor = match_vendor(make_and_model)
        .map(str::to_string)
        .or_else(|| {
            mfg.as_deref()
                .map(|m| match_vendor(m).map(str::to_string).unwrap_or_else(|| m.to_string()))
        });
    let model = mdl
        .as_deref()
        .and_then(extract_model)
        .or(mdl)
        .or_else(|| extract_model(make_and_model));

    Fingerprint {
        vendor,
        model,
        has_scanner: scan_capable,
        scanner_type: scan_capable.then(|| IPP_SCANNER.to_string()),
    }
}

/// Vendor named in a certificate's subject or issuer (organization, unit, common name).
pub fn certificate_vendor(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let mut parts: Vec<&str> = Vec::new();
    for name in [cert.subject(), cert.issuer()] {
        parts.extend(name.iter_organization().filter_map(|a| a.as_str().ok()));
        parts.extend(name.iter_organizational_unit().filter_map(|a| a.as_str().ok()));
        parts.extend(name.iter_common_name().filter_map(|a| a.as_str().ok()));
    }
    match_vendor(&parts.join(" ")).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScriptedRunner;
    use crate::transport::FixtureTransport;
    use std::time::Duration;

    const DEVICE_CERT: &[u8] = include_bytes!("../tests/fixtures/brother_device_cert.der");

    fn fingerprinter(
        transport: FixtureTransport,
        runner: ScriptedRunner,
    ) -> Fingerprinter<FixtureTransport, ScriptedRunner> {
        Fingerprinter::new(
            Arc::new(transport),
            Arc::new(runner),
            FingerprintConfig::default(),
        )
    }

    fn ipp_body(attrs: &[(u8, &str, &str)]) -> Vec<u8> {
        let mut buf = vec![0x01, 0x01, 0x00, 0x00, 0, 0, 0, 1, 0x04];
        for (tag, name, value) in attrs {
            buf.push(*tag);
            buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
        buf.push(0x03);
        buf
    }

    #[test]
    fn snmp_values_skip_agent_errors() {
        let out = "\"HP ETHERNET MULTI-ENVIRONMENT,ROM none,JETDIRECT\"\n\
                   iso.3.6.1.4.1.11.2.3.9.1\n\
                   No Such Instance currently exists at this OID\n";
        let values = parse_snmp_values(out);
        assert_eq!(values.len(), 3);
        assert!(values[2].is_none());
        let fp = snmp_fingerprint(out);
        assert_eq!(fp.vendor.as_deref(), Some("HP"));
        assert!(!fp.indicates_scanner());
    }

    #[test]
    fn snmp_model_prefers_device_descr() {
        let out = "\"Canon iR-ADV C3530 /P\"\n\
                   SNMPv2-SMI::enterprises.1602.4.7\n\
                   \"Canon iR-ADV C3530\"\n";
        let fp = snmp_fingerprint(out);
        assert_eq!(fp.vendor.as_deref(), Some("Canon"));
        assert_eq!(fp.model.as_deref(), Some("C3530"));
    }

    #[test]
    fn enterprise_numbers_name_vendors() {
        assert_eq!(enterprise_vendor("iso.3.6.1.4.1.2435.2.3.9.1"), Some("Brother"));
        assert_eq!(enterprise_vendor("SNMPv2-SMI::enterprises.18334.1.2"), Some("Konica Minolta"));
        assert_eq!(enterprise_vendor("iso.3.6.1.4.1.99999.1"), None);
        assert_eq!(enterprise_vendor("garbage"), None);
    }

    #[test]
    fn html_title_gives_vendor_model_and_class() {
        let html = r#"<html><head><title>Canon MF445dw All-in-One</title>
            <style>.copy { color: red }</style></head>
            <body><p>&copy; CANON INC.</p></body></html>"#;
        let fp = html_fingerprint(html);
        assert_eq!(fp.vendor.as_deref(), Some("Canon"));
        assert_eq!(fp.model.as_deref(), Some("MF445dw"));
        assert_eq!(fp.scanner_type.as_deref(), Some("MFP"));
        assert!(fp.has_scanner);
    }

    #[test]
    fn html_meta_and_body_fallbacks() {
        let html = r#"<html><head><meta name="description" content="Network printer model: WF-4830">
            </head><body><div>Powered by Epson Connect</div><a>Scan to folder</a></body></html>"#;
        let fp = html_fingerprint(html);
        assert_eq!(fp.vendor.as_deref(), Some("Epson"));
        assert_eq!(fp.model.as_deref(), Some("WF-4830"));
        assert_eq!(fp.scanner_type, None);
        assert!(!fp.has_scanner);
    }

    #[test]
    fn ipp_scan_tokens_and_identity() {
        let body = ipp_body(&[
            (0x41, "printer-make-and-model", "HP LaserJet MFP M234sdw"),
            (0x44, "ipp-features-supported", "ipp-everywhere"),
            (0x44, "", "scan"),
        ]);
        let fp = ipp_fingerprint(ipp::parse_response(&body).as_ref());
        assert_eq!(fp.vendor.as_deref(), Some("HP"));
        assert_eq!(fp.model.as_deref(), Some("M234sdw"));
        assert_eq!(fp.scanner_type.as_deref(), Some(IPP_SCANNER));

        let print_only = ipp_body(&[(0x41, "printer-device-id", "MFG:Zebra;MDL:ZD421;")]);
        let fp = ipp_fingerprint(ipp::parse_response(&print_only).as_ref());
        assert_eq!(fp.vendor.as_deref(), Some("Zebra"));
        assert_eq!(fp.model.as_deref(), Some("ZD421"));
        assert!(!fp.indicates_scanner());
        assert_eq!(ipp_fingerprint(None), Fingerprint::default());
    }

    #[test]
    fn ipp_error_status_is_ignored() {
        let mut body = ipp_body(&[
            (0x41, "printer-make-and-model", "HP LaserJet MFP M234sdw"),
            (0x44, "", "scan"),
        ]);
        // client-error-not-authorized
        body[2..4].copy_from_slice(&0x0403u16.to_be_bytes());
        let resp = ipp::parse_response(&body);
        assert!(resp.is_some());
        assert_eq!(ipp_fingerprint(resp.as_ref()), Fingerprint::default());
    }

    #[test]
    fn certificate_subject_names_vendor() {
        assert_eq!(certificate_vendor(DEVICE_CERT).as_deref(), Some("Brother"));
        assert_eq!(certificate_vendor(b"not a certificate"), None);
    }

    #[tokio::test]
    async fn raw_port_supplements_from_port_80() {
        let ip = Ipv4Addr::new(10, 0, 0, 20);
        let transport = FixtureTransport::new()
            .open(ip, RAW_PRINT_PORT)
            .page("http://10.0.0.20/", 200, "<title>Brother MFC-7860DW</title>");
        let fp = fingerprinter(transport, ScriptedRunner::new())
            .fingerprint(ip, RAW_PRINT_PORT)
            .await;
        assert_eq!(fp.scanner_type.as_deref(), Some(RAW_TCP_SCANNER));
        assert!(fp.has_scanner);
        assert_eq!(fp.vendor.as_deref(), Some("Brother"));
        assert_eq!(fp.model.as_deref(), Some("MFC-7860DW"));
    }

    #[tokio::test]
    async fn earlier_probes_win_merge() {
        let ip = Ipv4Addr::new(10, 0, 0, 21);
        let ipp = ipp_body(&[
            (0x41, "printer-make-and-model", "Xerox WorkCentre 6515"),
            (0x44, "printer-kind", "scan"),
        ]);
        let transport = FixtureTransport::new()
            .open(ip, 80)
            .page("http://10.0.0.21:80/", 200, "<title>Kyocera ECOSYS M2540dn MFP</title>")
            .post_reply("http://10.0.0.21:631/ipp/print", 200, ipp);
        let runner = ScriptedRunner::new().with_stdout("snmpget", "\"Ricoh Aficio\"\n\n\n");
        let fp = fingerprinter(transport, runner).fingerprint(ip, 80).await;
        assert_eq!(fp.vendor.as_deref(), Some("Ricoh"));
        assert_eq!(fp.model.as_deref(), Some("M2540dn"));
        assert_eq!(fp.scanner_type.as_deref(), Some("MFP"));
    }

    #[tokio::test]
    async fn https_port_reads_certificate() {
        let ip = Ipv4Addr::new(10, 0, 0, 22);
        let transport = FixtureTransport::new()
            .open(ip, HTTPS_PORT)
            .certificate(SocketAddrV4::new(ip, HTTPS_PORT), DEVICE_CERT.to_vec())
            .latency(Duration::from_millis(1));
        let fp = fingerprinter(transport, ScriptedRunner::new())
            .fingerprint(ip, HTTPS_PORT)
            .await;
        assert_eq!(fp.vendor.as_deref(), Some("Brother"));
        assert!(!fp.indicates_scanner());
    }

    #[tokio::test]
    async fn silent_host_yields_empty_fingerprint() {
        let fp = fingerprinter(FixtureTransport::new(), ScriptedRunner::new())
            .fingerprint(Ipv4Addr::new(10, 0, 0, 23), 515)
            .await;
        assert_eq!(fp, Fingerprint::default());
    }
}
