//! Network I/O used by probing: TCP connect, HTTP fetches and TLS certificate retrieval.
//!
//! Every operation takes an explicit timeout. Timeouts are enforced with
//! `tokio::time::timeout`, which drops the losing I/O future, so a timed-out connect is
//! cancelled rather than left running.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Open a TCP connection and drop it; returns the time the handshake took.
    fn connect(
        &self,
        addr: SocketAddrV4,
        timeout: Duration,
    ) -> impl Future<Output = Result<Duration>> + Send;

    fn http_get(&self, url: &str, timeout: Duration) -> impl Future<Output = Result<HttpReply>> + Send;

    fn http_post(
        &self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<HttpReply>> + Send;

    /// DER encoding of the certificate the peer presents during a TLS handshake.
    fn peer_certificate(
        &self,
        addr: SocketAddrV4,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Reachability check: `true` on connect, `false` on refusal, error or timeout.
pub async fn probe_port<T: Transport>(
    transport: &T,
    ip: Ipv4Addr,
    port: u16,
    timeout: Duration,
) -> bool {
    transport
        .connect(SocketAddrV4::new(ip, port), timeout)
        .await
        .is_ok()
}

/// Real sockets, `reqwest` for HTTP and `tokio-native-tls` for certificates.
///
/// Embedded device web servers almost always present self-signed certificates, so both the
/// HTTP client and the TLS connector accept any certificate and hostname.
#[derive(Clone)]
pub struct NetTransport {
    client: reqwest::Client,
    tls: tokio_native_tls::TlsConnector,
    body_limit: usize,
}

impl NetTransport {
    pub fn new(body_limit: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent(concat!("mfp-scan-rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScanError::ProbeFailure {
                target: "http client".into(),
                reason: e.to_string(),
            })?;
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| ScanError::ProbeFailure {
                target: "tls connector".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            tls: tokio_native_tls::TlsConnector::from(tls),
            body_limit,
        })
    }

    async fn read_reply(&self, url: &str, timeout: Duration, mut resp: reqwest::Response) -> Result<HttpReply> {
        let status = resp.status().as_u16();
        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| http_error(url, timeout, e))? {
            let room = self.body_limit.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= self.body_limit {
                break;
            }
        }
        Ok(HttpReply { status, body })
    }
}

fn http_error(url: &str, timeout: Duration, e: reqwest::Error) -> ScanError {
    if e.is_timeout() {
        ScanError::ProbeTimeout {
            target: url.to_string(),
            after: timeout,
        }
    } else {
        ScanError::ProbeFailure {
            target: url.to_string(),
            reason: e.to_string(),
        }
    }
}

impl Transport for NetTransport {
    async fn connect(&self, addr: SocketAddrV4, timeout: Duration) -> Result<Duration> {
        let start = Instant::now();
        match time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(start.elapsed()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(ScanError::ConnectionRefused {
                    target: addr.to_string(),
                })
            }
            Ok(Err(e)) => Err(ScanError::ProbeFailure {
                target: addr.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ScanError::ProbeTimeout {
                target: addr.to_string(),
                after: timeout,
            }),
        }
    }

    async fn http_get(&self, url: &str, timeout: Duration) -> Result<HttpReply> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| http_error(url, timeout, e))?;
        self.read_reply(url, timeout, resp).await
    }

    async fn http_post(
        &self,
        url: &str,
        content_type: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<HttpReply> {
        let resp = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| http_error(url, timeout, e))?;
        self.read_reply(url, timeout, resp).await
    }

    async fn peer_certificate(&self, addr: SocketAddrV4, timeout: Duration) -> Result<Vec<u8>> {
        let target = addr.to_string();
        let failure = |reason: String| ScanError::ProbeFailure {
            target: target.clone(),
            reason,
        };
        let handshake = async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| failure(e.to_string()))?;
            let tls = self
                .tls
                .connect(&addr.ip().to_string(), stream)
                .await
                .map_err(|e| failure(e.to_string()))?;
            let cert = tls
                .get_ref()
                .peer_certificate()
                .map_err(|e| failure(e.to_string()))?
                .ok_or_else(|| failure("no certificate presented".into()))?;
            cert.to_der().map_err(|e| failure(e.to_string()))
        };
        match time::timeout(timeout, handshake).await {
            Ok(res) => res,
            Err(_) => Err(ScanError::ProbeTimeout {
                target: target.clone(),
                after: timeout,
            }),
        }
    }
}

/// In-memory network: a set of open sockets plus canned HTTP replies and certificates.
/// Anything not registered is refused.
#[derive(Debug, Clone, Default)]
pub struct FixtureTransport {
    open: HashSet<SocketAddrV4>,
    faults: HashMap<SocketAddrV4, String>,
    gets: HashMap<String, HttpReply>,
    posts: HashMap<String, HttpReply>,
    certificates: HashMap<SocketAddrV4, Vec<u8>>,
    latency: Duration,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(mut self, ip: Ipv4Addr, port: u16) -> Self {
        self.open.insert(SocketAddrV4::new(ip, port));
        self
    }

    /// Make connects to `ip:port` fail with a local error such as `EMFILE`.
    pub fn fault(mut self, ip: Ipv4Addr, port: u16, reason: &str) -> Self {
        self.faults.insert(SocketAddrV4::new(ip, port), reason.to_string());
        self
    }

    pub fn page(mut self, url: &str, status: u16, body: &str) -> Self {
        self.gets.insert(
            url.to_string(),
            HttpReply {
                status,
                body: body.as_bytes().to_vec(),
            },
        );
        self
    }

    pub fn post_reply(mut self, url: &str, status: u16, body: Vec<u8>) -> Self {
        self.posts
            .insert(url.to_string(), HttpReply { status, body });
        self
    }

    pub fn certificate(mut self, addr: SocketAddrV4, der: Vec<u8>) -> Self {
        self.certificates.insert(addr, der);
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn refused(target: &str) -> ScanError {
        ScanError::ConnectionRefused {
            target: target.to_string(),
        }
    }
}

impl Transport for FixtureTransport {
    async fn connect(&self, addr: SocketAddrV4, _timeout: Duration) -> Result<Duration> {
        if let Some(reason) = self.faults.get(&addr) {
            Err(ScanError::ProbeFailure {
                target: addr.to_string(),
                reason: reason.clone(),
            })
        } else if self.open.contains(&addr) {
            Ok(self.latency)
        } else {
            Err(Self::refused(&addr.to_string()))
        }
    }

    async fn http_get(&self, url: &str, _timeout: Duration) -> Result<HttpReply> {
        self.gets.get(url).cloned().ok_or_else(|| Self::refused(url))
    }

    async fn http_post(
        &self,
        url: &str,
        _content_type: &str,
        _body: Vec<u8>,
        _timeout: Duration,
    ) -> Result<HttpReply> {
        self.posts.get(url).cloned().ok_or_else(|| Self::refused(url))
    }

    async fn peer_certificate(&self, addr: SocketAddrV4, _timeout: Duration) -> Result<Vec<u8>> {
        self.certificates
            .get(&addr)
            .cloned()
            .ok_or_else(|| Self::refused(&addr.to_string()))
    }
}
