//! Raw TCP reachability checks and the diagnostic sweep run when the switch
//! cannot be reached.

use callboard_core::{ConnectionReport, FailureKind};
use serde::Serialize;
use std::{
    fmt::Write as _,
    io,
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SWEEP_TIMEOUT: Duration = Duration::from_secs(2);
/// Ports this switch family commonly exposes its manager/HTTP interfaces on.
pub const ALTERNATE_MANAGER_PORTS: [u16; 4] = [5038, 5039, 8088, 8089];

pub const REMEDIATION_CHECKLIST: [&str; 5] = [
    "Check that the manager interface is enabled on the switch (enabled = yes in manager.conf).",
    "Check the manager bind address; 127.0.0.1 only accepts local connections.",
    "Check that no firewall between this host and the switch blocks the manager port.",
    "Check that the switch service is running.",
    "Check the manager username and secret, and that the user's permit/deny rules allow this host.",
];

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub tcp_timeout: Duration,
    pub sweep_timeout: Duration,
    pub alternate_ports: Vec<u16>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            tcp_timeout: DEFAULT_TCP_TIMEOUT,
            sweep_timeout: DEFAULT_SWEEP_TIMEOUT,
            alternate_ports: ALTERNATE_MANAGER_PORTS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl ProbeFailure {
    fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn message(&self, host: &str, port: u16) -> String {
        match self.kind {
            FailureKind::ConnectionRefused => format!(
                "Connection refused by {host}:{port}; nothing is listening on that port or the switch rejected the connection"
            ),
            FailureKind::TimedOut => format!("Connection to {host}:{port} timed out ({})", self.detail),
            FailureKind::HostNotFound => {
                format!("Host {host} could not be resolved ({})", self.detail)
            }
            FailureKind::Authentication | FailureKind::Other => {
                format!("Could not connect to {host}:{port}: {}", self.detail)
            }
        }
    }
}

pub fn classify_io_error(err: &io::Error) -> FailureKind {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => FailureKind::ConnectionRefused,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureKind::TimedOut,
        io::ErrorKind::NotFound => FailureKind::HostNotFound,
        _ => {
            let text = err.to_string().to_lowercase();
            if text.contains("lookup address")
                || text.contains("name or service not known")
                || text.contains("no such host")
                || text.contains("nodename nor servname")
            {
                FailureKind::HostNotFound
            } else {
                FailureKind::Other
            }
        }
    }
}

/// Resolves `host` and connects to the first address that accepts, all within
/// `timeout`. Dropping the returned future releases any half-open socket.
pub async fn connect_within(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, ProbeFailure> {
    let deadline = Instant::now() + timeout;
    let addrs = resolve_within(host, port, deadline, timeout).await?;

    let mut last_failure = None;
    for addr in addrs {
        match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => {
                debug!(event = "probe_addr_failed", addr = %addr, error = %err);
                last_failure = Some(ProbeFailure::new(classify_io_error(&err), err.to_string()));
            }
            Err(_) => {
                return Err(ProbeFailure::new(
                    FailureKind::TimedOut,
                    format!("no response within {} ms", timeout.as_millis()),
                ));
            }
        }
    }
    Err(last_failure
        .unwrap_or_else(|| ProbeFailure::new(FailureKind::HostNotFound, "no addresses resolved")))
}

async fn resolve_within(
    host: &str,
    port: u16,
    deadline: Instant,
    timeout: Duration,
) -> Result<Vec<SocketAddr>, ProbeFailure> {
    match tokio::time::timeout_at(deadline, tokio::net::lookup_host((host, port))).await {
        Ok(Ok(addrs)) => {
            let addrs = addrs.collect::<Vec<_>>();
            if addrs.is_empty() {
                Err(ProbeFailure::new(
                    FailureKind::HostNotFound,
                    "no addresses resolved",
                ))
            } else {
                Ok(addrs)
            }
        }
        Ok(Err(err)) => Err(ProbeFailure::new(FailureKind::HostNotFound, err.to_string())),
        Err(_) => Err(ProbeFailure::new(
            FailureKind::TimedOut,
            format!("name resolution did not finish within {} ms", timeout.as_millis()),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortState {
    Open,
    Closed,
    TimedOut,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::TimedOut => "timed out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortProbe {
    pub port: u16,
    pub state: PortState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum DnsOutcome {
    Resolved { addresses: Vec<IpAddr> },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub host: String,
    pub port: u16,
    pub dns: DnsOutcome,
    pub ports: Vec<PortProbe>,
    pub recommendations: Vec<String>,
    pub checklist: Vec<String>,
}

impl DiagnosticReport {
    pub fn open_alternates(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter(|probe| probe.state == PortState::Open)
            .map(|probe| probe.port)
            .collect()
    }

    /// Human readable report, used as `diagnosticInfo`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Diagnostics for {}:{}", self.host, self.port);
        match &self.dns {
            DnsOutcome::Resolved { addresses } => {
                let joined = addresses
                    .iter()
                    .map(|addr| addr.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = writeln!(out, "DNS: {} resolved to {}", self.host, joined);
            }
            DnsOutcome::Failed { error } => {
                let _ = writeln!(out, "DNS: resolution of {} failed: {}", self.host, error);
            }
        }
        let _ = writeln!(out, "Alternate port sweep:");
        if self.ports.is_empty() {
            let _ = writeln!(out, "  (no alternate ports configured)");
        }
        for probe in &self.ports {
            let _ = writeln!(out, "  {}: {}", probe.port, probe.state.as_str());
        }
        if !self.recommendations.is_empty() {
            let _ = writeln!(out, "Recommendations:");
            for recommendation in &self.recommendations {
                let _ = writeln!(out, "  - {recommendation}");
            }
        }
        let _ = writeln!(out, "Checklist:");
        for (idx, item) in self.checklist.iter().enumerate() {
            let _ = writeln!(out, "  {}. {}", idx + 1, item);
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectivityProbe {
    config: ProbeConfig,
}

impl ConnectivityProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Bare TCP reachability check. On failure the report carries the
    /// rendered diagnostic sweep.
    pub async fn test_tcp(&self, host: &str, port: u16, timeout: Duration) -> ConnectionReport {
        match connect_within(host, port, timeout).await {
            Ok(mut stream) => {
                let _ = stream.shutdown().await;
                info!(event = "probe_tcp_ok", host = host, port = port);
                ConnectionReport::ok(format!("TCP connection to {host}:{port} succeeded"))
            }
            Err(failure) => {
                warn!(
                    event = "probe_tcp_failed",
                    host = host,
                    port = port,
                    kind = %failure.kind,
                    detail = %failure.detail
                );
                let diagnostics = self.run_diagnostics(host, port).await;
                ConnectionReport::failed(failure.kind, failure.message(host, port))
                    .with_diagnostics(diagnostics.render())
            }
        }
    }

    /// Probes each port in order and returns the ones that accepted.
    pub async fn test_ports(&self, host: &str, ports: &[u16]) -> Vec<u16> {
        let mut open = Vec::new();
        for &port in ports {
            if self.probe_port(host, port).await == PortState::Open {
                open.push(port);
            }
        }
        open
    }

    pub async fn run_diagnostics(&self, host: &str, port: u16) -> DiagnosticReport {
        let dns = resolve_host(host, self.config.tcp_timeout).await;

        let mut ports = Vec::new();
        for &alternate in self.config.alternate_ports.iter().filter(|p| **p != port) {
            let state = self.probe_port(host, alternate).await;
            ports.push(PortProbe {
                port: alternate,
                state,
            });
        }

        let mut recommendations = Vec::new();
        if let DnsOutcome::Failed { .. } = &dns {
            recommendations.push(format!(
                "The hostname {host} does not resolve; check for typos or use the switch's IP address."
            ));
        }
        let open = ports
            .iter()
            .filter(|probe| probe.state == PortState::Open)
            .map(|probe| probe.port)
            .collect::<Vec<_>>();
        for alternate in &open {
            recommendations.push(format!(
                "Port {alternate} is open on {host}; try connecting on port {alternate} instead of {port}."
            ));
        }
        if open.is_empty() && matches!(dns, DnsOutcome::Resolved { .. }) {
            recommendations.push(format!(
                "No alternate manager ports answered on {host}; the switch may be down or filtered by a firewall."
            ));
        }

        info!(
            event = "probe_diagnostics",
            host = host,
            port = port,
            open_alternates = ?open
        );

        DiagnosticReport {
            host: host.to_string(),
            port,
            dns,
            ports,
            recommendations,
            checklist: REMEDIATION_CHECKLIST.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn probe_port(&self, host: &str, port: u16) -> PortState {
        match connect_within(host, port, self.config.sweep_timeout).await {
            Ok(mut stream) => {
                let _ = stream.shutdown().await;
                PortState::Open
            }
            Err(failure) if failure.kind == FailureKind::TimedOut => PortState::TimedOut,
            Err(_) => PortState::Closed,
        }
    }
}

async fn resolve_host(host: &str, timeout: Duration) -> DnsOutcome {
    match tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0))).await {
        Ok(Ok(addrs)) => {
            let mut addresses = addrs.map(|addr| addr.ip()).collect::<Vec<_>>();
            addresses.dedup();
            if addresses.is_empty() {
                DnsOutcome::Failed {
                    error: "no addresses returned".to_string(),
                }
            } else {
                DnsOutcome::Resolved { addresses }
            }
        }
        Ok(Err(err)) => DnsOutcome::Failed {
            error: err.to_string(),
        },
        Err(_) => DnsOutcome::Failed {
            error: format!("lookup timed out after {} ms", timeout.as_millis()),
        },
    }
}
