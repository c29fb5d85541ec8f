//! Per-phase connection timing capture and error classification.
//!
//! Pooled HTTP clients expose no per-phase hooks, so phase numbers come
//! from a per-request probe that owns the dial path: a timed DNS
//! resolution, a timed TCP connect, and (for https) a timed TLS handshake.
//! The probe connection is dropped afterwards; the request itself rides the
//! shared pool.

use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use tokio::net::{lookup_host, TcpStream};
use tokio_util::sync::CancellationToken;

/// Observable error kinds, in the order they can occur in a request's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Template,
    Marshal,
    Request,
    Auth,
    Dns,
    Connection,
    Tls,
    Timeout,
    Cancelled,
    Http,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Template => "template",
            ErrorKind::Marshal => "marshal",
            ErrorKind::Request => "request",
            ErrorKind::Auth => "auth",
            ErrorKind::Dns => "dns",
            ErrorKind::Connection => "connection",
            ErrorKind::Tls => "tls",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Http => "http",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Fractional-millisecond durations for phases that occurred; 0 otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimings {
    pub dns_ms: f64,
    pub connect_ms: f64,
    pub tls_ms: f64,
}

/// Why an await point was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Cancelled,
    TimedOut,
}

impl Interrupted {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Interrupted::Cancelled => ErrorKind::Cancelled,
            Interrupted::TimedOut => ErrorKind::Timeout,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Interrupted::Cancelled => "request cancelled",
            Interrupted::TimedOut => "request timeout",
        }
    }
}

/// Await `fut` while observing the request deadline and the scheduler's
/// cancellation token.
pub async fn bounded<F: Future>(
    fut: F,
    deadline: tokio::time::Instant,
    cancel: &CancellationToken,
) -> Result<F::Output, Interrupted> {
    tokio::select! {
        res = fut => Ok(res),
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(Interrupted::TimedOut),
    }
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_micros() as f64 / 1000.0
}

/// Dial the target once, recording per-phase durations into `timings` as
/// they complete (partial timings survive an interruption or a failure).
pub async fn probe_phases(
    url: &url::Url,
    timings: &mut PhaseTimings,
    deadline: tokio::time::Instant,
    cancel: &CancellationToken,
) -> Result<(), (ErrorKind, String)> {
    let Some(host) = url.host_str() else {
        return Err((ErrorKind::Request, "url has no host".to_string()));
    };
    let host = host.trim_matches(|c| c == '[' || c == ']').to_string();
    let port = url.port_or_known_default().unwrap_or(80);

    // DNS. Skipped entirely for IP literals (the phase does not occur).
    let addr: SocketAddr = match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            let started = Instant::now();
            let resolved = bounded(lookup_host((host.as_str(), port)), deadline, cancel)
                .await
                .map_err(|i| (i.kind(), i.message().to_string()))?;
            timings.dns_ms = ms_since(started);
            match resolved {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => {
                        return Err((ErrorKind::Dns, format!("no such host: {host}")));
                    }
                },
                Err(err) => {
                    return Err((ErrorKind::Dns, format!("dns lookup failed for {host}: {err}")));
                }
            }
        }
    };

    // TCP connect.
    let started = Instant::now();
    let connected = bounded(TcpStream::connect(addr), deadline, cancel)
        .await
        .map_err(|i| (i.kind(), i.message().to_string()))?;
    timings.connect_ms = ms_since(started);
    let stream = connected.map_err(|err| {
        (
            ErrorKind::Connection,
            format!("connect failed for {addr}: {err}"),
        )
    })?;

    // TLS handshake for https targets.
    if url.scheme() == "https" {
        let connector = tokio_native_tls::native_tls::TlsConnector::new()
            .map_err(|err| (ErrorKind::Tls, format!("tls connector: {err}")))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let started = Instant::now();
        let handshake = bounded(connector.connect(&host, stream), deadline, cancel)
            .await
            .map_err(|i| (i.kind(), i.message().to_string()))?;
        timings.tls_ms = ms_since(started);
        handshake.map_err(|err| {
            (
                ErrorKind::Tls,
                format!("tls handshake failed for {host}: {err}"),
            )
        })?;
    }

    Ok(())
}

/// Extract the hostname from a URL, tolerating unparseable input.
pub fn extract_hostname(raw: &str) -> String {
    if let Ok(parsed) = url::Url::parse(raw) {
        return parsed.host_str().unwrap_or_default().to_string();
    }

    let mut rest = raw
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    if let Some(idx) = rest.find('/') {
        rest = &rest[..idx];
    }
    if let Some(idx) = rest.find(':') {
        rest = &rest[..idx];
    }
    rest.to_string()
}

/// Classify a low-level error by its text, in precedence order.
pub fn classify_error_text(text: &str) -> ErrorKind {
    let t = text.to_lowercase();

    if t.contains("deadline exceeded") {
        return ErrorKind::Timeout;
    }
    if t.contains("canceled") || t.contains("cancelled") {
        return ErrorKind::Cancelled;
    }
    if t.contains("no such host")
        || t.contains("lookup")
        || t.contains("dns")
        || t.contains("getaddrinfo")
        || t.contains("name resolution")
    {
        return ErrorKind::Dns;
    }
    if t.contains("connection refused")
        || t.contains("connection reset")
        || t.contains("no route to host")
        || t.contains("network is unreachable")
        || t.contains("network unreachable")
        || t.contains("dial tcp")
    {
        return ErrorKind::Connection;
    }
    if t.contains("tls") || t.contains("certificate") || t.contains("x509") {
        return ErrorKind::Tls;
    }
    if t.contains("timeout") || t.contains("timed out") || t.contains("deadline") {
        return ErrorKind::Timeout;
    }
    ErrorKind::Unknown
}

/// Classify a reqwest error, including its source chain.
pub fn classify_reqwest_error(err: &reqwest::Error) -> (ErrorKind, String) {
    if err.is_timeout() {
        return (ErrorKind::Timeout, "request timeout".to_string());
    }

    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }

    let kind = classify_error_text(&text);
    if kind == ErrorKind::Unknown && err.is_connect() {
        return (ErrorKind::Connection, text);
    }
    (kind, text)
}
