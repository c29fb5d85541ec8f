use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::ring::RingBuffer;
use crate::client::ErrorKind;

const RING_CAPACITY: usize = 1000;

/// Live per-endpoint counters and sample buffers. One of these exists per
/// endpoint name, guarded by the collector's per-entry mutex.
#[derive(Debug)]
pub struct EndpointMetrics {
    pub total_requests: i64,
    pub successful: i64,
    pub failed: i64,
    pub timeout_errors: i64,
    pub dns_errors: i64,
    pub connection_errors: i64,
    pub http_errors: i64,
    pub other_errors: i64,

    total_time_ms: f64,
    total_dns_time_ms: f64,
    total_connect_ms: f64,

    response_times: RingBuffer,
    dns_times: RingBuffer,

    pub last_status_code: u16,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,

    pub url_pattern: String,
    pub hostname: String,
}

impl EndpointMetrics {
    pub fn new(url_pattern: &str, hostname: &str) -> Self {
        Self {
            total_requests: 0,
            successful: 0,
            failed: 0,
            timeout_errors: 0,
            dns_errors: 0,
            connection_errors: 0,
            http_errors: 0,
            other_errors: 0,
            total_time_ms: 0.0,
            total_dns_time_ms: 0.0,
            total_connect_ms: 0.0,
            response_times: RingBuffer::new(RING_CAPACITY),
            dns_times: RingBuffer::new(RING_CAPACITY),
            last_status_code: 0,
            last_error: None,
            last_success: None,
            url_pattern: url_pattern.to_string(),
            hostname: hostname.to_string(),
        }
    }

    pub fn record_success(
        &mut self,
        total_time_ms: f64,
        dns_time_ms: f64,
        connect_time_ms: f64,
        status_code: u16,
    ) {
        self.total_requests += 1;
        self.successful += 1;
        self.last_status_code = status_code;
        self.last_success = Some(Utc::now());
        self.accumulate(total_time_ms, dns_time_ms, connect_time_ms);
    }

    pub fn record_failure(
        &mut self,
        total_time_ms: f64,
        dns_time_ms: f64,
        connect_time_ms: f64,
        status_code: u16,
        error_kind: Option<ErrorKind>,
        error_msg: Option<&str>,
    ) {
        self.total_requests += 1;
        self.failed += 1;
        self.last_status_code = status_code;
        if let Some(msg) = error_msg {
            self.last_error = Some(msg.to_string());
        }
        self.accumulate(total_time_ms, dns_time_ms, connect_time_ms);

        // Error buckets: timeout/dns/connection/http, everything else in other.
        match error_kind {
            Some(ErrorKind::Timeout) => self.timeout_errors += 1,
            Some(ErrorKind::Dns) => self.dns_errors += 1,
            Some(ErrorKind::Connection) => self.connection_errors += 1,
            Some(ErrorKind::Http) => self.http_errors += 1,
            _ => self.other_errors += 1,
        }
    }

    fn accumulate(&mut self, total_time_ms: f64, dns_time_ms: f64, connect_time_ms: f64) {
        self.total_time_ms += total_time_ms;
        self.total_dns_time_ms += dns_time_ms;
        self.total_connect_ms += connect_time_ms;
        self.response_times.add(total_time_ms);
        if dns_time_ms > 0.0 {
            self.dns_times.add(dns_time_ms);
        }
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let mut snap = EndpointSnapshot {
            total_requests: self.total_requests,
            successful: self.successful,
            failed: self.failed,
            success_rate: 0.0,
            timeout_errors: self.timeout_errors,
            dns_errors: self.dns_errors,
            connection_errors: self.connection_errors,
            http_errors: self.http_errors,
            other_errors: self.other_errors,
            avg_total_time_ms: 0.0,
            avg_dns_time_ms: 0.0,
            avg_connect_time_ms: 0.0,
            p95_total_time_ms: self.response_times.percentile(95.0),
            p99_total_time_ms: self.response_times.percentile(99.0),
            max_total_time_ms: self.response_times.max(),
            p95_dns_time_ms: self.dns_times.percentile(95.0),
            last_status_code: self.last_status_code,
            last_error: self.last_error.clone(),
            last_success: self
                .last_success
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            url_pattern: self.url_pattern.clone(),
            hostname: self.hostname.clone(),
        };

        if self.total_requests > 0 {
            snap.success_rate = self.successful as f64 / self.total_requests as f64 * 100.0;
            snap.avg_total_time_ms = self.total_time_ms / self.total_requests as f64;
            if self.total_dns_time_ms > 0.0 {
                snap.avg_dns_time_ms = self.total_dns_time_ms / self.total_requests as f64;
            }
            if self.total_connect_ms > 0.0 {
                snap.avg_connect_time_ms = self.total_connect_ms / self.total_requests as f64;
            }
        }

        snap
    }
}

/// Serializable snapshot of a single endpoint's metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub total_requests: i64,
    pub successful: i64,
    pub failed: i64,
    pub success_rate: f64,
    pub timeout_errors: i64,
    pub dns_errors: i64,
    pub connection_errors: i64,
    pub http_errors: i64,
    pub other_errors: i64,

    pub avg_total_time_ms: f64,
    pub avg_dns_time_ms: f64,
    pub avg_connect_time_ms: f64,
    pub p95_total_time_ms: f64,
    pub p99_total_time_ms: f64,
    pub max_total_time_ms: f64,
    pub p95_dns_time_ms: f64,

    pub last_status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<String>,

    pub url_pattern: String,
    pub hostname: String,
}
