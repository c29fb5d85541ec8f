use serde::{Deserialize, Serialize};

use super::ring::RingBuffer;

/// DNS resolution metrics for a single domain.
#[derive(Debug)]
pub struct DomainMetrics {
    pub total_lookups: i64,
    pub successful_lookups: i64,
    pub failed_lookups: i64,
    total_dns_time_ms: f64,
    dns_times: RingBuffer,
    pub last_error: Option<String>,
}

impl DomainMetrics {
    pub fn new() -> Self {
        Self {
            total_lookups: 0,
            successful_lookups: 0,
            failed_lookups: 0,
            total_dns_time_ms: 0.0,
            dns_times: RingBuffer::new(1000),
            last_error: None,
        }
    }

    pub fn record_success(&mut self, dns_time_ms: f64) {
        self.total_lookups += 1;
        self.successful_lookups += 1;
        self.total_dns_time_ms += dns_time_ms;
        self.dns_times.add(dns_time_ms);
    }

    pub fn record_failure(&mut self, error_msg: &str) {
        self.total_lookups += 1;
        self.failed_lookups += 1;
        self.last_error = Some(error_msg.to_string());
    }

    pub fn snapshot(&self) -> DomainSnapshot {
        let avg_resolution_ms = if self.successful_lookups > 0 && self.total_dns_time_ms > 0.0 {
            self.total_dns_time_ms / self.successful_lookups as f64
        } else {
            0.0
        };

        DomainSnapshot {
            total_lookups: self.total_lookups,
            successful_lookups: self.successful_lookups,
            failed_lookups: self.failed_lookups,
            avg_resolution_ms,
            p95_resolution_ms: self.dns_times.percentile(95.0),
            max_resolution_ms: self.dns_times.max(),
            min_resolution_ms: self.dns_times.min(),
            last_error: self.last_error.clone(),
        }
    }
}

impl Default for DomainMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of a domain's DNS metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub total_lookups: i64,
    pub successful_lookups: i64,
    pub failed_lookups: i64,
    pub avg_resolution_ms: f64,
    pub p95_resolution_ms: f64,
    pub max_resolution_ms: f64,
    pub min_resolution_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
