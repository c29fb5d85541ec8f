use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex, RwLock,
    },
    time::Instant,
};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{DomainMetrics, DomainSnapshot};
use super::endpoint::{EndpointMetrics, EndpointSnapshot};
use crate::client::{ErrorKind, RequestResult};

/// Aggregates every outgoing `RequestResult`.
///
/// Global counters are atomics; each endpoint and domain entry has its own
/// mutex so updates across entities do not contend.
pub struct OutgoingCollector {
    started_at: Mutex<Instant>,
    total_requests: AtomicI64,
    total_successes: AtomicI64,
    total_failures: AtomicI64,

    endpoints: RwLock<HashMap<String, Mutex<EndpointMetrics>>>,
    domains: RwLock<HashMap<String, Mutex<DomainMetrics>>>,
}

impl OutgoingCollector {
    pub fn new() -> Self {
        Self {
            started_at: Mutex::new(Instant::now()),
            total_requests: AtomicI64::new(0),
            total_successes: AtomicI64::new(0),
            total_failures: AtomicI64::new(0),
            endpoints: RwLock::new(HashMap::new()),
            domains: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, result: &RequestResult) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        self.with_endpoint(result, |metrics| {
            if result.success {
                metrics.record_success(
                    result.total_time_ms,
                    result.dns_time_ms,
                    result.connect_time_ms,
                    result.status_code,
                );
            } else {
                metrics.record_failure(
                    result.total_time_ms,
                    result.dns_time_ms,
                    result.connect_time_ms,
                    result.status_code,
                    result.error_kind,
                    result.error.as_deref(),
                );
            }
        });

        // Domain metrics only when DNS work actually happened.
        if !result.hostname.is_empty() {
            if result.dns_time_ms > 0.0 && result.error_kind != Some(ErrorKind::Dns) {
                self.with_domain(&result.hostname, |domain| {
                    domain.record_success(result.dns_time_ms);
                });
            } else if result.error_kind == Some(ErrorKind::Dns) {
                let message = result.error.clone().unwrap_or_default();
                self.with_domain(&result.hostname, |domain| {
                    domain.record_failure(&message);
                });
            }
        }
    }

    fn with_endpoint(&self, result: &RequestResult, f: impl FnOnce(&mut EndpointMetrics)) {
        {
            let map = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = map.get(&result.endpoint_name) {
                f(&mut entry.lock().unwrap_or_else(|e| e.into_inner()));
                return;
            }
        }
        let mut map = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        let entry = map
            .entry(result.endpoint_name.clone())
            .or_insert_with(|| Mutex::new(EndpointMetrics::new(&result.url, &result.hostname)));
        f(entry.get_mut().unwrap_or_else(|e| e.into_inner()));
    }

    fn with_domain(&self, hostname: &str, f: impl FnOnce(&mut DomainMetrics)) {
        {
            let map = self.domains.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = map.get(hostname) {
                f(&mut entry.lock().unwrap_or_else(|e| e.into_inner()));
                return;
            }
        }
        let mut map = self.domains.write().unwrap_or_else(|e| e.into_inner());
        let entry = map
            .entry(hostname.to_string())
            .or_insert_with(|| Mutex::new(DomainMetrics::new()));
        f(entry.get_mut().unwrap_or_else(|e| e.into_inner()));
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
            .as_secs_f64();
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_successes = self.total_successes.load(Ordering::Relaxed);

        let endpoints = {
            let map = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
            map.iter()
                .map(|(name, entry)| {
                    let metrics = entry.lock().unwrap_or_else(|e| e.into_inner());
                    (name.clone(), metrics.snapshot())
                })
                .collect()
        };

        let dns_stats_by_domain = {
            let map = self.domains.read().unwrap_or_else(|e| e.into_inner());
            map.iter()
                .map(|(hostname, entry)| {
                    let metrics = entry.lock().unwrap_or_else(|e| e.into_inner());
                    (hostname.clone(), metrics.snapshot())
                })
                .collect()
        };

        MetricsSnapshot {
            uptime_seconds: uptime,
            total_requests,
            total_successes,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            success_rate: if total_requests > 0 {
                total_successes as f64 / total_requests as f64 * 100.0
            } else {
                0.0
            },
            requests_per_second: if uptime > 0.0 {
                total_requests as f64 / uptime
            } else {
                0.0
            },
            collected_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            endpoints,
            dns_stats_by_domain,
        }
    }

    pub fn reset(&self) {
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.total_requests.store(0, Ordering::Relaxed);
        self.total_successes.store(0, Ordering::Relaxed);
        self.total_failures.store(0, Ordering::Relaxed);
        self.endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.domains
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn total_requests(&self) -> i64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 100.0;
        }
        self.total_successes.load(Ordering::Relaxed) as f64 / total as f64 * 100.0
    }
}

impl Default for OutgoingCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of all outgoing metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub total_requests: i64,
    pub total_successes: i64,
    pub total_failures: i64,
    pub success_rate: f64,
    pub requests_per_second: f64,
    pub collected_at: String,
    pub endpoints: HashMap<String, EndpointSnapshot>,
    pub dns_stats_by_domain: HashMap<String, DomainSnapshot>,
}
