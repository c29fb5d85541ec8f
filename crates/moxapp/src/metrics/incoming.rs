use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex, RwLock,
    },
    time::Instant,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::ring::RingBuffer;

/// Live metrics for a single simulated route.
#[derive(Debug)]
pub struct RouteMetrics {
    pub total_requests: i64,
    pub responses_by_status: HashMap<u16, i64>,
    total_response_ms: f64,
    response_times: RingBuffer,
    pub last_request: Option<DateTime<Utc>>,
    pub route_name: String,
    pub route_path: String,
}

impl RouteMetrics {
    pub fn new(route_name: &str, route_path: &str) -> Self {
        Self {
            total_requests: 0,
            responses_by_status: HashMap::new(),
            total_response_ms: 0.0,
            response_times: RingBuffer::new(1000),
            last_request: None,
            route_name: route_name.to_string(),
            route_path: route_path.to_string(),
        }
    }

    pub fn record(&mut self, status: u16, response_time_ms: f64) {
        self.total_requests += 1;
        *self.responses_by_status.entry(status).or_insert(0) += 1;
        self.total_response_ms += response_time_ms;
        self.response_times.add(response_time_ms);
        self.last_request = Some(Utc::now());
    }

    pub fn snapshot(&self) -> RouteSnapshot {
        RouteSnapshot {
            total_requests: self.total_requests,
            responses_by_status: self.responses_by_status.clone(),
            avg_response_ms: if self.total_requests > 0 {
                self.total_response_ms / self.total_requests as f64
            } else {
                0.0
            },
            p95_response_ms: self.response_times.percentile(95.0),
            p99_response_ms: self.response_times.percentile(99.0),
            max_response_ms: self.response_times.max(),
            min_response_ms: self.response_times.min(),
            last_request: self
                .last_request
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
            route_name: self.route_name.clone(),
            route_path: self.route_path.clone(),
        }
    }
}

/// Serializable snapshot of a route's metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSnapshot {
    pub total_requests: i64,
    pub responses_by_status: HashMap<u16, i64>,
    pub avg_response_ms: f64,
    pub p95_response_ms: f64,
    pub p99_response_ms: f64,
    pub max_response_ms: f64,
    pub min_response_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request: Option<String>,
    pub route_name: String,
    pub route_path: String,
}

/// Aggregates simulated inbound responses per route.
pub struct IncomingCollector {
    started_at: Mutex<Instant>,
    total_requests: AtomicI64,
    routes: RwLock<HashMap<String, Mutex<RouteMetrics>>>,
}

impl IncomingCollector {
    pub fn new() -> Self {
        Self {
            started_at: Mutex::new(Instant::now()),
            total_requests: AtomicI64::new(0),
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, route_name: &str, route_path: &str, status: u16, response_time_ms: f64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        {
            let map = self.routes.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = map.get(route_name) {
                entry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record(status, response_time_ms);
                return;
            }
        }
        let mut map = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let entry = map
            .entry(route_name.to_string())
            .or_insert_with(|| Mutex::new(RouteMetrics::new(route_name, route_path)));
        entry
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .record(status, response_time_ms);
    }

    pub fn snapshot(&self) -> IncomingSnapshot {
        let uptime = self
            .started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
            .as_secs_f64();
        let total_requests = self.total_requests.load(Ordering::Relaxed);

        let routes = {
            let map = self.routes.read().unwrap_or_else(|e| e.into_inner());
            map.iter()
                .map(|(name, entry)| {
                    let metrics = entry.lock().unwrap_or_else(|e| e.into_inner());
                    (name.clone(), metrics.snapshot())
                })
                .collect()
        };

        IncomingSnapshot {
            uptime_seconds: uptime,
            total_requests,
            requests_per_second: if uptime > 0.0 {
                total_requests as f64 / uptime
            } else {
                0.0
            },
            collected_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            routes,
        }
    }

    pub fn reset(&self) {
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.total_requests.store(0, Ordering::Relaxed);
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn total_requests(&self) -> i64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}

impl Default for IncomingCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable snapshot of all incoming metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingSnapshot {
    pub uptime_seconds: f64,
    pub total_requests: i64,
    pub requests_per_second: f64,
    pub collected_at: String,
    pub routes: HashMap<String, RouteSnapshot>,
}
