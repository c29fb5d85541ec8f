//! Outgoing request scheduler.
//!
//! A 10 ms tick loop computes due endpoints from the store snapshot and
//! spawns one dispatch task per due endpoint. Dispatches gate on a global
//! semaphore, observe the scheduler-level cancellation token, and report
//! every result through the handler callback exactly once.
//!
//! State machine: Stopped → Running → Paused ⇄ Running; `emergency_stop`
//! additionally cancels in-flight work; the shutdown path waits up to 30 s
//! for stragglers and reports what remains.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

use crate::client::{ErrorKind, RequestExecutor, RequestResult};
use crate::config::ConfigStore;
use crate::telemetry;

pub type ResultHandler = Arc<dyn Fn(RequestResult) + Send + Sync>;

const TICK_INTERVAL: Duration = Duration::from_millis(10);
/// Sentinel interval for endpoints whose effective rate is zero.
const NEVER_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Scheduler {
    store: Arc<ConfigStore>,
    executor: Arc<dyn RequestExecutor>,
    handler: ResultHandler,

    next_request_time: Mutex<HashMap<String, Instant>>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,

    scheduled: AtomicU64,
    in_flight: AtomicI64,
    skipped: AtomicU64,

    paused: AtomicBool,
    running: AtomicBool,

    cancel: Mutex<CancellationToken>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub requests_scheduled: u64,
    pub requests_in_flight: i64,
    pub requests_skipped: u64,
    pub active_endpoints: usize,
    pub enabled_endpoints: usize,
    pub paused: bool,
    pub global_enabled: bool,
    pub running: bool,
}

impl Scheduler {
    pub fn new(
        store: Arc<ConfigStore>,
        executor: Arc<dyn RequestExecutor>,
        handler: ResultHandler,
    ) -> Arc<Self> {
        let config = store.snapshot();
        let now = Instant::now();
        let next_request_time = config
            .endpoints
            .iter()
            .map(|e| (e.name.clone(), now))
            .collect();

        Arc::new(Self {
            store,
            executor,
            handler,
            next_request_time: Mutex::new(next_request_time),
            semaphore: Arc::new(Semaphore::new(config.concurrent_requests.max(1))),
            tracker: TaskTracker::new(),
            scheduled: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
            skipped: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Drive the tick loop until the shutdown channel fires.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("scheduler already running");
        }
        info!("scheduler started");

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.tick(),
            }
        }

        self.shutdown().await
    }

    fn tick(self: &Arc<Self>) {
        if self.is_paused() || !self.store.is_enabled() {
            return;
        }

        let now = Instant::now();
        let config = self.store.snapshot();

        for endpoint in config.endpoints {
            if !endpoint.enabled {
                continue;
            }

            let due = {
                let mut next = self
                    .next_request_time
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let entry = next.entry(endpoint.name.clone()).or_insert(now);
                if now >= *entry {
                    // Next slot is computed before dispatch to avoid drift.
                    *entry = now
                        + calculate_interval(
                            endpoint.frequency_per_min,
                            config.global_multiplier,
                        );
                    true
                } else {
                    false
                }
            };

            if due {
                self.scheduled.fetch_add(1, Ordering::Relaxed);
                let scheduler = Arc::clone(self);
                self.tracker.spawn(async move {
                    scheduler.dispatch(endpoint).await;
                });
            }
        }
    }

    async fn dispatch(self: Arc<Self>, endpoint: crate::config::Endpoint) {
        if self.is_paused() || !self.store.is_enabled() {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let cancel = self.current_cancel();
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = cancel.cancelled() => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // State may have flipped while waiting for a slot.
        if self.is_paused()
            || !self.store.is_enabled()
            || self.store.endpoint_enabled(&endpoint.name) != Some(true)
        {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            drop(permit);
            return;
        }

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let deadline = Duration::from_secs(endpoint.timeout.max(1));
        let mut result = self.executor.execute(&endpoint, deadline, &cancel).await;

        // A cancellation seen while the scheduler is healthy means the
        // per-request deadline fired, not an operator stop.
        if result.error_kind == Some(ErrorKind::Cancelled)
            && !self.is_paused()
            && self.store.is_enabled()
        {
            result.error_kind = Some(ErrorKind::Timeout);
            result.error = Some("request timeout".to_string());
        }

        telemetry::record_dispatch_result(match result.error_kind {
            None => "success",
            Some(kind) => kind.as_str(),
        });
        (self.handler)(result);

        self.in_flight.fetch_add(-1, Ordering::Relaxed);
        drop(permit);
    }

    /// Stop scheduling new work. In-flight requests are left to finish.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.store.set_enabled(false);
        info!("scheduler paused");
    }

    /// Re-arm scheduling, rebuilding the cancellation token when a prior
    /// emergency stop burned it.
    pub fn resume(&self) {
        {
            let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if cancel.is_cancelled() {
                info!("recreating request cancellation token");
                *cancel = CancellationToken::new();
            }
        }
        self.store.set_enabled(true);
        self.paused.store(false, Ordering::SeqCst);
        info!("scheduler resumed");
    }

    /// The big red button: pause and abort everything in flight.
    pub fn emergency_stop(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        self.store.set_enabled(false);
        warn!("emergency stop: cancelling in-flight requests");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn stats(&self) -> SchedulerStats {
        let config = self.store.snapshot();
        SchedulerStats {
            requests_scheduled: self.scheduled.load(Ordering::Relaxed),
            requests_in_flight: self.in_flight.load(Ordering::Relaxed),
            requests_skipped: self.skipped.load(Ordering::Relaxed),
            active_endpoints: config.endpoints.len(),
            enabled_endpoints: config.endpoints.iter().filter(|e| e.enabled).count(),
            paused: self.is_paused(),
            global_enabled: config.enabled,
            running: self.is_running(),
        }
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        self.tracker.close();

        match tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait()).await {
            Ok(()) => {
                info!("scheduler stopped");
                Ok(())
            }
            Err(_) => anyhow::bail!(
                "shutdown timeout: {} requests still in-flight",
                self.in_flight.load(Ordering::Relaxed)
            ),
        }
    }
}

fn calculate_interval(freq_per_min: f64, global_multiplier: f64) -> Duration {
    let adjusted = freq_per_min * global_multiplier;
    if adjusted <= 0.0 {
        return NEVER_INTERVAL;
    }
    Duration::from_secs_f64(60.0 / adjusted)
}
