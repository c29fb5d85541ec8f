use std::{sync::Arc, time::Instant};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    client::TokenManager,
    config::ConfigStore,
    envfile::EnvSource,
    metrics::{IncomingCollector, OutgoingCollector},
    scheduler::Scheduler,
};

/// Shared application state passed into HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub scheduler: Arc<Scheduler>,
    pub outgoing: Arc<OutgoingCollector>,
    pub incoming: Arc<IncomingCollector>,
    pub tokens: Arc<TokenManager>,
    pub env: EnvSource,
    pub metrics_handle: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ConfigStore>,
        scheduler: Arc<Scheduler>,
        outgoing: Arc<OutgoingCollector>,
        incoming: Arc<IncomingCollector>,
        tokens: Arc<TokenManager>,
        env: EnvSource,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        Self {
            store,
            scheduler,
            outgoing,
            incoming,
            tokens,
            env,
            metrics_handle,
            started_at: Instant::now(),
        }
    }
}
