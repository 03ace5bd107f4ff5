use crate::auth::Authenticator;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::proxy::RequestParser;
use crate::upstream::UpstreamRegistry;
use std::sync::atomic::{AtomicI64, AtomicU64};
use std::sync::Arc;
use tracing::info;

/// Static HTML served at `/dashboard` when present in the working directory.
const DASHBOARD_FILE: &str = "dashboard.html";

/// Shared server state, cheaply cloneable. One value owns every component;
/// handlers receive it explicitly instead of reaching for process globals.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub auth: Arc<Authenticator>,
    pub parser: Arc<RequestParser>,
    pub registry: Arc<UpstreamRegistry>,
    pub metrics: Metrics,
    /// Live client connections, drives the `pg_active_connections` gauge,
    /// high-usage selection, and shutdown draining.
    pub active_clients: Arc<AtomicI64>,
    /// Deterministic sampler for tunnel logging (modulo at comparison time).
    pub log_counter: Arc<AtomicU64>,
    pub dashboard_html: Option<Arc<String>>,
}

impl ServerState {
    pub fn new(config: Config, metrics: Metrics) -> Self {
        let registry = Arc::new(UpstreamRegistry::new(&config));

        let dashboard_html = std::fs::read_to_string(DASHBOARD_FILE).ok().map(Arc::new);
        if dashboard_html.is_some() {
            info!("server: dashboard loaded from {}", DASHBOARD_FILE);
        }

        Self {
            auth: Arc::new(Authenticator::new(config.secret.clone())),
            parser: Arc::new(RequestParser::new()),
            registry,
            metrics,
            active_clients: Arc::new(AtomicI64::new(0)),
            log_counter: Arc::new(AtomicU64::new(0)),
            dashboard_html,
            config: Arc::new(config),
        }
    }
}
