//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every relay socket.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> for mutable shared data
//! - **config**: read by every new session, replaced by `PUT /api/v1/config`
//! - **metrics**: updated by the request middleware on every request
//!
//! ### Arc<T> for shared services with their own synchronization
//! - **registry**: the live session registry locks internally
//! - **connector**: opening upstream connections needs only `&self`
//! - **http**: `reqwest::Client` is already a cheap, clonable handle to a pool
//!
//! ### Trait objects
//! `Arc<dyn UpstreamConnector>` lets tests swap the Deepgram connector for an
//! in-memory one without changing any handler.

use crate::config::AppConfig;
use crate::relay::{SessionRegistry, UpstreamConnector};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Thread Safety Pattern:
/// Cloning `AppState` clones the `Arc`s, so every worker thread sees the same
/// configuration, metrics and registry.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by the middleware
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Every live relay session
    pub registry: Arc<SessionRegistry>,

    /// Opens recognition connections for new sessions
    pub connector: Arc<dyn UpstreamConnector>,

    /// Outbound HTTP client for the text-to-speech relay
    pub http: reqwest::Client,

    /// When the server started
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of error responses since server start
    pub error_count: u64,

    /// Key: matched route (e.g., "GET /api/v1/sessions/{id}")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-route counters.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Create the shared state for a validated configuration.
    ///
    /// ## What this does:
    /// 1. Sizes the session registry from `session.max_concurrent_sessions`
    /// 2. Builds the TTS HTTP client with the configured request timeout
    /// 3. Records the server start time
    pub fn new(config: AppConfig, connector: Arc<dyn UpstreamConnector>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.tts.request_timeout_secs))
            .build()?;

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(config.session.max_concurrent_sessions)),
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            connector,
            http,
            start_time: Instant::now(),
        })
    }

    fn config_read(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config_read().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// The registry capacity follows the new `max_concurrent_sessions`; sessions
    /// already running keep the settings they started with.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        self.registry
            .set_max_sessions(new_config.session.max_concurrent_sessions);
        *self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
        Ok(())
    }

    /// Record one finished request (called by the metrics middleware).
    ///
    /// ## Parameters:
    /// - **endpoint**: method plus matched route pattern, so `/sessions/{id}`
    ///   counts as one endpoint regardless of the id
    /// - **duration_ms**: time spent producing the response
    /// - **is_error**: whether the response status was 4xx/5xx
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
