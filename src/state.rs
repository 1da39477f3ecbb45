//! # Application State Management
//!
//! Shared state accessed by every HTTP handler and WebSocket connection.
//! All mutable data lives behind `Arc<RwLock<T>>`: many readers or one
//! writer, with no data races possible.
//!
//! The relay's service objects (connection registry, rooms, sessions,
//! fan-out router) are constructed once in `main` and carried here as
//! explicit handles; nothing in the relay reaches for global state.

use crate::audio::session::StreamingSessionManager;
use crate::config::AppConfig;
use crate::engines::SpeechToText;
use crate::relay::connection::ConnectionRegistry;
use crate::relay::fanout::TranslationFanoutRouter;
use crate::relay::multiparty::MultipartyManager;
use crate::relay::room::RoomRegistry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Handles to the relay's core services, injected everywhere they're used.
#[derive(Clone)]
pub struct RelayServices {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub multiparty: Arc<MultipartyManager>,
    pub sessions: Arc<StreamingSessionManager>,
    pub router: Arc<TranslationFanoutRouter>,
    pub transcriber: Arc<dyn SpeechToText>,
}

/// The main application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance metrics, updated by middleware and the relay
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Relay service handles
    pub services: RelayServices,
}

/// Counters collected across HTTP requests and relay activity.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests processed since server start
    pub request_count: u64,

    /// Total errors encountered since server start
    pub error_count: u64,

    /// Currently open WebSocket connections
    pub active_connections: u32,

    /// Currently open audio streaming sessions
    pub active_stream_sessions: u32,

    /// Room/session messages fanned out since start
    pub messages_relayed: u64,

    /// Successful per-recipient translations
    pub translations_completed: u64,

    /// Translation or synthesis failures isolated to a recipient
    pub translation_failures: u64,

    /// Deliveries that found the recipient unreachable
    pub delivery_failures: u64,

    /// Per-endpoint statistics, keyed by "METHOD path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for one API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppMetrics {
    /// One stream session opened.
    pub fn stream_session_opened(&mut self) {
        self.active_stream_sessions += 1;
    }

    pub fn stream_session_closed(&mut self) {
        if self.active_stream_sessions > 0 {
            self.active_stream_sessions -= 1;
        }
    }

    /// Fold one fan-out's outcome into the relay counters.
    pub fn record_fanout(&mut self, translated: u64, failed: u64, unreachable: u64) {
        self.messages_relayed += 1;
        self.translations_completed += translated;
        self.translation_failures += failed;
        self.delivery_failures += unreachable;
    }
}

impl AppState {
    /// `metrics` is shared with the streaming session manager, which owns the
    /// stream-session gauge and the stream fan-out counters.
    pub fn new(
        config: AppConfig,
        metrics: Arc<RwLock<AppMetrics>>,
        services: RelayServices,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics,
            start_time: Instant::now(),
            services,
        }
    }

    /// Copy of the current configuration; cloning releases the lock fast.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record per-endpoint timing; first sight of an endpoint creates its
    /// entry with zeroed counters.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn connection_opened(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_connections += 1;
    }

    pub fn connection_closed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // underflow guard
        if metrics.active_connections > 0 {
            metrics.active_connections -= 1;
        }
    }

    /// Fold one fan-out report into the relay counters.
    pub fn record_fanout(&self, translated: u64, failed: u64, unreachable: u64) {
        self.metrics
            .write()
            .unwrap()
            .record_fanout(translated, failed, unreachable);
    }

    /// Snapshot for the /metrics endpoint; cloned so no lock is held while
    /// the response serializes.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_connections: metrics.active_connections,
            active_stream_sessions: metrics.active_stream_sessions,
            messages_relayed: metrics.messages_relayed,
            translations_completed: metrics.translations_completed,
            translation_failures: metrics.translation_failures,
            delivery_failures: metrics.delivery_failures,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time: total duration ÷ request count.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate in [0.0, 1.0].
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
