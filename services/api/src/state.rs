//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the relay shared by
//! every connection along with process-wide counters.

use crate::config::Config;
use chrono::{DateTime, Utc};
use relay_core::Relay;
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

/// The shared application state, created once at startup and passed to all handlers.
/// All fields are public to be accessible from other modules.
#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub config: Arc<Config>,
    pub stats: Arc<RelayStats>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(relay: Relay, config: Config) -> Self {
        Self {
            relay,
            config: Arc::new(config),
            stats: Arc::new(RelayStats::default()),
            started_at: Utc::now(),
        }
    }
}

/// Connection counters reported by the health endpoint.
#[derive(Debug, Default)]
pub struct RelayStats {
    active: AtomicUsize,
    total: AtomicU64,
}

impl RelayStats {
    /// Counts a new connection. It stays active until the guard is dropped.
    pub fn session_started(self: &Arc<Self>) -> ActiveSession {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        ActiveSession(Arc::clone(self))
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn total_sessions(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Marks one connection as active for as long as it lives.
#[derive(Debug)]
pub struct ActiveSession(Arc<RelayStats>);

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
impl AppState {
    /// State around `backend` with the default relay settings.
    pub(crate) fn for_tests(backend: Arc<dyn relay_core::TranscriptionBackend>) -> Arc<Self> {
        Self::for_tests_with_buffer(backend, 256)
    }

    pub(crate) fn for_tests_with_buffer(
        backend: Arc<dyn relay_core::TranscriptionBackend>,
        client_buffer_capacity: usize,
    ) -> Arc<Self> {
        use crate::config::Provider;
        use std::time::Duration;

        let config = Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            relay_path: "/connection".to_string(),
            provider: Provider::Gateway,
            speech_gateway_endpoint: Some("ws://127.0.0.1:1/unused".to_string()),
            speech_gateway_api_key: None,
            openai_api_key: None,
            openai_realtime_model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
            openai_transcription_model: "whisper-1".to_string(),
            speech_phrases: Vec::new(),
            client_buffer_capacity,
            idle_timeout: None,
            backend_drain_timeout: Duration::from_millis(500),
            backend_open_timeout: Duration::from_secs(2),
            log_level: tracing::Level::INFO,
        };
        let relay = Relay::new(backend, config.relay_settings());
        Arc::new(Self::new(relay, config))
    }
}
