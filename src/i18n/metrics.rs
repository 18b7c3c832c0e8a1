//! Translation metrics and observability.
//!
//! Counts how each backend in the fallback chain fares, and how often a send
//! ended up with the untranslated original.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackendCounters {
    pub successes: usize,
    pub failures: usize,
    pub timeouts: usize,
}

#[derive(Debug, Default)]
pub struct TranslationMetrics {
    /// Translations requested (source and target differed)
    requests: AtomicUsize,

    /// Requests where every backend failed and the original text was kept
    noop_results: AtomicUsize,

    backends: Mutex<BTreeMap<String, BackendCounters>>,
}

impl TranslationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn backends(&self) -> MutexGuard<'_, BTreeMap<String, BackendCounters>> {
        // Counters stay usable even if a holder panicked mid-update
        self.backends.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_noop(&self) {
        self.noop_results.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, backend: &str) {
        self.backends().entry(backend.to_string()).or_default().successes += 1;
    }

    pub fn record_failure(&self, backend: &str) {
        self.backends().entry(backend.to_string()).or_default().failures += 1;
    }

    pub fn record_timeout(&self, backend: &str) {
        self.backends().entry(backend.to_string()).or_default().timeouts += 1;
    }

    pub fn backend(&self, backend: &str) -> BackendCounters {
        self.backends().get(backend).copied().unwrap_or_default()
    }

    pub fn report(&self) -> MetricsReport {
        let requests = self.requests.load(Ordering::Relaxed);
        let noop_results = self.noop_results.load(Ordering::Relaxed);
        let translated_rate = if requests > 0 {
            ((requests - noop_results.min(requests)) as f64 / requests as f64) * 100.0
        } else {
            0.0
        };

        MetricsReport {
            requests,
            noop_results,
            translated_rate,
            backends: self.backends().clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub requests: usize,
    pub noop_results: usize,
    /// Percentage of requests that produced a translated text
    pub translated_rate: f64,
    pub backends: BTreeMap<String, BackendCounters>,
}

impl MetricsReport {
    /// One-line summary for the logs.
    pub fn format_summary(&self) -> String {
        format!(
            "Translations: {} requested, {} untranslated ({:.1}% translated)",
            self.requests, self.noop_results, self.translated_rate
        )
    }
}
