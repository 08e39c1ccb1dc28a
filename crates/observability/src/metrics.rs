//! Run metrics.
//!
//! The engine reports four series:
//!
//! - `runs_total{status, workflow_key}`
//! - `run_duration_seconds{workflow_key, status}`
//! - `step_failures_total{step_key, workflow_key}`
//! - `external_api_errors_total{step_key, api}`
//!
//! [`TracingMetrics`] turns them into structured log events; [`InMemoryMetrics`]
//! keeps counters in process so the worker can serve a snapshot.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

/// Sink for engine counters.
pub trait RunMetrics: Send + Sync {
    fn run_finished(&self, workflow_key: &str, status: &str, duration_seconds: f64);

    fn step_failed(&self, workflow_key: &str, step_key: &str);

    fn external_api_error(&self, step_key: &str, api: &str);
}

/// Emits every observation as a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl RunMetrics for TracingMetrics {
    fn run_finished(&self, workflow_key: &str, status: &str, duration_seconds: f64) {
        tracing::info!(metric = "runs_total", workflow_key, status, duration_seconds, "run finished");
    }

    fn step_failed(&self, workflow_key: &str, step_key: &str) {
        tracing::info!(metric = "step_failures_total", workflow_key, step_key, "step failed");
    }

    fn external_api_error(&self, step_key: &str, api: &str) {
        tracing::info!(metric = "external_api_errors_total", step_key, api, "external api error");
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct DurationSummary {
    pub count: u64,
    pub sum_seconds: f64,
    pub max_seconds: f64,
}

impl DurationSummary {
    fn observe(&mut self, seconds: f64) {
        self.count += 1;
        self.sum_seconds += seconds;
        if seconds > self.max_seconds {
            self.max_seconds = seconds;
        }
    }
}

/// Point-in-time copy of [`InMemoryMetrics`], keyed by rendered series name.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub durations: BTreeMap<String, DurationSummary>,
}

impl MetricsSnapshot {
    pub fn counter(&self, series: &str) -> u64 {
        self.counters.get(series).copied().unwrap_or(0)
    }
}

/// Process-local counters.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with<F: FnOnce(&mut MetricsSnapshot)>(&self, f: F) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

/// Render `name{a="x",b="y"}`.
pub fn series(name: &str, labels: &[(&str, &str)]) -> String {
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

impl RunMetrics for InMemoryMetrics {
    fn run_finished(&self, workflow_key: &str, status: &str, duration_seconds: f64) {
        let total = series("runs_total", &[("status", status), ("workflow_key", workflow_key)]);
        let duration = series(
            "run_duration_seconds",
            &[("workflow_key", workflow_key), ("status", status)],
        );
        self.with(|m| {
            *m.counters.entry(total).or_default() += 1;
            m.durations.entry(duration).or_default().observe(duration_seconds);
        });
    }

    fn step_failed(&self, workflow_key: &str, step_key: &str) {
        let key = series("step_failures_total", &[("step_key", step_key), ("workflow_key", workflow_key)]);
        self.with(|m| *m.counters.entry(key).or_default() += 1);
    }

    fn external_api_error(&self, step_key: &str, api: &str) {
        let key = series("external_api_errors_total", &[("step_key", step_key), ("api", api)]);
        self.with(|m| *m.counters.entry(key).or_default() += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_runs_and_durations_per_label_set() {
        let metrics = InMemoryMetrics::new();
        metrics.run_finished("weekly_content_summary", "SUCCESS", 2.0);
        metrics.run_finished("weekly_content_summary", "SUCCESS", 4.0);
        metrics.run_finished("weekly_content_summary", "FAILURE", 1.0);

        let snap = metrics.snapshot();
        assert_eq!(
            snap.counter("runs_total{status=\"SUCCESS\",workflow_key=\"weekly_content_summary\"}"),
            2
        );
        let summary = snap.durations["run_duration_seconds{workflow_key=\"weekly_content_summary\",status=\"SUCCESS\"}"];
        assert_eq!(summary.count, 2);
        assert_eq!(summary.sum_seconds, 6.0);
        assert_eq!(summary.max_seconds, 4.0);
    }

    #[test]
    fn step_and_api_failures_are_separate_series() {
        let metrics = InMemoryMetrics::new();
        metrics.step_failed("daily_channel_web_brief", "web_search");
        metrics.external_api_error("web_search", "web_search");

        let snap = metrics.snapshot();
        assert_eq!(
            snap.counter("step_failures_total{step_key=\"web_search\",workflow_key=\"daily_channel_web_brief\"}"),
            1
        );
        assert_eq!(snap.counter("external_api_errors_total{step_key=\"web_search\",api=\"web_search\"}"), 1);
        assert_eq!(snap.counter("runs_total{}"), 0);
    }
}
