//! Metrics sink (spec §1): best-effort point writes. Out of scope as a
//! backend; the call sites stay (ambient observability is carried
//! regardless of Non-goals), logging through `tracing` by default.

pub trait MetricsSink: Send + Sync {
    fn record(&self, name: &str, value: f64, tags: &[(&str, &str)]);
}

pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let tags = tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        tracing::trace!(metric = name, value, tags = %tags, "metric point");
    }
}
