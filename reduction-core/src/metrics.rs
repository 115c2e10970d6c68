//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for the entity runtime.
//!
//! # Metrics
//!
//! - `reduction_commands_total{kind}` - Commands executed per entity kind
//! - `reduction_events_total{kind}` - Events journaled per entity kind
//! - `reduction_rejections_total{kind}` - Commands rejected by `decide`
//! - `reduction_replays_total` - Actors rebuilt from the journal
//! - `reduction_command_duration_seconds` - Histogram of command latencies
//! - `reduction_actors_active` - Live entity actors
//! - `reduction_passivations_total` - Idle actors stopped and dropped

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::{Error, Result};

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Commands executed
    pub commands_total: IntCounterVec,

    /// Events journaled
    pub events_total: IntCounterVec,

    /// Commands rejected
    pub rejections_total: IntCounterVec,

    /// Journal replays
    pub replays_total: IntCounter,

    /// Command latency histogram
    pub command_duration: Histogram,

    /// Live actors
    pub actors_active: IntGauge,

    /// Idle actors stopped
    pub passivations_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector on its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let commands_total = IntCounterVec::new(
            Opts::new("reduction_commands_total", "Commands executed per entity kind"),
            &["kind"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let events_total = IntCounterVec::new(
            Opts::new("reduction_events_total", "Events journaled per entity kind"),
            &["kind"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("reduction_rejections_total", "Commands rejected per entity kind"),
            &["kind"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let replays_total = IntCounter::new(
            "reduction_replays_total",
            "Actors rebuilt from the journal",
        )?;
        registry.register(Box::new(replays_total.clone()))?;

        let command_duration = Histogram::with_opts(
            HistogramOpts::new(
                "reduction_command_duration_seconds",
                "Histogram of command latencies",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500]),
        )?;
        registry.register(Box::new(command_duration.clone()))?;

        let actors_active = IntGauge::new("reduction_actors_active", "Live entity actors")?;
        registry.register(Box::new(actors_active.clone()))?;

        let passivations_total = IntCounter::new(
            "reduction_passivations_total",
            "Idle actors stopped and dropped",
        )?;
        registry.register(Box::new(passivations_total.clone()))?;

        Ok(Self {
            commands_total,
            events_total,
            rejections_total,
            replays_total,
            command_duration,
            actors_active,
            passivations_total,
            registry,
        })
    }

    /// Record one executed command and the events it journaled
    pub fn record_command(&self, kind: &str, events: usize) {
        self.commands_total.with_label_values(&[kind]).inc();
        self.events_total
            .with_label_values(&[kind])
            .inc_by(events as u64);
    }

    /// Record a rejected command
    pub fn record_rejection(&self, kind: &str) {
        self.rejections_total.with_label_values(&[kind]).inc();
    }

    /// Record a journal replay
    pub fn record_replay(&self) {
        self.replays_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registry contents in the Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| Error::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| Error::Metrics(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.replays_total.get(), 0);
        assert_eq!(metrics.actors_active.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        // each collector owns its registry, so two runtimes can coexist
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_command("node", 2);
        assert_eq!(first.events_total.with_label_values(&["node"]).get(), 2);
        assert_eq!(second.events_total.with_label_values(&["node"]).get(), 0);
    }

    #[test]
    fn test_record_rejection() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejection("leaf");
        metrics.record_rejection("leaf");
        assert_eq!(metrics.rejections_total.with_label_values(&["leaf"]).get(), 2);
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_export_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.record_command("shard", 1);
        metrics.passivations_total.inc();
        let text = metrics.export().unwrap();
        assert!(text.contains("reduction_commands_total{kind=\"shard\"} 1"));
        assert!(text.contains("reduction_passivations_total 1"));
    }
}
