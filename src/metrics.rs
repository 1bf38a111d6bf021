//! Metrics for the control plane service.
//!
//! Counters for controller events and a histogram for run duration, exported
//! over OTLP when enabled in config.

use anyhow::Result;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};

use crate::config::TelemetryConfig;

/// Initialize the OpenTelemetry metrics provider.
///
/// Sets up the global meter provider with OTLP export if metrics are
/// enabled. Must be called before any metrics are recorded.
pub fn init_provider(config: &TelemetryConfig, node_id: &str) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "caskstore"))
        .with_attribute(KeyValue::new("service.name", "caskstore-controlplane"))
        .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
        .with_attribute(KeyValue::new("caskstore.node.id", node_id.to_string()))
        .build();

    let mut exporter_builder = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = &config.endpoint {
        exporter_builder = exporter_builder.with_endpoint(endpoint.clone());
    }
    let exporter = exporter_builder.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.metrics_interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);

    tracing::info!(
        node_id = node_id,
        endpoint = ?config.endpoint,
        interval_secs = config.metrics_interval.as_secs(),
        "Metrics provider initialized"
    );

    Ok(())
}

/// Counters for controller events.
#[derive(Clone)]
pub struct ControlPlaneCounters {
    pub runs_admitted: Counter<u64>,
    pub jobs_dispatched: Counter<u64>,
    pub reports_collected: Counter<u64>,
    pub suspends: Counter<u64>,
    pub resumes: Counter<u64>,
    pub locks_observed: Counter<u64>,
    pub badstate_replies: Counter<u64>,
}

/// Histograms for job- and run-level measurements.
#[derive(Clone)]
pub struct ControlPlaneHistograms {
    /// Duration of a single per-container compaction pass, as reported by
    /// the worker.
    pub job_duration_ms: Histogram<u64>,
    pub run_duration_seconds: Histogram<f64>,
}

/// Metrics bag shared across the control plane.
#[derive(Clone)]
pub struct ControlPlaneMetrics {
    pub counters: ControlPlaneCounters,
    pub histograms: ControlPlaneHistograms,
}

impl Default for ControlPlaneMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPlaneMetrics {
    pub fn new() -> Self {
        let meter = opentelemetry::global::meter("caskstore-controlplane");

        Self {
            counters: ControlPlaneCounters {
                runs_admitted: meter
                    .u64_counter("caskstore.controlplane.runs.admitted")
                    .with_description("Number of compaction runs admitted")
                    .build(),
                jobs_dispatched: meter
                    .u64_counter("caskstore.controlplane.jobs.dispatched")
                    .with_description("Number of per-container jobs dispatched to runners")
                    .build(),
                reports_collected: meter
                    .u64_counter("caskstore.controlplane.reports.collected")
                    .with_description("Number of compaction reports received from runners")
                    .build(),
                suspends: meter
                    .u64_counter("caskstore.controlplane.suspends")
                    .with_description("Number of accepted suspend requests")
                    .build(),
                resumes: meter
                    .u64_counter("caskstore.controlplane.resumes")
                    .with_description("Number of accepted resume requests")
                    .build(),
                locks_observed: meter
                    .u64_counter("caskstore.controlplane.locks.observed")
                    .with_description("Number of container lock events observed mid-run")
                    .build(),
                badstate_replies: meter
                    .u64_counter("caskstore.controlplane.badstate_replies")
                    .with_description("Number of control requests rejected for the current state")
                    .build(),
            },
            histograms: ControlPlaneHistograms {
                job_duration_ms: meter
                    .u64_histogram("caskstore.controlplane.job.duration_ms")
                    .with_description("Per-container compaction pass duration in milliseconds")
                    .with_unit("ms")
                    .build(),
                run_duration_seconds: meter
                    .f64_histogram("caskstore.controlplane.run.duration_seconds")
                    .with_description("Wall-clock duration of completed compaction runs")
                    .with_unit("s")
                    .build(),
            },
        }
    }
}
