use crate::config::LogLevel;
use opentelemetry::{
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Failed to build prometheus exporter: {0}")]
    Exporter(String),
    #[error("Failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),
    #[error("Metrics are not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub fn init_tracing(log_level: &LogLevel) {
    let log_level = format!("{},reqwest=info,hyper=info", log_level.as_str());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_level(true))
        .init();
}

pub struct Metrics {
    captures: Counter<u64>,
    cycles: Counter<u64>,
    cycle_duration: Histogram<u64>,
    registry: Registry,
    // Dropping the provider shuts the exporter down.
    _provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| MetricsError::Exporter(e.to_string()))?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("camera_sentinel");

        let captures = meter
            .u64_counter("captures_total")
            .with_description("Frame captures by camera and outcome")
            .build();

        let cycles = meter
            .u64_counter("cycles_total")
            .with_description("Monitoring cycles by outcome")
            .build();

        // Agent runs take seconds to minutes, so buckets go from 1s to 10min.
        let boundaries = generate_boundaries((1_000, 10_000, 60_000, 180_000, 600_000));

        let cycle_duration = meter
            .u64_histogram("cycle_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of monitoring cycles in milliseconds")
            .build();

        Ok(Metrics {
            captures,
            cycles,
            cycle_duration,
            registry,
            _provider: provider,
        })
    }

    pub fn record_capture(&self, camera: &str, outcome: &str) {
        let attributes = [
            KeyValue::new("camera", camera.to_string()),
            KeyValue::new("outcome", outcome.to_string()),
        ];
        self.captures.add(1, &attributes);
    }

    pub fn record_cycle(&self, duration_ms: u64, outcome: &str) {
        let attributes = [KeyValue::new("outcome", outcome.to_string())];
        self.cycles.add(1, &attributes);
        self.cycle_duration.record(duration_ms, &attributes);
    }

    pub fn render(&self) -> Result<String, MetricsError> {
        use prometheus::{Encoder, TextEncoder};

        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn generate_boundaries(parts: (u64, u64, u64, u64, u64)) -> Vec<f64> {
    let first_step: usize = 1_000;
    let middle_step: usize = 10_000;
    let end_step: usize = 30_000;
    let tail_step: usize = 120_000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
