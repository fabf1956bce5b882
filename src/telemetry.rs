//! Logging and OpenTelemetry tracing setup
//!
//! Console output always goes through the `tracing_subscriber` fmt layer.
//! When `[global.tracing]` is enabled, spans are also exported to an OTLP
//! collector (e.g., Jaeger, Tempo).

use anyhow::{Context, Result};
use config::TracingConfig;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Sampler, TracerProvider as SdkTracerProvider},
    Resource,
};
use tracing::{info, Level};
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Map a configured level name to a tracing level, defaulting to INFO
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber.
///
/// Returns the tracer provider when OTLP export is enabled; keep it alive for
/// the duration of the program. Batch export runs on the ambient tokio runtime,
/// so call this from inside one.
pub fn init_tracing(level: Level, config: &TracingConfig) -> Result<Option<SdkTracerProvider>> {
    let provider = if config.enabled {
        build_provider(config)
    } else {
        None
    };

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("modproxy")));

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(otel_layer)
        .try_init()
        .context("Failed to set tracing subscriber")?;

    if provider.is_some() {
        info!(
            endpoint = %config.otlp_endpoint,
            service = %config.service_name,
            sampling_ratio = config.sampling_ratio,
            "OpenTelemetry tracing initialized"
        );
    }

    Ok(provider)
}

fn sampler(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    }
}

fn build_provider(config: &TracingConfig) -> Option<SdkTracerProvider> {
    let trace_config = opentelemetry_sdk::trace::Config::default()
        .with_sampler(sampler(config.sampling_ratio))
        .with_resource(Resource::new(vec![opentelemetry::KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]));

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(&config.otlp_endpoint),
        )
        .with_trace_config(trace_config)
        .install_batch(opentelemetry_sdk::runtime::Tokio)
    {
        Ok(provider) => Some(provider),
        Err(e) => {
            // No subscriber yet
            eprintln!("Failed to create OTLP tracer provider: {}", e);
            None
        }
    }
}
