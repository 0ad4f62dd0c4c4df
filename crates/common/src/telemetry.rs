//! Tracing subscriber initialisation.
//!
//! Every binary emits structured JSON logs. Services that run on the control
//! plane additionally export spans over OTLP/gRPC when a collector endpoint is
//! configured.
//!
//! No key material must appear in any span attribute or log field.

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise JSON logs only. `RUST_LOG` overrides `log_level`.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been set.
pub fn init_json(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing subscriber: {e}"))
}

/// Initialise JSON logs plus an OTLP span exporter for `service_name`.
///
/// # Errors
///
/// Returns an error if the OTLP exporter or SDK pipeline cannot be initialised.
pub fn init_with_otlp(service_name: &'static str, otlp_endpoint: &str, log_level: &str) -> Result<()> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(otlp_endpoint),
        )
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default().with_resource(service_resource(service_name)),
        )
        .install_batch(runtime::Tokio)
        .context("failed to install OTLP tracing pipeline")?;

    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(otel_layer)
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    Ok(())
}

/// Pick [`init_with_otlp`] when an endpoint is configured, [`init_json`] otherwise.
pub fn init(service_name: &'static str, otlp_endpoint: Option<&str>, log_level: &str) -> Result<()> {
    match otlp_endpoint {
        Some(endpoint) if !endpoint.trim().is_empty() => {
            init_with_otlp(service_name, endpoint, log_level)
        }
        _ => init_json(log_level),
    }
}

fn service_resource(service_name: &'static str) -> Resource {
    Resource::new(vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            service_name,
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ])
}
