//! Tracing setup for the `safety` binary.
//!
//! Logs go to stdout as text, or JSON with `LOG_FORMAT=json`, filtered by
//! `RUST_LOG`. Spans are also exported over OTLP when `OTEL_ENABLED=true`.

use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{Resource, runtime, trace::TracerProvider};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use std::env;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{SafetyError, SafetyResult};

const DEFAULT_FILTER: &str = "safety=info";
const DEFAULT_SERVICE_NAME: &str = "safety";
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4317";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Logging and export settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub otel_enabled: bool,
    pub service_name: String,
    pub endpoint: String,
    pub json: bool,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            otel_enabled: env::var("OTEL_ENABLED")
                .ok()
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(false),
            service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string()),
            endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_OTLP_ENDPOINT.to_string()),
            json: env::var("LOG_FORMAT").is_ok_and(|v| v == "json"),
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing() -> SafetyResult<()> {
    let config = TelemetryConfig::from_env();

    let otel_layer = if config.otel_enabled {
        let provider = tracer_provider(&config)?;
        global::set_tracer_provider(provider.clone());
        Some(tracing_opentelemetry::layer().with_tracer(provider.tracer(DEFAULT_SERVICE_NAME)))
    } else {
        None
    };

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter())
        .with(otel_layer)
        .try_init()
        .map_err(|e| SafetyError::InternalError(format!("Failed to install subscriber: {e}")))?;

    tracing::debug!(
        otel = config.otel_enabled,
        endpoint = config.endpoint,
        "Tracing initialized"
    );
    Ok(())
}

/// Batch OTLP span exporter for `config`. Needs a running tokio runtime.
pub fn tracer_provider(config: &TelemetryConfig) -> SafetyResult<TracerProvider> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.endpoint.clone())
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .map_err(|e| SafetyError::InternalError(format!("Failed to create exporter: {e}")))?;

    Ok(TracerProvider::builder()
        .with_resource(Resource::new(vec![
            KeyValue::new(SERVICE_NAME, config.service_name.clone()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ]))
        .with_batch_exporter(exporter, runtime::Tokio)
        .build())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

/// Flush and drop the global tracer provider.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}
