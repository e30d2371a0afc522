//! Log and trace subscriber setup.
//!
//! Call [`init_tracing`] once at process startup and keep the returned guard
//! alive. The filter comes from `RUST_LOG` when set, otherwise from
//! [`TelemetryConfig::log_level`]. Spans are exported over OTLP/HTTP when an
//! endpoint is configured or `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//!
//! ```rust,no_run
//! use vector_connection::config::TelemetryConfig;
//!
//! let _guard = vector_connection::telemetry::init_tracing("vector", &TelemetryConfig::default());
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, TelemetryConfig};

/// Install the global subscriber. A second call leaves the first subscriber
/// in place.
pub fn init_tracing(service_name: &str, config: &TelemetryConfig) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
    };

    let endpoint = config
        .otlp_endpoint
        .clone()
        .or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok());
    let provider = build_provider(service_name, endpoint);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("vector-connection")));

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
    {
        eprintln!("[vector] tracing subscriber already installed: {e}");
    }

    TelemetryGuard(provider)
}

/// Flushes and shuts down the span exporter on drop.
pub struct TelemetryGuard(Option<SdkTracerProvider>);

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[vector] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

fn build_provider(service_name: &str, endpoint: Option<String>) -> Option<SdkTracerProvider> {
    let endpoint = endpoint?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[vector] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    // Simple exporter: the caller may not have a tokio runtime running yet,
    // and each session owns its own.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}
