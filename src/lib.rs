pub mod bounder;
pub mod config;
pub mod error;
pub mod extract;
pub mod fanout;
pub mod fetcher;
pub mod filter;
pub mod job;
pub mod ledger;
pub mod local;
pub mod metrics;
pub mod orchestrator;
pub mod pages;
pub mod queue;
pub mod resolver;

#[cfg(feature = "distributed")]
pub mod aws;

pub use error::*;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber: `RUST_LOG` filter (default `info`) and a fmt layer.
///
/// With the `otel` feature and `HARVEST_OTLP_ENDPOINT` set, spans are also exported over OTLP/HTTP.
pub fn init_tracing(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    if let Ok(endpoint) = std::env::var("HARVEST_OTLP_ENDPOINT") {
        match otel_layer(service_name, &endpoint) {
            Ok(layer) => {
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(layer)
                    .with(tracing_subscriber::fmt::layer())
                    .try_init();
                return;
            }
            Err(e) => eprintln!("[harvest] OTLP exporter unavailable: {}", e),
        }
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    tracing::debug!(service = service_name, "tracing initialized");
}

#[cfg(feature = "otel")]
fn otel_layer<S>(
    service_name: &str,
    endpoint: &str,
) -> Result<tracing_opentelemetry::OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>, HarvestError>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    use opentelemetry::trace::TracerProvider;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::{Protocol, WithExportConfig};
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| HarvestError::Config(format!("OTLP exporter: {}", e)))?;
    let resource = Resource::builder_empty()
        .with_attributes(vec![KeyValue::new("service.name", service_name.to_string())])
        .build();
    let provider = sdktrace::SdkTracerProvider::builder()
        .with_simple_exporter(exporter)
        .with_resource(resource)
        .build();
    let tracer = provider.tracer(service_name.to_string());
    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}
