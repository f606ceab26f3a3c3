use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace::config;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;

use crate::config::OtlpConfig;
use crate::errors::{Reraise, TrainerError};

/// Send traces to an OpenTelemetry collector over gRPC.
///
/// Without a `url` the exporter's default of
/// `grpc://127.0.0.1:4317` is used.
pub fn build(otlp: &OtlpConfig) -> Result<Tracer, TrainerError> {
    let mut exporter = opentelemetry_otlp::new_exporter().tonic();
    if let Some(endpoint) = otlp.url.as_ref() {
        exporter = exporter.with_endpoint(endpoint);
    }

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            config()
                .with_sampler(Sampler::TraceIdRatioBased(otlp.sampling_ratio))
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    otlp.service_name.clone(),
                )])),
        )
        .install_batch(Tokio)
        .reraise("error installing tracer")
}
