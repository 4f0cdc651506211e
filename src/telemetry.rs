//! Tracing and telemetry wiring.
//!
//! A fmt subscriber (with `RUST_LOG`-style filtering) is always installed.
//! When any of the standard `OTEL_EXPORTER_OTLP_*` variables are present,
//! OTLP trace and metric export is layered on top, so deployments opt into
//! OpenTelemetry purely through the environment.

use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::{
    SCHEMA_URL,
    attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION},
};
use std::env;
use std::time::Duration;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OtlpProtocol {
    Http,
    Grpc,
}

impl OtlpProtocol {
    /// Export is enabled when any OTLP endpoint configuration is present.
    fn from_env() -> Option<Self> {
        let configured = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_HEADERS").is_ok()
            || env::var("OTEL_EXPORTER_OTLP_PROTOCOL").is_ok();
        if !configured {
            return None;
        }
        match env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref() {
            Ok("grpc") => Some(OtlpProtocol::Grpc),
            _ => Some(OtlpProtocol::Http),
        }
    }
}

fn resource() -> Resource {
    let environment = env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "develop".to_string());
    Resource::builder()
        .with_service_name(env!("CARGO_PKG_NAME"))
        .with_schema_url(
            [
                KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, environment),
            ],
            SCHEMA_URL,
        )
        .build()
}

fn build_meter_provider(protocol: OtlpProtocol) -> SdkMeterProvider {
    let exporter = opentelemetry_otlp::MetricExporter::builder();
    let exporter = match protocol {
        OtlpProtocol::Http => exporter.with_http().build(),
        OtlpProtocol::Grpc => exporter.with_tonic().build(),
    }
    .expect("OTLP metric exporter");

    let reader = PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(30))
        .build();
    let provider = MeterProviderBuilder::default()
        .with_resource(resource())
        .with_reader(reader)
        .build();
    global::set_meter_provider(provider.clone());
    provider
}

fn build_tracer_provider(protocol: OtlpProtocol) -> SdkTracerProvider {
    let exporter = opentelemetry_otlp::SpanExporter::builder();
    let exporter = match protocol {
        OtlpProtocol::Http => exporter.with_http().build(),
        OtlpProtocol::Grpc => exporter.with_tonic().build(),
    }
    .expect("OTLP span exporter");

    SdkTracerProvider::builder()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            1.0,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource())
        .with_batch_exporter(exporter)
        .build()
}

/// Holds the installed providers so export pipelines flush on shutdown.
pub struct Telemetry {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    pub fn init() -> Self {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        match OtlpProtocol::from_env() {
            Some(protocol) => {
                let tracer_provider = build_tracer_provider(protocol);
                let meter_provider = build_meter_provider(protocol);
                let tracer = tracer_provider.tracer("icy-swap");
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .with(MetricsLayer::new(meter_provider.clone()))
                    .with(OpenTelemetryLayer::new(tracer))
                    .init();
                tracing::info!(?protocol, "opentelemetry export enabled");
                Self {
                    tracer_provider: Some(tracer_provider),
                    meter_provider: Some(meter_provider),
                }
            }
            None => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(tracing_subscriber::fmt::layer())
                    .init();
                Self {
                    tracer_provider: None,
                    meter_provider: None,
                }
            }
        }
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.as_ref() {
            if let Err(error) = provider.shutdown() {
                eprintln!("tracer shutdown: {error:?}");
            }
        }
        if let Some(provider) = self.meter_provider.as_ref() {
            if let Err(error) = provider.shutdown() {
                eprintln!("meter shutdown: {error:?}");
            }
        }
    }
}
