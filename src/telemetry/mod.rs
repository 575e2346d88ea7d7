//! Logging and OpenTelemetry export for the monitor.
//!
//! Logs always go to stderr. When `OTEL_ENDPOINT` is set, the per-message
//! spans, the monitor's counters and the log stream are also shipped over
//! OTLP/gRPC, tagged with the broker session the process listens on.

pub mod message;
pub mod metrics;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::resource::{SERVICE_INSTANCE_ID, SERVICE_VERSION};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

/// Service name on every exported signal; also names the tracer and meter.
pub const SERVICE_NAME: &str = "swf-monitor";

/// Resource attribute naming the broker session, `host:port/topic`.
pub const BROKER_ATTRIBUTE: &str = "swf.broker";

pub struct TelemetryConfig {
    /// OTLP gRPC endpoint. `None` keeps everything on stderr.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Broker client id, exported as `service.instance.id`.
    pub instance_id: String,
    pub broker: Option<String>,
    /// Filter used when `RUST_LOG` is unset.
    pub default_level: String,
}

impl TelemetryConfig {
    pub fn from_config(config: &Config) -> Self {
        let broker = &config.broker;
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: SERVICE_NAME.to_string(),
            instance_id: broker.client_id.clone(),
            broker: Some(format!("{}:{}/{}", broker.host, broker.port, broker.topic)),
            default_level: config.log_level.clone(),
        }
    }

    fn resource(&self) -> Resource {
        let mut builder = Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attribute(KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")))
            .with_attribute(KeyValue::new(SERVICE_INSTANCE_ID, self.instance_id.clone()));
        if let Some(broker) = &self.broker {
            builder = builder.with_attribute(KeyValue::new(BROKER_ATTRIBUTE, broker.clone()));
        }
        builder.build()
    }
}

struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Providers {
    fn export_to(endpoint: &str, resource: Resource) -> Result<Self> {
        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| otel_error("build OTLP span exporter", e))?;
        let counters = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| otel_error("build OTLP metric exporter", e))?;
        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| otel_error("build OTLP log exporter", e))?;

        Ok(Self {
            tracer: SdkTracerProvider::builder()
                .with_batch_exporter(spans)
                .with_resource(resource.clone())
                .build(),
            meter: SdkMeterProvider::builder()
                .with_periodic_exporter(counters)
                .with_resource(resource.clone())
                .build(),
            logger: SdkLoggerProvider::builder()
                .with_batch_exporter(logs)
                .with_resource(resource)
                .build(),
        })
    }
}

/// Keeps the OTLP pipelines alive. Hold it for the life of the process;
/// dropping it flushes and shuts them down.
#[derive(Default)]
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

impl TelemetryGuard {
    /// Push buffered spans, metrics and logs to the collector now.
    pub fn force_flush(&self) -> Result<()> {
        let Some(p) = &self.providers else {
            return Ok(());
        };
        p.tracer
            .force_flush()
            .map_err(|e| otel_error("flush spans", e))?;
        p.meter
            .force_flush()
            .map_err(|e| otel_error("flush metrics", e))?;
        p.logger
            .force_flush()
            .map_err(|e| otel_error("flush logs", e))
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(p) = self.providers.take() else {
            return;
        };
        for (signal, result) in [
            ("logs", p.logger.shutdown()),
            ("metrics", p.meter.shutdown()),
            ("spans", p.tracer.shutdown()),
        ] {
            if let Err(e) = result {
                tracing::warn!(signal, error = %e, "telemetry shutdown failed");
            }
        }
    }
}

/// Install the global subscriber, exporting over OTLP when an endpoint is set.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| otel_error("install tracing subscriber", e))?;
        return Ok(TelemetryGuard::default());
    };

    let providers = Providers::export_to(endpoint, config.resource())?;
    opentelemetry::global::set_meter_provider(providers.meter.clone());
    let tracer = providers.tracer.tracer(SERVICE_NAME);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(OpenTelemetryTracingBridge::new(&providers.logger))
        .try_init()
        .map_err(|e| otel_error("install tracing subscriber", e))?;

    tracing::info!(
        endpoint,
        instance = %config.instance_id,
        broker = config.broker.as_deref().unwrap_or_default(),
        "exporting telemetry over OTLP"
    );
    Ok(TelemetryGuard {
        providers: Some(providers),
    })
}

fn otel_error(action: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to {action}: {e}"))
}
