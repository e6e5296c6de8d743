use opentelemetry::{global, trace::TracerProvider as _, Array, KeyValue, StringValue, Value};
use opentelemetry_sdk::{
    export::trace::SpanExporter,
    runtime,
    trace::{self as sdktrace, TracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_core::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::{config::Config, error::Result};

/// Resource attribute holding the configured tags.
pub const TAGS: &str = "apitoolkit.tags";

/// Installs the global tracer provider and the `tracing` subscriber.
///
/// Spans are handed to `exporter` in batches on the tokio runtime, so this
/// must be called from inside one. The log level defaults to `INFO` and can be
/// changed through `RUST_LOG`.
///
/// This should generally be the first statement of any server binary's main
/// function. The returned provider is also installed globally; keep it around
/// to force a flush, or call [`teardown`] on shutdown.
///
/// # Errors
///
/// Fails with [`Error::Subscriber`](crate::Error::Subscriber) when a global
/// subscriber is already set. The global tracer provider is left untouched
/// in that case.
pub fn setup<E>(config: &Config, exporter: E) -> Result<TracerProvider>
where
    E: SpanExporter + 'static,
{
    let provider = TracerProvider::builder()
        .with_config(sdktrace::config().with_resource(resource(config)))
        .with_batch_exporter(exporter, runtime::Tokio)
        .build();

    let tracer = provider.tracer(config.service_name().to_owned());
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy()
        }))
        .with(telemetry)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    global::set_tracer_provider(provider.clone());

    tracing::info!(service = config.service_name(), "instrumentation installed");
    Ok(provider)
}

pub fn teardown() {
    global::shutdown_tracer_provider();
}

fn resource(config: &Config) -> Resource {
    let mut attributes = vec![KeyValue::new(SERVICE_NAME, config.service_name().to_owned())];
    if let Some(version) = config.service_version() {
        attributes.push(KeyValue::new(SERVICE_VERSION, version.to_owned()));
    }
    if !config.tags().is_empty() {
        let tags = config
            .tags()
            .iter()
            .cloned()
            .map(StringValue::from)
            .collect();
        attributes.push(KeyValue::new(TAGS, Value::Array(Array::String(tags))));
    }

    Resource::new(attributes)
}
