//! Tracing setup shared by `fhir-server` and `fhir-worker`.
//!
//! The subscriber is a registry with a list of boxed layers: stdout, an
//! optional rolling file and an optional OTLP span exporter. One `EnvFilter`
//! gates all of them.
//!
//! Store, indexing and consumer events carry structured fields
//! (`resource_type`, `logical_id`, `version_id`, `job_id`), so JSON output is
//! the better choice outside development.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{Config as TraceConfig, Sampler, TracerProvider},
    Resource,
};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use std::time::Duration;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Holds the file writer's flush guard and shuts the tracer provider down
/// when dropped. Keep it alive until the process exits.
pub struct TelemetryGuard {
    _file_guard: Option<WorkerGuard>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        shutdown_telemetry();
    }
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` replaces the configured directives. An OTLP exporter that
/// cannot be built is reported once logging is up; the process then logs
/// locally only.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<TelemetryGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let (tracer_provider, otel_error) = if config.opentelemetry_enabled {
        match tracer_provider(config) {
            Ok(provider) => (Some(provider), None),
            Err(e) => (None, Some(e)),
        }
    } else {
        (None, None)
    };
    if let Some(provider) = &tracer_provider {
        let tracer = provider.tracer(config.service_name.clone());
        layers.push(
            tracing_opentelemetry::layer()
                .with_tracer(tracer)
                // spans end when their last handle drops
                .with_tracked_inactivity(true)
                .boxed(),
        );
    }

    layers.push(output_layer(config.json, std::io::stdout, true));

    let file_guard = if config.file_enabled {
        let (writer, guard) = file_writer(config)?;
        layers.push(output_layer(config.json, writer, false));
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(&config.level))
        .try_init()
        .map_err(|e| anyhow::anyhow!("A global subscriber is already installed: {e}"))?;

    if let Some(provider) = tracer_provider {
        global::set_tracer_provider(provider);
    }
    if let Some(e) = otel_error {
        tracing::warn!(
            error = %e,
            endpoint = %config.otlp_endpoint,
            "OpenTelemetry exporter unavailable, logging locally only"
        );
    }

    tracing::info!(
        otel_enabled = config.opentelemetry_enabled,
        service_name = %config.service_name,
        environment = %config.deployment_environment,
        json = config.json,
        file = config.file_enabled,
        "Logging initialized"
    );

    Ok(TelemetryGuard {
        _file_guard: file_guard,
    })
}

/// Flush and drop the tracer provider. Safe to call more than once.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

/// A formatting layer for one writer. Files never get ANSI colors.
fn output_layer<W>(json: bool, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed()
    }
}

fn default_directives(level: &str) -> String {
    format!(
        "fhir_server={level},fhir_worker={level},meridian={level},meridian_search={level},tower_http=debug,sqlx=warn"
    )
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

fn rotation(name: &str) -> Rotation {
    match name {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// Non-blocking rolling file writer under `file_directory`.
fn file_writer(config: &LoggingConfig) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(&config.file_directory).map_err(|e| {
        anyhow::anyhow!("Failed to create log directory {}: {e}", config.file_directory)
    })?;

    let rotation = rotation(&config.file_rotation);
    let mut builder = RollingFileAppender::builder()
        .rotation(rotation.clone())
        .filename_prefix(config.file_prefix.as_str());
    // A file that never rotates has no date part, so give it an extension.
    if rotation == Rotation::NEVER {
        builder = builder.filename_suffix("log");
    }
    let appender = builder.build(&config.file_directory).map_err(|e| {
        anyhow::anyhow!("Failed to open log file in {}: {e}", config.file_directory)
    })?;
    Ok(tracing_appender::non_blocking(appender))
}

fn resource(config: &LoggingConfig) -> Resource {
    let service_version = config
        .service_version
        .clone()
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    Resource::new(vec![
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, service_version),
        KeyValue::new("deployment.environment", config.deployment_environment.clone()),
        KeyValue::new("telemetry.sdk.language", "rust"),
    ])
}

fn sampler(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        // Follow the caller's decision when a trace is propagated in.
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio)))
    }
}

/// OTLP/gRPC span exporter behind a batch processor on the tokio runtime.
fn tracer_provider(config: &LoggingConfig) -> anyhow::Result<TracerProvider> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&config.otlp_endpoint)
        .with_timeout(Duration::from_secs(config.otlp_timeout_seconds))
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to create OTLP exporter: {e}"))?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_config(
            TraceConfig::default()
                .with_sampler(sampler(config.trace_sample_ratio))
                .with_resource(resource(config)),
        )
        .build())
}
