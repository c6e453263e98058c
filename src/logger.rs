use std::{path::PathBuf, sync::OnceLock};
use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{Resource, logs::SdkLoggerProvider, trace::SdkTracerProvider};
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

use crate::orchestrator::SWITCH_TARGET;

const SERVICE_NAME: &str = "coffeeshop";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: PathBuf,
    pub log_file: String,
    pub switch_file: String,
    pub otel_endpoint: Option<String>,
}

impl LogConfig {
    pub fn new(log_level: &str, log_dir: PathBuf, otel_endpoint: Option<String>) -> Self {
        Self {
            log_level: log_level.to_string(),
            log_dir,
            log_file: "coffeeshop.log".to_string(),
            switch_file: "switches.json".to_string(),
            otel_endpoint,
        }
    }
}

/// Keeps the exporters alive; flush them with [`Telemetry::shutdown`].
pub enum Telemetry {
    Otlp {
        logger_provider: SdkLoggerProvider,
        tracer_provider: SdkTracerProvider,
    },
    Files,
}

impl Telemetry {
    pub fn shutdown(self) {
        if let Telemetry::Otlp {
            logger_provider,
            tracer_provider,
        } = self
        {
            if let Err(e) = tracer_provider.shutdown() {
                eprintln!("tracer shutdown failed: {e}");
            }
            if let Err(e) = logger_provider.shutdown() {
                eprintln!("logger shutdown failed: {e}");
            }
        }
    }
}

/// Install the global subscriber: OTLP when an endpoint is configured,
/// otherwise a daily text log plus a JSON log of context switches.
pub fn init_tracing(config: &LogConfig) -> Result<Telemetry> {
    match &config.otel_endpoint {
        Some(endpoint) => init_otlp(&config.log_level, endpoint),
        None => init_files(config),
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name(SERVICE_NAME).build())
        .clone()
}

fn init_otlp(log_level: &str, endpoint: &str) -> Result<Telemetry> {
    let log_exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building the OTLP log exporter")?;
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(log_exporter)
        .with_resource(get_resource())
        .build();

    let span_exporter = SpanExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .context("building the OTLP span exporter")?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(span_exporter)
        .with_resource(get_resource())
        .build();

    // exporter traffic must not feed back into itself
    let otel_filter = EnvFilter::try_new(log_level)?
        .add_directive("hyper=off".parse()?)
        .add_directive("h2=off".parse()?)
        .add_directive("reqwest=off".parse()?);
    let otel_layer = OpenTelemetryTracingBridge::new(&logger_provider).with_filter(otel_filter);
    let fmt_layer = fmt::layer()
        .with_thread_names(true)
        .with_filter(EnvFilter::try_new(log_level)?);

    Registry::default()
        .with(otel_layer)
        .with(fmt_layer)
        .try_init()?;

    global::set_tracer_provider(tracer_provider.clone());
    info!("Exporting telemetry to {}", endpoint);

    Ok(Telemetry::Otlp {
        logger_provider,
        tracer_provider,
    })
}

fn init_files(config: &LogConfig) -> Result<Telemetry> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("creating log directory {}", config.log_dir.display()))?;

    let txt_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, &config.log_file);
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::try_new(&config.log_level)?);

    let json_appender =
        RollingFileAppender::new(Rotation::DAILY, &config.log_dir, &config.switch_file);
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::try_new(format!("{SWITCH_TARGET}=info"))?);

    let stdout_layer = fmt::layer().with_filter(EnvFilter::try_new(&config.log_level)?);

    Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .with(stdout_layer)
        .try_init()?;

    info!("Logging to {}", config.log_dir.display());
    Ok(Telemetry::Files)
}
