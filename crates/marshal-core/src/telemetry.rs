//! Logging and tracing setup.
//!
//! Bridges `tracing` to a console layer, an optional JSONL span file under
//! the trace directory and, when an endpoint is configured, an OpenTelemetry
//! OTLP exporter.

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// OTLP endpoint (e.g., "http://localhost:4317"). `None` keeps traces local.
    pub otlp_endpoint: Option<String>,
    pub json_logs: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Directory for `spans-<date>.jsonl` files.
    pub trace_dir: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "marshal".into(),
            otlp_endpoint: None,
            json_logs: false,
            log_filter: "marshal=info".into(),
            trace_dir: None,
        }
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the program; dropping it
/// flushes pending spans.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let provider = match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()
                .context(format!("failed to build OTLP exporter for {endpoint}"))?;
            Some(
                SdkTracerProvider::builder()
                    .with_batch_exporter(exporter)
                    .build(),
            )
        }
        None => None,
    };

    let console_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::NONE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_span_events(FmtSpan::NONE)
            .boxed()
    };

    let file_layer = match &config.trace_dir {
        Some(trace_dir) => {
            std::fs::create_dir_all(trace_dir).context(format!(
                "failed to create trace dir: {}",
                trace_dir.display()
            ))?;
            let today = chrono::Utc::now().format("%Y-%m-%d");
            let path = trace_dir.join(format!("spans-{today}.jsonl"));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .context(format!("failed to open trace file: {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    let otel_layer = provider.as_ref().map(|p| {
        let tracer = p.tracer(config.service_name.clone());
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .with(otel_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(TelemetryGuard { provider })
}

/// Flushes OpenTelemetry spans on drop.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = &self.provider
            && let Err(e) = provider.shutdown()
        {
            eprintln!("failed to shut down OTel provider: {e}");
        }
    }
}
