//! OpenTelemetry integration for reconcile-controller
//!
//! Tracing and metrics providers with optional OTLP export, plus the
//! controller's metric instruments and the tracing subscriber setup.

use crate::config::{LoggingConfig, OtelConfig};
use crate::models::EventKind;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, MeterProvider as _},
    trace::TracerProvider as TracerProviderTrait,
    KeyValue,
};
use opentelemetry_sdk::{metrics::SdkMeterProvider, trace::TracerProvider, Resource};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// OpenTelemetry error types
#[derive(Debug, Error)]
pub enum OtelError {
    /// Failed to initialize tracer
    #[error("Failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize meter
    #[error("Failed to initialize meter: {0}")]
    MeterInit(String),

    /// Failed to shutdown
    #[error("Failed to shutdown: {0}")]
    Shutdown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Tracer and meter providers for the controller process
///
/// Without an OTLP endpoint the meter provider has no reader and spans are
/// only seen by the log layers.
pub struct OtelProvider {
    tracer_provider: Option<TracerProvider>,
    meter_provider: SdkMeterProvider,
    config: OtelConfig,
}

impl OtelProvider {
    pub fn new(config: &OtelConfig) -> Result<Self, OtelError> {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]);

        if !config.enabled {
            return Ok(Self {
                tracer_provider: None,
                meter_provider: SdkMeterProvider::builder().with_resource(resource).build(),
                config: config.clone(),
            });
        }

        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| OtelError::Config("OTLP endpoint is required when enabled".into()))?;

        let tracer_provider = otlp_tracer_provider(endpoint, &resource)?;
        let meter_provider = otlp_meter_provider(endpoint, &resource)?;
        global::set_tracer_provider(tracer_provider.clone());

        Ok(Self {
            tracer_provider: Some(tracer_provider),
            meter_provider,
            config: config.clone(),
        })
    }

    /// Tracer for the `tracing-opentelemetry` layer; a no-op tracer when disabled
    pub fn tracer(&self, name: &'static str) -> opentelemetry_sdk::trace::Tracer {
        match self.tracer_provider {
            Some(ref tp) => tp.tracer(name),
            None => TracerProvider::builder().build().tracer(name),
        }
    }

    /// Meter the controller instruments are created from
    pub fn meter(&self) -> Meter {
        self.meter_provider.meter(self.config.service_name.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Flush pending spans and stop the metrics reader
    ///
    /// Both providers are always attempted; the first failure is returned.
    pub fn shutdown(&self) -> Result<(), OtelError> {
        let mut first_error = None;

        if let Some(ref tp) = self.tracer_provider {
            if let Some(Err(e)) = tp.force_flush().into_iter().find(|r| r.is_err()) {
                first_error = Some(OtelError::Shutdown(format!("Tracer flush failed: {:?}", e)));
            }
        }

        if let Err(e) = self.meter_provider.shutdown() {
            first_error.get_or_insert(OtelError::Shutdown(format!(
                "Meter shutdown failed: {:?}",
                e
            )));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for OtelProvider {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn otlp_tracer_provider(endpoint: &str, resource: &Resource) -> Result<TracerProvider, OtelError> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::runtime;
    use opentelemetry_sdk::trace::{Config, Sampler};

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| OtelError::TracerInit(e.to_string()))?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_config(
            Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_resource(resource.clone()),
        )
        .build())
}

fn otlp_meter_provider(endpoint: &str, resource: &Resource) -> Result<SdkMeterProvider, OtelError> {
    use opentelemetry_otlp::{MetricsExporterBuilder, WithExportConfig};
    use opentelemetry_sdk::metrics::reader::{
        DefaultAggregationSelector, DefaultTemporalitySelector,
    };
    use opentelemetry_sdk::{metrics::PeriodicReader, runtime};

    let exporter = MetricsExporterBuilder::from(
        opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint),
    )
    .build_metrics_exporter(
        Box::new(DefaultTemporalitySelector::new()),
        Box::new(DefaultAggregationSelector::new()),
    )
    .map_err(|e| OtelError::MeterInit(e.to_string()))?;

    Ok(SdkMeterProvider::builder()
        .with_resource(resource.clone())
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .build())
}

/// Outcome label recorded on `reconcile_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Handler returned success
    Success,
    /// Handler failed and the key was requeued with backoff
    Requeued,
    /// Handler failed and the key exhausted its retries
    Dropped,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Success => "success",
            ReconcileOutcome::Requeued => "requeued",
            ReconcileOutcome::Dropped => "dropped",
        }
    }
}

/// Controller metrics
pub struct Metrics {
    /// Change notifications delivered by the informer
    pub events_total: Counter<u64>,

    /// Handler invocations by outcome
    pub reconcile_total: Counter<u64>,

    /// Rate-limited requeues
    pub requeues_total: Counter<u64>,

    /// Keys dropped after exhausting retries
    pub dropped_total: Counter<u64>,

    /// Full relists of the remote collection
    pub relists_total: Counter<u64>,

    /// Handler duration in seconds
    pub reconcile_duration: Histogram<f64>,
}

impl Metrics {
    /// Create new metrics with the given meter
    pub fn new(meter: &Meter) -> Self {
        let events_total = meter
            .u64_counter("reconcile_controller_events_total")
            .with_description("Total number of change notifications")
            .init();

        let reconcile_total = meter
            .u64_counter("reconcile_controller_reconcile_total")
            .with_description("Total number of handler invocations")
            .init();

        let requeues_total = meter
            .u64_counter("reconcile_controller_requeues_total")
            .with_description("Total number of rate-limited requeues")
            .init();

        let dropped_total = meter
            .u64_counter("reconcile_controller_dropped_total")
            .with_description("Total number of keys dropped after max retries")
            .init();

        let relists_total = meter
            .u64_counter("reconcile_controller_relists_total")
            .with_description("Total number of full relists")
            .init();

        let reconcile_duration = meter
            .f64_histogram("reconcile_controller_reconcile_duration_seconds")
            .with_description("Handler duration in seconds")
            .init();

        Self {
            events_total,
            reconcile_total,
            requeues_total,
            dropped_total,
            relists_total,
            reconcile_duration,
        }
    }

    /// Record a change notification
    pub fn record_event(&self, kind: EventKind) {
        self.events_total
            .add(1, &[KeyValue::new("kind", kind.as_str())]);
    }

    /// Record one handler invocation
    pub fn record_reconcile(&self, outcome: ReconcileOutcome, duration_secs: f64) {
        let attributes = [KeyValue::new("outcome", outcome.as_str())];
        self.reconcile_total.add(1, &attributes);
        self.reconcile_duration.record(duration_secs, &attributes);

        match outcome {
            ReconcileOutcome::Requeued => self.requeues_total.add(1, &[]),
            ReconcileOutcome::Dropped => self.dropped_total.add(1, &[]),
            ReconcileOutcome::Success => {}
        }
    }

    /// Record a relist attempt
    pub fn record_relist(&self, success: bool) {
        let result = if success { "success" } else { "error" };
        self.relists_total
            .add(1, &[KeyValue::new("result", result)]);
    }
}

/// Initialize tracing subscriber with OpenTelemetry integration
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_tracing(otel: &OtelProvider, logging: &LoggingConfig) -> Result<(), OtelError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.to_lowercase()));

    let json = match logging.format.to_lowercase().as_str() {
        "json" => true,
        "pretty" => false,
        other => {
            return Err(OtelError::Config(format!("Unknown log format: {}", other)));
        }
    };
    if otel.is_enabled() {
        // With OpenTelemetry layer
        let json_layer = json.then(|| tracing_subscriber::fmt::layer().json());
        let pretty_layer = (!json).then(|| tracing_subscriber::fmt::layer().pretty());
        let tracer = otel.tracer("reconcile-controller");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(filter)
            .with(otel_layer)
            .with(json_layer)
            .with(pretty_layer)
            .try_init()
            .map_err(|e| OtelError::TracerInit(e.to_string()))?;
    } else {
        // Without OpenTelemetry layer
        let json_layer = json.then(|| tracing_subscriber::fmt::layer().json());
        let pretty_layer = (!json).then(|| tracing_subscriber::fmt::layer().pretty());
        tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(pretty_layer)
            .try_init()
            .map_err(|e| OtelError::TracerInit(e.to_string()))?;
    }

    Ok(())
}
