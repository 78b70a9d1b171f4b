//! Structured logging and OpenTelemetry spans for the conversion pipeline.

use std::time::Duration;

use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::job::{ConversionJob, JobOutcome};

const TRACER_NAME: &str = "pdf-printer";

/// Conversions slower than this are logged as a warning.
const SLOW_JOB_THRESHOLD: Duration = Duration::from_secs(30);

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` overrides the default filter. Panics if a global subscriber
/// is already installed, so call it once at startup.
///
/// # Arguments
///
/// * `json` - Emit JSON lines instead of the human-readable format
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pdf_printer=debug,tower_http=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Records the settlement of one queue message.
///
/// Emits a structured log event and an OpenTelemetry span carrying:
/// - job id and filename
/// - attempt number
/// - outcome (completed, already_done, requeued, discarded)
/// - processing duration
///
/// # Arguments
///
/// * `job` - The job as received, with the attempt it was processed under
/// * `outcome` - How the message was settled
/// * `duration` - Wall-clock time from receipt to settlement
pub fn record_job_telemetry(job: &ConversionJob, outcome: JobOutcome, duration: Duration) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("pdf_conversion_job");

    let duration_ms = duration.as_millis() as i64;
    span.set_attribute(KeyValue::new("job_id", job.job_id.clone()));
    span.set_attribute(KeyValue::new("filename", job.filename.clone()));
    span.set_attribute(KeyValue::new("attempt", job.attempt as i64));
    span.set_attribute(KeyValue::new("outcome", outcome.to_string()));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms));

    info!(
        job_id = %job.job_id,
        filename = %job.filename,
        attempt = job.attempt,
        outcome = %outcome,
        duration_ms = duration_ms,
        "Conversion job settled"
    );

    if duration > SLOW_JOB_THRESHOLD {
        warn!(
            job_id = %job.job_id,
            duration_ms = duration_ms,
            "Conversion exceeded performance threshold (30s)"
        );
    }

    span.end();
}

/// Records a worker heartbeat with the current queue depth.
///
/// # Arguments
///
/// * `worker_id` - Index of the worker within its pool
/// * `queue_length` - Messages waiting in the pending list
pub fn record_worker_heartbeat(worker_id: usize, queue_length: usize) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("worker_heartbeat");

    span.set_attribute(KeyValue::new("worker_id", worker_id as i64));
    span.set_attribute(KeyValue::new("queue_length", queue_length as i64));
    span.end();

    info!(worker_id = worker_id, queue_length = queue_length, "Worker heartbeat");
}

/// Initializes the OTLP trace exporter towards `endpoint`.
///
/// Must run inside a Tokio runtime. `OTEL_SERVICE_NAME` overrides the
/// reported service name.
///
/// # Arguments
///
/// * `endpoint` - OTLP gRPC collector address, e.g. `http://localhost:4317`
///
/// # Returns
///
/// Returns `Ok(())` once the batch exporter is installed as the global
/// tracer provider, or an error if the pipeline cannot be built.
pub fn init_telemetry(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| TRACER_NAME.to_string());

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!(endpoint = %endpoint, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::ConversionOptions;
    use crate::storage::SafeName;

    fn job() -> ConversionJob {
        ConversionJob::new(
            &SafeName::parse("report.xlsx").unwrap(),
            ConversionOptions::none(),
            false,
        )
    }

    #[test]
    fn test_record_job_telemetry_without_exporter() {
        // With no provider installed the global tracer is a no-op.
        record_job_telemetry(&job(), JobOutcome::Completed, Duration::from_millis(850));
        record_job_telemetry(&job(), JobOutcome::Discarded, Duration::from_secs(45));
    }

    #[test]
    fn test_record_worker_heartbeat() {
        record_worker_heartbeat(0, 12);
    }
}
