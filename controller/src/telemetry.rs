//! Telemetry exposes the active span's W3C trace id, so reconcilers can stamp it onto log lines
//! and Kubernetes events for correlation with whatever distributed tracing backend a deployment
//! points the `telemetry` feature's OTLP exporter at.

use opentelemetry::trace::TraceId;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Get_trace_id returns the current span's trace id, or [`TraceId::INVALID`] if no OTLP layer
/// is installed (the default when the `telemetry` feature is off).
pub fn get_trace_id() -> TraceId {
    tracing::Span::current().context().span().span_context().trace_id()
}
