use tracing::field::Empty;
use uuid::Uuid;

/// 32 hex characters, OpenTelemetry trace id width.
pub fn generate_trace_id() -> String {
    Uuid::new_v4().as_simple().to_string()
}

/// Span wrapping one routed request. `model`, `cached` and `outcome` start
/// empty and are recorded once known.
pub fn request_span(project_id: &str) -> (tracing::Span, String) {
    let trace_id = generate_trace_id();
    let span = tracing::info_span!(
        "request",
        trace_id = %trace_id,
        project_id = %project_id,
        model = Empty,
        cached = Empty,
        outcome = Empty,
    );
    (span, trace_id)
}
