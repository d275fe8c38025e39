//! Structured observability hooks for transforms and live queries.
//!
//! This module provides:
//! - A live-query span for instrumenting feed tasks
//! - Emission functions for key lifecycle events: transform applied, live
//!   query ready, operation emitted, live query closed
//!
//! Events are emitted at `info!` level, except per-operation events which
//! are `debug!`.

use tracing::{debug, info};

/// Span for a live query's feed task.
pub fn live_query_span(model: &str) -> tracing::Span {
    tracing::info_span!("graphfeed.live_query", model = %model)
}

/// Emit event: a transform finished applying.
pub fn emit_transform_applied(transform_id: &str, operations: usize, duration_ms: u64) {
    info!(
        event = "transform.applied",
        transform_id = %transform_id,
        operations = operations,
        duration_ms = duration_ms,
    );
}

/// Emit event: a live query received its ready marker.
pub fn emit_live_query_ready(model: &str, initial_operations: u64) {
    info!(
        event = "live_query.ready",
        model = %model,
        initial_operations = initial_operations,
    );
}

/// Emit event: one operation published on a live query.
pub fn emit_operation_emitted(model: &str, kind: &str, record_id: &str) {
    debug!(event = "live_query.operation", model = %model, kind = %kind, record_id = %record_id);
}

/// Emit event: a live query stopped, with the reason.
pub fn emit_live_query_closed(model: &str, reason: &str) {
    info!(event = "live_query.closed", model = %model, reason = %reason);
}

/// Emit event: a live query failed (warning level).
pub fn emit_live_query_error(model: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "live_query.error", model = %model, error = %error);
}
