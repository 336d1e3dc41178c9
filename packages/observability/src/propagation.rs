//! W3C trace-context propagation through string-keyed maps.

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::HashMap;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Carrier key written by the W3C propagator.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Propagation keys mapped to values. Empty means "no propagation".
pub type TraceContext = HashMap<String, String>;

/// Injects and extracts span contexts using the W3C `traceparent` format.
///
/// Stateless and cheap to clone; each component that crosses a process
/// boundary gets its own copy.
#[derive(Debug, Clone, Default)]
pub struct TracePropagator;

impl TracePropagator {
    pub fn new() -> Self {
        Self
    }

    /// Serialize `cx` into a carrier map.
    pub fn inject(&self, cx: &Context) -> TraceContext {
        let mut carrier = TraceContext::new();
        TraceContextPropagator::new().inject_context(cx, &mut carrier);
        carrier
    }

    /// Serialize the context of the current `tracing` span.
    ///
    /// Returns an empty map when no OpenTelemetry layer is installed or the
    /// current span is not sampled into a valid trace.
    pub fn inject_current(&self) -> TraceContext {
        let cx = tracing::Span::current().context();
        self.inject(&cx)
    }

    /// Rebuild a remote parent context from a carrier map.
    pub fn extract(&self, carrier: &TraceContext) -> Context {
        TraceContextPropagator::new().extract(carrier)
    }

    /// Attach the context carried in `carrier` as the parent of `span`.
    pub fn link_span(&self, span: &tracing::Span, carrier: &TraceContext) {
        if carrier.is_empty() {
            return;
        }
        span.set_parent(self.extract(carrier));
    }

    /// Hex trace id carried in `carrier`, if it holds a valid span context.
    pub fn trace_id(&self, carrier: &TraceContext) -> Option<String> {
        let cx = self.extract(carrier);
        let span_context = cx.span().span_context().clone();
        span_context
            .is_valid()
            .then(|| span_context.trace_id().to_string())
    }
}
