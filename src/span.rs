//! The tracer capability the core is written against.
//!
//! The core never talks to a tracer implementation directly. It starts spans
//! through an [`HttpTracer`] and writes to them through [`TelemetrySpan`].
//! [`GlobalTracer`] backs both with the globally installed OpenTelemetry
//! tracer provider.

use std::borrow::Cow;

use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span as _, SpanBuilder, TraceContextExt as _, Tracer as _},
    Context, KeyValue,
};
pub use opentelemetry::trace::SpanKind;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::report::ATError;

/// Name of every span started by this crate.
pub const SPAN_NAME: &str = "apitoolkit.http";

/// A started span that accepts attributes until it is ended.
pub trait TelemetrySpan: Send {
    fn set_attributes(&mut self, attributes: Vec<KeyValue>);

    fn set_attribute(&mut self, attribute: KeyValue);

    fn record_exception(&mut self, error: &ATError);

    fn end(&mut self);

    /// An OpenTelemetry context with this span as the active span, for
    /// parenting other spans on it.
    fn context(&self) -> Context;
}

/// Starts spans.
pub trait HttpTracer: Send + Sync + 'static {
    /// Starts a span under `parent`, or under the tracer's notion of the
    /// current span when `parent` is `None`.
    fn start_span(
        &self,
        name: &'static str,
        kind: SpanKind,
        parent: Option<Context>,
    ) -> Box<dyn TelemetrySpan>;
}

impl TelemetrySpan for BoxedSpan {
    fn set_attributes(&mut self, attributes: Vec<KeyValue>) {
        opentelemetry::trace::Span::set_attributes(self, attributes);
    }

    fn set_attribute(&mut self, attribute: KeyValue) {
        opentelemetry::trace::Span::set_attribute(self, attribute);
    }

    fn record_exception(&mut self, error: &ATError) {
        self.add_event(
            "exception",
            vec![
                KeyValue::new("exception.type", error.error_type.clone()),
                KeyValue::new("exception.message", error.message.clone()),
                KeyValue::new("exception.stacktrace", error.stack_trace.clone()),
            ],
        );
    }

    fn end(&mut self) {
        opentelemetry::trace::Span::end(self);
    }

    fn context(&self) -> Context {
        Context::new().with_remote_span_context(self.span_context().clone())
    }
}

/// Starts spans from [`opentelemetry::global`]. Without an explicit parent,
/// spans are parented on the OpenTelemetry context of the current `tracing`
/// span.
#[derive(Debug, Clone)]
pub struct GlobalTracer {
    name: Cow<'static, str>,
}

impl GlobalTracer {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self { name: name.into() }
    }
}

impl HttpTracer for GlobalTracer {
    fn start_span(
        &self,
        name: &'static str,
        kind: SpanKind,
        parent: Option<Context>,
    ) -> Box<dyn TelemetrySpan> {
        let tracer = global::tracer(self.name.clone());
        let parent = parent.unwrap_or_else(|| tracing::Span::current().context());
        let span = tracer.build_with_context(SpanBuilder::from_name(name).with_kind(kind), &parent);

        Box::new(span)
    }
}
