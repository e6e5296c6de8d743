use std::{error::Error as StdError, sync::Arc};

use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::{
    attributes::{self, AttributeSet, Correlation, SdkType},
    config::Config,
    context::CorrelationContext,
    exchange::HttpExchange,
    outgoing::OutgoingCorrelator,
    report::ATError,
    span::{GlobalTracer, HttpTracer, SpanKind, SPAN_NAME},
};

/// Entry point for framework adapters.
///
/// An adapter calls [`on_request_start`](Self::on_request_start) when a
/// request arrives, runs the handler inside the returned context's
/// [`scope`](CorrelationContext::scope), reports handler failures through
/// [`on_error`](Self::on_error), and finishes with
/// [`on_response_ready`](Self::on_response_ready).
#[derive(Clone)]
pub struct ApiToolkit {
    config: Arc<Config>,
    tracer: Arc<dyn HttpTracer>,
}

impl ApiToolkit {
    /// Uses the global OpenTelemetry tracer provider, with the configured
    /// service name as the tracer name.
    pub fn new(config: Config) -> Self {
        let tracer = GlobalTracer::new(config.service_name().to_owned());
        Self::with_tracer(config, tracer)
    }

    pub fn with_tracer(config: Config, tracer: impl HttpTracer) -> Self {
        Self {
            config: Arc::new(config),
            tracer: Arc::new(tracer),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts the server span and the correlation context of a new request.
    pub fn on_request_start(&self) -> CorrelationContext {
        let span = self.tracer.start_span(SPAN_NAME, SpanKind::Server, None);
        let context = CorrelationContext::create(span, self.config.debug());
        if self.config.debug() {
            tracing::debug!(msg_id = %context.msg_id(), "request started");
        }
        context
    }

    /// `tracing` span to run the handler of `context`'s request in.
    ///
    /// Its OpenTelemetry parent is the request's server span, so it and
    /// everything logged inside it land in the same trace.
    pub fn request_span(
        &self,
        context: &CorrelationContext,
        method: &str,
        target: &str,
    ) -> tracing::Span {
        let span = tracing::info_span!(
            "apitoolkit.request",
            msg_id = %context.msg_id(),
            method = %method,
            target = %target,
        );
        span.set_parent(context.otel_context());
        span
    }

    /// Records a failure raised by the handler of `context`'s request.
    pub fn on_error<E>(&self, context: &CorrelationContext, error: &E)
    where
        E: StdError + ?Sized,
    {
        context.report(ATError::from_error(error));
    }

    /// Writes the attributes of the finished request, ends its span, and
    /// closes `context`.
    pub fn on_response_ready(
        &self,
        context: &CorrelationContext,
        exchange: &HttpExchange,
        sdk_type: SdkType,
    ) -> AttributeSet {
        if self.config.debug() {
            tracing::debug!(
                msg_id = %context.msg_id(),
                status = exchange.status_code,
                "response ready"
            );
        }

        let errors = context.errors();
        let correlation = Correlation {
            msg_id: context.msg_id(),
            parent_id: None,
            errors: &errors,
            sdk_type,
        };

        let set = context.with_span(|span| {
            let set = attributes::build(span, exchange, &correlation, &self.config);
            span.end();
            set
        });
        context.destroy();
        set
    }

    /// Correlator for outgoing calls made by handlers of this service.
    pub fn outgoing(&self) -> OutgoingCorrelator {
        OutgoingCorrelator::new(self.tracer.clone(), self.config.clone())
    }
}
