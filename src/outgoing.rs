//! Correlation of outgoing HTTP calls with the inbound request that made them.
//!
//! Every outgoing call gets its own span and causal identifier. When the call
//! is made from inside an instrumented request, that request's identifier is
//! recorded as `apitoolkit.parent_id`.

use std::{future::Future, sync::Arc};

use url::Url;
use uuid::Uuid;

use crate::{
    attributes::{self, AttributeSet, Correlation, SdkType},
    config::Config,
    context::CorrelationContext,
    exchange::{self, Headers, HttpExchange, Params},
    span::{HttpTracer, SpanKind, TelemetrySpan, SPAN_NAME},
};

/// The request side of an outgoing call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingRequest {
    pub method: String,
    /// Absolute URL, or a path when the client resolves it against a base.
    pub url: String,
    pub headers: Headers,
    /// `None` when the body was not read.
    pub body: Option<Vec<u8>>,
}

/// The response side of an outgoing call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

/// Starts a span for each outgoing call and links it to the ambient request.
#[derive(Clone)]
pub struct OutgoingCorrelator {
    tracer: Arc<dyn HttpTracer>,
    config: Arc<Config>,
    route_template: Option<String>,
}

impl OutgoingCorrelator {
    pub fn new(tracer: Arc<dyn HttpTracer>, config: Arc<Config>) -> Self {
        Self {
            tracer,
            config,
            route_template: None,
        }
    }

    /// Reports `template` (e.g. `/users/{id}`) as the route instead of the
    /// concrete path.
    pub fn with_route_template(mut self, template: impl Into<String>) -> Self {
        self.route_template = Some(template.into());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens the span for `request`, as a child of the ambient request's span.
    /// The parent is resolved here, so this must be called from the task that
    /// makes the call.
    pub fn start(&self, request: OutgoingRequest) -> PendingCall {
        let inbound = CorrelationContext::current();
        let parent_id = inbound.as_ref().map(|ctx| ctx.msg_id().to_owned());
        if parent_id.is_none() && self.config.debug() {
            tracing::debug!(url = %request.url, "outgoing call outside an instrumented request");
        }

        PendingCall {
            span: Some(self.tracer.start_span(
                SPAN_NAME,
                SpanKind::Client,
                inbound.as_ref().map(CorrelationContext::otel_context),
            )),
            msg_id: Uuid::new_v4().to_string(),
            parent_id,
            request,
            config: self.config.clone(),
            route_template: self.route_template.clone(),
        }
    }

    /// Instruments `call` and hands its result back untouched.
    ///
    /// `describe` extracts the response facts from a successful result; a
    /// failed call is recorded with status `0`.
    pub async fn observe<Fut, T, E, D>(
        &self,
        request: OutgoingRequest,
        call: Fut,
        describe: D,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        D: FnOnce(&T) -> OutgoingResponse,
    {
        let pending = self.start(request);
        let result = call.await;
        let response = result.as_ref().ok().map(describe);
        pending.complete(response);
        result
    }
}

/// An outgoing call whose span is open.
///
/// Dropping it without calling [`PendingCall::complete`] ends the span with
/// no HTTP attributes.
pub struct PendingCall {
    span: Option<Box<dyn TelemetrySpan>>,
    msg_id: String,
    parent_id: Option<String>,
    request: OutgoingRequest,
    config: Arc<Config>,
    route_template: Option<String>,
}

impl PendingCall {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Writes the call's attributes and ends its span. `None` means no
    /// response was received.
    pub fn complete(mut self, response: Option<OutgoingResponse>) -> AttributeSet {
        let Some(mut span) = self.span.take() else {
            return AttributeSet::default();
        };

        let request = std::mem::take(&mut self.request);
        let response = response.unwrap_or_default();
        let target = UrlParts::parse(&request.url);

        let exchange = HttpExchange {
            host: target.host,
            status_code: response.status_code,
            query_params: target.query_params,
            path_params: Params::new(),
            request_headers: request.headers,
            response_headers: response.headers,
            method: request.method.to_ascii_uppercase(),
            route: self.route_template.take().unwrap_or_else(|| target.path.clone()),
            raw_target: target.raw_target,
            request_body: request.body,
            response_body: response.body,
        };
        let correlation = Correlation {
            msg_id: &self.msg_id,
            parent_id: self.parent_id.as_deref(),
            errors: &[],
            sdk_type: SdkType::Outgoing,
        };

        let set = attributes::build(&mut *span, &exchange, &correlation, &self.config);
        span.end();
        set
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(mut span) = self.span.take() {
            span.end();
        }
    }
}

struct UrlParts {
    host: String,
    path: String,
    raw_target: String,
    query_params: Params,
}

impl UrlParts {
    /// Splits `url` into host, path, and query. Relative URLs are resolved
    /// against a placeholder base and report an empty host.
    fn parse(url: &str) -> Self {
        let (parsed, absolute) = match Url::parse(url) {
            Ok(parsed) => (Some(parsed), true),
            Err(url::ParseError::RelativeUrlWithoutBase) => (
                Url::parse("http://relative.invalid")
                    .and_then(|base| base.join(url))
                    .ok(),
                false,
            ),
            Err(_) => (None, false),
        };

        let Some(parsed) = parsed else {
            return Self {
                host: String::new(),
                path: String::new(),
                raw_target: String::new(),
                query_params: Params::new(),
            };
        };

        let host = match (absolute, parsed.host_str(), parsed.port()) {
            (true, Some(host), Some(port)) => format!("{host}:{port}"),
            (true, Some(host), None) => host.to_owned(),
            _ => String::new(),
        };
        let path = parsed.path().to_owned();
        let raw_target = match parsed.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.clone(),
        };
        let query_params = exchange::query_params(parsed.query().unwrap_or_default());

        Self {
            host,
            path,
            raw_target,
            query_params,
        }
    }
}
