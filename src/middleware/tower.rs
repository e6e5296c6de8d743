use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{Request, Response};
use http_body::Body;
use http_body_util::BodyExt;
use tower::Service;
use tower_layer::Layer;
use tracing::Instrument;

use crate::{
    attributes::SdkType,
    exchange::{self, HttpExchange, PathParams, RouteTemplate},
    outgoing::{OutgoingCorrelator, OutgoingRequest, OutgoingResponse},
    report::ATError,
    toolkit::ApiToolkit,
};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Instruments inbound requests.
///
/// Every request gets a server span and a correlation context that stays
/// ambient while the inner service handles it. The span's attributes are
/// written once the inner service has produced a response or failed.
///
/// Any body that can be rebuilt from [`Bytes`] works, such as axum's `Body`
/// or `http_body_util::Full<Bytes>`. With body capture enabled the body is
/// buffered, recorded, and handed on as an equivalent body. When a router
/// places [`RouteTemplate`] and [`PathParams`] in the request extensions they
/// are used; otherwise the route is the concrete path.
///
/// ```ignore
/// let app = Router::new()
///     .route("/foo", get(|| async {}))
///     .layer(ApiToolkitLayer::new(toolkit));
/// ```
#[derive(Clone)]
pub struct ApiToolkitLayer {
    toolkit: ApiToolkit,
}

impl ApiToolkitLayer {
    pub fn new(toolkit: ApiToolkit) -> Self {
        Self { toolkit }
    }
}

impl<S> Layer<S> for ApiToolkitLayer {
    type Service = ApiToolkitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ApiToolkitService {
            service,
            toolkit: self.toolkit.clone(),
        }
    }
}

/// This service implements the inbound instrumentation
#[derive(Clone)]
pub struct ApiToolkitService<S> {
    service: S,
    toolkit: ApiToolkit,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ApiToolkitService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Display + Send + 'static,
    ReqBody: Body + From<Bytes> + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Display,
    ResBody: Body + From<Bytes> + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Display,
{
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let context = self.toolkit.on_request_start();
        let config = self.toolkit.config();
        let capture_request_body = config.capture_request_body();
        let capture_response_body = config.capture_response_body();
        let debug = config.debug();

        let path = request.uri().path().to_owned();
        let mut exchange = HttpExchange {
            host: exchange::request_host(request.uri(), request.headers()),
            method: request.method().as_str().to_owned(),
            raw_target: exchange::raw_target(request.uri()),
            query_params: exchange::query_params(request.uri().query().unwrap_or_default()),
            route: request
                .extensions()
                .get::<RouteTemplate>()
                .map(|route| route.0.clone())
                .unwrap_or_else(|| path.clone()),
            path_params: request
                .extensions()
                .get::<PathParams>()
                .map(|params| params.0.clone())
                .unwrap_or_default(),
            request_headers: exchange::headers_from_map(request.headers()),
            ..Default::default()
        };

        let span = self
            .toolkit
            .request_span(&context, &exchange.method, &exchange.raw_target);

        // the service that was polled ready is the one to call
        let clone = self.service.clone();
        let mut service = std::mem::replace(&mut self.service, clone);
        let toolkit = self.toolkit.clone();

        Box::pin(
            async move {
                let request = if capture_request_body {
                    let (parts, body) = request.into_parts();
                    let (body, captured) = buffer(body, debug).await;
                    exchange.request_body = captured;
                    Request::from_parts(parts, body)
                } else {
                    request
                };

                let future = context.sync_scope(|| service.call(request));
                let result = match context.clone().scope(future).await {
                    Ok(response) => {
                        exchange.status_code = response.status().as_u16();
                        exchange.response_headers = exchange::headers_from_map(response.headers());
                        if capture_response_body {
                            let (parts, body) = response.into_parts();
                            let (body, captured) = buffer(body, debug).await;
                            exchange.response_body = captured;
                            Ok(Response::from_parts(parts, body))
                        } else {
                            Ok(response)
                        }
                    }
                    Err(error) => {
                        context.report(ATError::from_display(&error));
                        exchange.status_code = 500;
                        Err(error)
                    }
                };

                toolkit.on_response_ready(&context, &exchange, SdkType::Tower);
                result
            }
            .instrument(span),
        )
    }
}

/// Instruments calls made through an HTTP client service.
///
/// Each call gets a client span linked, through `apitoolkit.parent_id`, to
/// the inbound request it was made from. The inner service's response or
/// error is returned unchanged.
#[derive(Clone)]
pub struct OutgoingLayer {
    correlator: OutgoingCorrelator,
}

impl OutgoingLayer {
    pub fn new(correlator: OutgoingCorrelator) -> Self {
        Self { correlator }
    }
}

impl<S> Layer<S> for OutgoingLayer {
    type Service = OutgoingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        OutgoingService {
            service,
            correlator: self.correlator.clone(),
        }
    }
}

#[derive(Clone)]
pub struct OutgoingService<S> {
    service: S,
    correlator: OutgoingCorrelator,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for OutgoingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Body + From<Bytes> + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Display,
    ResBody: Body + From<Bytes> + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Display,
{
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;
    type Response = S::Response;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let config = self.correlator.config();
        let capture_request_body = config.capture_request_body();
        let capture_response_body = config.capture_response_body();
        let debug = config.debug();

        let clone = self.service.clone();
        let mut service = std::mem::replace(&mut self.service, clone);
        let correlator = self.correlator.clone();

        // The inbound request is resolved when the call is made, not when the
        // returned future is first polled.
        Box::pin(crate::context::inherit(async move {
            let (request, body) = if capture_request_body {
                let (parts, body) = request.into_parts();
                let (body, captured) = buffer(body, debug).await;
                (Request::from_parts(parts, body), captured)
            } else {
                (request, None)
            };

            let pending = correlator.start(OutgoingRequest {
                method: request.method().as_str().to_owned(),
                url: request.uri().to_string(),
                headers: exchange::headers_from_map(request.headers()),
                body,
            });

            match service.call(request).await {
                Ok(response) => {
                    let status_code = response.status().as_u16();
                    let headers = exchange::headers_from_map(response.headers());
                    let (response, body) = if capture_response_body {
                        let (parts, body) = response.into_parts();
                        let (body, captured) = buffer(body, debug).await;
                        (Response::from_parts(parts, body), captured)
                    } else {
                        (response, None)
                    };
                    pending.complete(Some(OutgoingResponse {
                        status_code,
                        headers,
                        body,
                    }));
                    Ok(response)
                }
                Err(error) => {
                    pending.complete(None);
                    Err(error)
                }
            }
        }))
    }
}

/// Reads `body` to the end and returns an equivalent body along with its
/// bytes. A body that fails mid-read cannot be replayed: it is replaced by an
/// empty one and nothing is captured.
async fn buffer<B>(body: B, debug: bool) -> (B, Option<Vec<u8>>)
where
    B: Body + From<Bytes>,
    B::Error: Display,
{
    match body.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            let captured = bytes.to_vec();
            (B::from(bytes), Some(captured))
        }
        Err(error) => {
            if debug {
                tracing::warn!(%error, "failed to read body for capture");
            } else {
                tracing::debug!(%error, "failed to read body for capture");
            }
            (B::from(Bytes::new()), None)
        }
    }
}
