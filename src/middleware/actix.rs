use std::{
    error::Error as StdError,
    future::{self, Future, Ready},
    pin::Pin,
    rc::Rc,
};

use actix_web::{
    body::{self, EitherBody, MessageBody},
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tracing::Instrument;

use crate::{
    attributes::SdkType,
    exchange::{self, HttpExchange},
    report::ATError,
    toolkit::ApiToolkit,
};

/// Instruments inbound requests of an actix-web app.
///
/// Register it with `App::wrap`. Route template and path parameters are read
/// after routing. With body capture enabled, the request payload is buffered
/// and handed to the app unchanged, and the response body is buffered before
/// it is sent.
///
/// ```ignore
/// let toolkit = ApiToolkit::new(config);
/// App::new()
///     .wrap(ApiToolkitMiddleware::new(toolkit.clone()))
///     .route("/users/{id}", web::get().to(get_user));
/// ```
#[derive(Clone)]
pub struct ApiToolkitMiddleware {
    toolkit: ApiToolkit,
}

impl ApiToolkitMiddleware {
    pub fn new(toolkit: ApiToolkit) -> Self {
        Self { toolkit }
    }
}

impl<S, B> Transform<S, ServiceRequest> for ApiToolkitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Error = Error;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;
    type InitError = ();
    type Response = ServiceResponse<EitherBody<B, Bytes>>;
    type Transform = ApiToolkitService<S>;

    fn new_transform(&self, service: S) -> Self::Future {
        future::ready(Ok(ApiToolkitService {
            service: Rc::new(service),
            toolkit: self.toolkit.clone(),
        }))
    }
}

/// This service implements the inbound instrumentation
pub struct ApiToolkitService<S> {
    service: Rc<S>,
    toolkit: ApiToolkit,
}

impl<S, B> Service<ServiceRequest> for ApiToolkitService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;
    type Response = ServiceResponse<EitherBody<B, Bytes>>;

    // This service is ready when its next service is ready
    forward_ready!(service);

    fn call(&self, mut request: ServiceRequest) -> Self::Future {
        let context = self.toolkit.on_request_start();
        let config = self.toolkit.config();
        let capture_request_body = config.capture_request_body();
        let capture_response_body = config.capture_response_body();
        let debug = config.debug();

        let path = request.path().to_owned();
        let mut exchange = HttpExchange {
            host: exchange::host_without_port(request.connection_info().host()),
            method: request.method().as_str().to_owned(),
            raw_target: request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_owned())
                .unwrap_or_else(|| path.clone()),
            query_params: exchange::query_params(request.query_string()),
            route: path,
            request_headers: exchange::headers_from_pairs(
                request
                    .headers()
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_bytes())),
            ),
            ..Default::default()
        };

        let span = self
            .toolkit
            .request_span(&context, &exchange.method, &exchange.raw_target);
        let service = Rc::clone(&self.service);
        let toolkit = self.toolkit.clone();

        Box::pin(
            async move {
                if capture_request_body {
                    let (bytes, captured) = buffer_payload(request.take_payload(), debug).await;
                    exchange.request_body = captured;
                    request.set_payload(Payload::from(bytes));
                }

                let future = context.sync_scope(|| service.call(request));
                let result = match context.clone().scope(future).await {
                    Ok(response) => {
                        let routed = response.request();
                        if let Some(pattern) = routed.match_pattern() {
                            exchange.route = pattern;
                        }
                        exchange.path_params = exchange::path_params(routed.match_info().iter());
                        exchange.status_code = response.status().as_u16();
                        exchange.response_headers = exchange::headers_from_pairs(
                            response
                                .headers()
                                .iter()
                                .map(|(name, value)| (name.as_str(), value.as_bytes())),
                        );
                        if let Some(error) = response.response().error() {
                            context.report(ATError::from_display(error));
                        }

                        if capture_response_body {
                            let (routed, response) = response.into_parts();
                            let (head, body) = response.into_parts();
                            let (bytes, captured) = buffer_body(body, debug).await;
                            exchange.response_body = captured;
                            Ok(ServiceResponse::new(routed, head.set_body(bytes))
                                .map_into_right_body())
                        } else {
                            Ok(response.map_into_left_body())
                        }
                    }
                    Err(error) => {
                        context.report(ATError::from_display(&error));
                        exchange.status_code = error.as_response_error().status_code().as_u16();
                        Err(error)
                    }
                };

                toolkit.on_response_ready(&context, &exchange, SdkType::Actix);
                result
            }
            .instrument(span),
        )
    }
}

/// Drains `payload`. The bytes read so far are always returned so they can
/// be replayed to the app; they are only captured when the read completed.
async fn buffer_payload(mut payload: Payload, debug: bool) -> (Bytes, Option<Vec<u8>>) {
    let mut buffered = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        match chunk {
            Ok(chunk) => buffered.extend_from_slice(&chunk),
            Err(error) => {
                capture_failed(&error, debug);
                return (buffered.freeze(), None);
            }
        }
    }

    let bytes = buffered.freeze();
    let captured = bytes.to_vec();
    (bytes, Some(captured))
}

async fn buffer_body<B: MessageBody>(body: B, debug: bool) -> (Bytes, Option<Vec<u8>>) {
    match body::to_bytes(body).await {
        Ok(bytes) => {
            let captured = bytes.to_vec();
            (bytes, Some(captured))
        }
        Err(error) => {
            let error: Box<dyn StdError> = error.into();
            capture_failed(&*error, debug);
            (Bytes::new(), None)
        }
    }
}

fn capture_failed(error: &dyn StdError, debug: bool) {
    if debug {
        tracing::warn!(%error, "failed to read body for capture");
    } else {
        tracing::debug!(%error, "failed to read body for capture");
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test, web, App, HttpResponse};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use opentelemetry::Value;
    use serde_json::json;

    use super::*;
    use crate::{
        attributes::{
            ERRORS, HTTP_REQUEST_BODY, HTTP_REQUEST_PATH_PARAMS, HTTP_RESPONSE_BODY,
            HTTP_RESPONSE_STATUS_CODE, HTTP_ROUTE, HTTP_TARGET, SDK_TYPE,
        },
        report::report_message,
        span::recording::{Call, RecordingTracer},
        Config,
    };

    fn bulk(tracer: &RecordingTracer) -> Vec<opentelemetry::KeyValue> {
        let spans = tracer.spans();
        match spans[0].1.calls().into_iter().next() {
            Some(Call::SetAttributes(bulk)) => bulk,
            other => panic!("bulk attributes not written first: {other:?}"),
        }
    }

    fn find(bulk: &[opentelemetry::KeyValue], key: &str) -> Option<Value> {
        bulk.iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.clone())
    }

    fn decode(value: Option<Value>) -> serde_json::Value {
        let Some(Value::String(encoded)) = value else {
            panic!("body attribute missing");
        };
        serde_json::from_slice(&STANDARD.decode(encoded.as_str()).unwrap()).unwrap()
    }

    #[actix_web::test]
    async fn records_route_template_and_path_params() {
        let tracer = RecordingTracer::default();
        let toolkit = ApiToolkit::with_tracer(Config::default(), tracer.clone());
        let app = test::init_service(
            App::new()
                .wrap(ApiToolkitMiddleware::new(toolkit))
                .route(
                    "/users/{id}",
                    web::get().to(|| async { HttpResponse::Ok().body("ok") }),
                ),
        )
        .await;

        let response =
            test::call_service(&app, test::TestRequest::get().uri("/users/123").to_request())
                .await;
        assert_eq!(response.status(), StatusCode::OK);

        let bulk = bulk(&tracer);
        assert_eq!(find(&bulk, HTTP_ROUTE), Some(Value::from("/users/{id}")));
        assert_eq!(find(&bulk, HTTP_TARGET), Some(Value::from("/users/123")));
        assert_eq!(
            find(&bulk, HTTP_REQUEST_PATH_PARAMS),
            Some(Value::from(r#"{"id":"123"}"#))
        );
        assert_eq!(find(&bulk, SDK_TYPE), Some(Value::from("RustActix")));
        assert_eq!(find(&bulk, HTTP_REQUEST_BODY), None);
    }

    #[actix_web::test]
    async fn handler_reports_are_attached() {
        let tracer = RecordingTracer::default();
        let toolkit = ApiToolkit::with_tracer(Config::default(), tracer.clone());
        let app = test::init_service(App::new().wrap(ApiToolkitMiddleware::new(toolkit)).route(
            "/fail",
            web::get().to(|| async {
                report_message("lookup failed");
                HttpResponse::InternalServerError().finish()
            }),
        ))
        .await;

        test::call_service(&app, test::TestRequest::get().uri("/fail").to_request()).await;

        let bulk = bulk(&tracer);
        assert_eq!(find(&bulk, HTTP_RESPONSE_STATUS_CODE), Some(Value::I64(500)));
        let Some(Value::String(errors)) = find(&bulk, ERRORS) else {
            panic!("errors missing");
        };
        assert!(errors.as_str().contains("lookup failed"));
    }

    #[actix_web::test]
    async fn captured_bodies_reach_the_span_and_the_app() {
        let tracer = RecordingTracer::default();
        let config = Config::builder()
            .capture_request_body(true)
            .capture_response_body(true)
            .redact_request_body(["$.password"])
            .redact_response_body(["$.token"])
            .build()
            .unwrap();
        let toolkit = ApiToolkit::with_tracer(config, tracer.clone());
        let app = test::init_service(App::new().wrap(ApiToolkitMiddleware::new(toolkit)).route(
            "/login",
            web::post().to(|body: web::Bytes| async move {
                let login: serde_json::Value = serde_json::from_slice(&body).unwrap();
                HttpResponse::Ok().json(json!({"user": login["username"], "token": "jwt"}))
            }),
        ))
        .await;

        let request = test::TestRequest::post()
            .uri("/login")
            .insert_header(("content-type", "application/json"))
            .set_payload(r#"{"username":"u","password":"p"}"#)
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let sent: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(sent, json!({"user": "u", "token": "jwt"}));

        let bulk = bulk(&tracer);
        assert_eq!(
            decode(find(&bulk, HTTP_REQUEST_BODY)),
            json!({"username": "u", "password": "[CLIENT_REDACTED]"})
        );
        assert_eq!(
            decode(find(&bulk, HTTP_RESPONSE_BODY)),
            json!({"user": "u", "token": "[CLIENT_REDACTED]"})
        );
    }
}
