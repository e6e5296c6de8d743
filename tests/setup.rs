#![cfg(feature = "tower")]

use std::convert::Infallible;

use apitoolkit_trace::{
    middleware::tower::{ApiToolkitLayer, OutgoingLayer},
    setup::setup,
    span::SpanKind,
    ApiToolkit, Config, Error,
};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use opentelemetry_sdk::{
    export::trace::SpanData, testing::trace::InMemorySpanExporter, trace::TracerProvider,
};
use tower::{service_fn, ServiceBuilder, ServiceExt};

async fn serve_one(toolkit: &ApiToolkit) {
    let client = ServiceBuilder::new()
        .layer(OutgoingLayer::new(toolkit.outgoing()))
        .service(service_fn(|_: Request<Full<Bytes>>| async {
            Ok::<_, Infallible>(Response::new(Full::<Bytes>::from("{}")))
        }));

    let service = ServiceBuilder::new()
        .layer(ApiToolkitLayer::new(toolkit.clone()))
        .service(service_fn(move |_: Request<Full<Bytes>>| {
            let client = client.clone();
            async move {
                let downstream = Request::get("http://inventory.local/items")
                    .body(Full::default())
                    .unwrap();
                client.oneshot(downstream).await
            }
        }));

    service
        .oneshot(Request::get("/orders").body(Full::default()).unwrap())
        .await
        .unwrap();
}

fn flushed(provider: &TracerProvider, exporter: &InMemorySpanExporter) -> Vec<SpanData> {
    for result in provider.force_flush() {
        result.unwrap();
    }
    exporter.get_finished_spans().unwrap()
}

fn only<'a>(spans: &'a [SpanData], name: &str, kind: SpanKind) -> &'a SpanData {
    let mut matching = spans
        .iter()
        .filter(|span| span.name == name && span.span_kind == kind);
    let span = matching.next().unwrap_or_else(|| panic!("no {name} span"));
    assert!(matching.next().is_none(), "more than one {name} span");
    span
}

// One test per binary: it installs the global subscriber.
#[tokio::test(flavor = "multi_thread")]
async fn exported_spans_form_one_trace() {
    let config = Config::builder().service_name("orders").build().unwrap();
    let exporter = InMemorySpanExporter::default();
    let provider = setup(&config, exporter.clone()).unwrap();
    let toolkit = ApiToolkit::new(config.clone());

    serve_one(&toolkit).await;

    let spans = flushed(&provider, &exporter);
    assert_eq!(spans.len(), 3, "{spans:#?}");
    let server = only(&spans, "apitoolkit.http", SpanKind::Server);
    let client = only(&spans, "apitoolkit.http", SpanKind::Client);
    let request = only(&spans, "apitoolkit.request", SpanKind::Internal);

    let trace_id = server.span_context.trace_id();
    let server_id = server.span_context.span_id();
    for span in [client, request] {
        assert_eq!(span.span_context.trace_id(), trace_id);
        assert_eq!(span.parent_span_id, server_id);
    }

    // A second setup fails and keeps the installed provider global.
    let second = InMemorySpanExporter::default();
    assert!(matches!(setup(&config, second), Err(Error::Subscriber(_))));

    serve_one(&toolkit).await;
    let spans = flushed(&provider, &exporter);
    let servers = spans
        .iter()
        .filter(|span| span.span_kind == SpanKind::Server)
        .count();
    assert_eq!(servers, 2);
}
