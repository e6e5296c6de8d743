#![allow(dead_code)]

use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

use apitoolkit_trace::{
    span::{HttpTracer, SpanKind, TelemetrySpan},
    ATError,
};
use bytes::Bytes;
use http_body::{Body, Frame};
use opentelemetry::{Context, KeyValue, Value};
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct Recorded {
    pub bulk: Vec<KeyValue>,
    pub headers: Vec<KeyValue>,
    pub exceptions: Vec<String>,
    pub ended: bool,
}

impl Recorded {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.bulk
            .iter()
            .chain(&self.headers)
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.clone())
    }

    pub fn string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(value) => Some(value.as_str().to_owned()),
            _ => None,
        }
    }
}

#[derive(Clone, Default)]
struct TestSpan(Arc<Mutex<Recorded>>);

impl TelemetrySpan for TestSpan {
    fn set_attributes(&mut self, attributes: Vec<KeyValue>) {
        self.0.lock().bulk.extend(attributes);
    }

    fn set_attribute(&mut self, attribute: KeyValue) {
        self.0.lock().headers.push(attribute);
    }

    fn record_exception(&mut self, error: &ATError) {
        self.0.lock().exceptions.push(error.message.clone());
    }

    fn end(&mut self) {
        self.0.lock().ended = true;
    }

    fn context(&self) -> Context {
        Context::new()
    }
}

/// Tracer that keeps every span it started, in start order.
#[derive(Clone, Default)]
pub struct TestTracer {
    spans: Arc<Mutex<Vec<(SpanKind, TestSpan)>>>,
}

impl TestTracer {
    pub fn spans_of(&self, kind: SpanKind) -> Vec<Arc<Mutex<Recorded>>> {
        self.spans
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, span)| span.0.clone())
            .collect()
    }

    /// The only server span; panics when there is not exactly one.
    pub fn server(&self) -> Arc<Mutex<Recorded>> {
        let mut spans = self.spans_of(SpanKind::Server);
        assert_eq!(spans.len(), 1, "expected a single server span");
        spans.remove(0)
    }
}

impl HttpTracer for TestTracer {
    fn start_span(
        &self,
        _name: &'static str,
        kind: SpanKind,
        _parent: Option<Context>,
    ) -> Box<dyn TelemetrySpan> {
        let span = TestSpan::default();
        self.spans.lock().push((kind, span.clone()));
        Box::new(span)
    }
}

#[derive(Debug)]
pub struct BrokenPipe;

impl fmt::Display for BrokenPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection reset while streaming body")
    }
}

impl std::error::Error for BrokenPipe {}

/// A body delivered frame by frame, the way a socket hands it over. It does
/// not report its size, and it can be made to fail after some chunks.
#[derive(Debug, Default)]
pub struct Chunked {
    chunks: VecDeque<Result<Bytes, BrokenPipe>>,
}

impl Chunked {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(|chunk| Ok(chunk.into())).collect(),
        }
    }

    pub fn failing_after<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        let mut body = Self::new(chunks);
        body.chunks.push_back(Err(BrokenPipe));
        body
    }

    /// Drains the body into a string, as a handler would.
    pub async fn text(self) -> Result<String, BrokenPipe> {
        use http_body_util::BodyExt;

        let bytes = self.collect().await?.to_bytes();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl From<Bytes> for Chunked {
    fn from(bytes: Bytes) -> Self {
        Self::new([bytes])
    }
}

impl Body for Chunked {
    type Data = Bytes;
    type Error = BrokenPipe;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Poll::Ready(self.chunks.pop_front().map(|chunk| chunk.map(Frame::data)))
    }
}
