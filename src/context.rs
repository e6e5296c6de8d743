//! Request-scoped correlation context.
//!
//! A [`CorrelationContext`] lives for exactly one inbound request. It is made
//! ambient with [`CorrelationContext::scope`], which stores it in a tokio
//! task-local: every `.await` inside the scoped future sees the same context,
//! and two requests interleaved on the same thread never see each other's.
//!
//! Task-locals are not inherited by `tokio::spawn`; use [`spawn`] or
//! [`inherit`] to carry the context into sub-tasks.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use opentelemetry::{Context, KeyValue};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{report::ATError, span::TelemetrySpan};

tokio::task_local! {
    static CURRENT: CorrelationContext;
}

/// Causal identifier, accumulated errors, and span of one logical request.
///
/// Cloning is cheap and every clone refers to the same request.
#[derive(Clone)]
pub struct CorrelationContext {
    inner: Arc<Inner>,
}

struct Inner {
    msg_id: String,
    errors: Mutex<Vec<ATError>>,
    span: Mutex<Box<dyn TelemetrySpan>>,
    closed: AtomicBool,
    debug: bool,
}

impl CorrelationContext {
    /// Creates a context around an already started span, with a fresh v4 UUID
    /// as its causal identifier.
    pub fn create(span: Box<dyn TelemetrySpan>, debug: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                msg_id: Uuid::new_v4().to_string(),
                errors: Mutex::new(Vec::new()),
                span: Mutex::new(span),
                closed: AtomicBool::new(false),
                debug,
            }),
        }
    }

    /// The context of the request the caller is running in, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    pub fn msg_id(&self) -> &str {
        &self.inner.msg_id
    }

    /// Snapshot of the errors reported so far, in report order.
    pub fn errors(&self) -> Vec<ATError> {
        self.inner.errors.lock().clone()
    }

    pub fn debug(&self) -> bool {
        self.inner.debug
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Appends `error` and records it on the span. Ignored once the context
    /// has been destroyed.
    pub fn report(&self, error: ATError) {
        if self.is_closed() {
            if self.inner.debug {
                tracing::warn!(
                    msg_id = %self.msg_id(),
                    message = %error.message,
                    "error reported after the request finished; dropped"
                );
            }
            return;
        }

        self.inner.span.lock().record_exception(&error);
        self.inner.errors.lock().push(error);
    }

    /// OpenTelemetry context of this request's span.
    pub fn otel_context(&self) -> Context {
        self.inner.span.lock().context()
    }

    /// Runs `f` with exclusive access to the request's span.
    pub fn with_span<R>(&self, f: impl FnOnce(&mut dyn TelemetrySpan) -> R) -> R {
        let mut span = self.inner.span.lock();
        f(&mut **span)
    }

    /// Closes the context. Later reports are dropped.
    pub fn destroy(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Runs `future` with this context as the ambient one.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, future).await
    }

    /// Runs `f` synchronously with this context as the ambient one.
    pub fn sync_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self.clone(), f)
    }
}

impl std::fmt::Debug for CorrelationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationContext")
            .field("msg_id", &self.inner.msg_id)
            .field("errors", &self.inner.errors.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Wraps `future` so that it runs in the context that is ambient *now*.
pub fn inherit<F>(future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let context = CorrelationContext::current();
    async move {
        match context {
            Some(context) => context.scope(future).await,
            None => future.await,
        }
    }
}

/// [`tokio::spawn`] that carries the ambient context into the new task.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(inherit(future))
}

/// Adds custom attributes to the span of the current request. Returns
/// `false`, and does nothing, outside an instrumented request.
pub fn add_attributes<I>(attributes: I) -> bool
where
    I: IntoIterator<Item = KeyValue>,
{
    let Some(context) = CorrelationContext::current() else {
        tracing::debug!("custom attributes added outside an instrumented request; dropped");
        return false;
    };

    let attributes: Vec<KeyValue> = attributes.into_iter().collect();
    context.with_span(|span| span.set_attributes(attributes));
    true
}
