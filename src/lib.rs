//! # APItoolkit tracing
//! This crate instruments HTTP services so that every request produces one
//! OpenTelemetry span describing the full exchange: route, status, query and
//! path parameters, headers, bodies, and the errors raised while handling it.
//! Sensitive headers and JSON body fields are redacted before anything is
//! written.
//!
//! ## Setup
//! The global tracer provider and `tracing` subscriber can be installed with
//! [`setup::setup`]. This should be the first call of any server binary.
//!
//! ## Inbound requests
//! When using [`tower`](https://docs.rs/tower) based http frameworks like
//! [`axum`](https://docs.rs/axum/latest/axum), the middleware
//! [`middleware::tower::ApiToolkitLayer`] instruments every request. For
//! actix-web, enable the `actix` feature and wrap the app in
//! `middleware::actix::ApiToolkitMiddleware`.
//!
//! Generally, the middleware should be used on every http route, this usually
//! means that it can be registered globally and in the last position, to be the
//! first to run.
//!
//! ## Errors and correlation
//! Inside a handler, [`report_error`] and [`report_message`] attach errors to
//! the current request. Calls to other services made through
//! [`middleware::tower::OutgoingLayer`] or [`OutgoingCorrelator`] get their own
//! span carrying the inbound request's identifier as `apitoolkit.parent_id`.
//! Work moved to another task keeps its request when started with
//! [`context::spawn`].

pub mod attributes;
pub mod config;
pub mod context;
mod error;
pub mod exchange;
pub mod middleware;
pub mod outgoing;
pub mod redact;
pub mod report;
pub mod setup;
pub mod span;
mod toolkit;

pub use attributes::{AttributeSet, SdkType};
pub use config::{Config, ConfigBuilder};
pub use context::{add_attributes, CorrelationContext};
pub use error::{Error, Result};
pub use exchange::HttpExchange;
pub use outgoing::{OutgoingCorrelator, OutgoingRequest, OutgoingResponse, PendingCall};
pub use report::{report, report_error, report_message, ATError};
pub use toolkit::ApiToolkit;
