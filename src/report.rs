//! Error reporting for the request currently being handled.
//!
//! Reported errors are accumulated on the ambient
//! [`CorrelationContext`](crate::CorrelationContext) and serialized onto the
//! request's span when the response is ready. Reporting never fails: outside
//! an instrumented request it only logs a diagnostic.

use std::{backtrace::Backtrace, backtrace::BacktraceStatus, error::Error as StdError, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::CorrelationContext;

/// One reported error, as attached to `apitoolkit.errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ATError {
    pub when: DateTime<Utc>,
    pub error_type: String,
    pub message: String,
    /// Empty when nothing beyond the message is known.
    pub stack_trace: String,
}

impl ATError {
    /// Builds a record from an error value. The type name becomes
    /// `error_type`; the `source()` chain and, when enabled through
    /// `RUST_BACKTRACE`, a backtrace become `stack_trace`.
    pub fn from_error<E>(error: &E) -> Self
    where
        E: StdError + ?Sized,
    {
        let mut stack = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            stack.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        let backtrace = Backtrace::capture();
        if backtrace.status() == BacktraceStatus::Captured {
            stack.push(backtrace.to_string());
        }

        Self {
            when: Utc::now(),
            error_type: short_type_name::<E>(),
            message: error.to_string(),
            stack_trace: stack.join("\n"),
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            when: Utc::now(),
            error_type: "Error".to_owned(),
            message: message.into(),
            stack_trace: String::new(),
        }
    }

    /// Builds a record from any displayable value.
    pub fn from_display<T>(value: &T) -> Self
    where
        T: fmt::Display + ?Sized,
    {
        Self {
            error_type: short_type_name::<T>(),
            ..Self::from_message(value.to_string())
        }
    }
}

/// Last path segment of a type name, without generics. Unsized and borrowed
/// types fall back to `Error`.
fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    if full.starts_with("dyn ") || full.starts_with('&') || full == "str" {
        return "Error".to_owned();
    }

    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("Error")
        .to_owned()
}

/// Records `error` on the current request.
pub fn report(error: ATError) {
    match CorrelationContext::current() {
        Some(context) => context.report(error),
        None => tracing::debug!(
            message = %error.message,
            "error reported outside an instrumented request; dropped"
        ),
    }
}

pub fn report_error<E>(error: &E)
where
    E: StdError + ?Sized,
{
    report(ATError::from_error(error));
}

pub fn report_message(message: impl Into<String>) {
    report(ATError::from_message(message));
}
