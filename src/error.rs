use thiserror::Error;

/// Errors surfaced by the crate.
///
/// Nothing on the request path returns these to the host application; the
/// attribute builder downgrades them to diagnostics. They are only visible
/// while building a [`Config`](crate::Config) or running [`setup`](crate::setup).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid redaction path `{path}`: {reason}")]
    InvalidRedactionPath { path: String, reason: String },

    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to install the tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
