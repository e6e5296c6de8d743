//! Redaction of headers and JSON bodies.
//!
//! Both operations return redacted copies; the caller's data is never
//! touched. Header rules match on the header *name*, case-insensitively.
//! Body rules are JSONPath expressions compiled once into [`PathExpr`].

use std::{borrow::Cow, fmt, sync::Arc};

use serde_json::Value;
use serde_json_path::JsonPath;

use crate::{error::Error, exchange::Headers};

/// Replacement written in place of every redacted value.
pub const REDACTED: &str = "[CLIENT_REDACTED]";

/// A compiled JSONPath expression selecting fields to redact, e.g. `$.password`.
#[derive(Clone)]
pub struct PathExpr {
    raw: String,
    path: Arc<JsonPath>,
}

impl PathExpr {
    pub fn parse(raw: impl Into<String>) -> Result<Self, Error> {
        let raw = raw.into();
        let path = JsonPath::parse(&raw).map_err(|error| Error::InvalidRedactionPath {
            reason: error.to_string(),
            path: raw.clone(),
        })?;

        Ok(Self {
            raw,
            path: Arc::new(path),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// JSON pointers of every node this expression selects in `value`.
    fn pointers(&self, value: &Value) -> Vec<String> {
        self.path
            .query_located(value)
            .locations()
            .map(|location| location.to_json_pointer())
            .collect()
    }
}

impl fmt::Debug for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathExpr").field(&self.raw).finish()
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for PathExpr {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PathExpr {}

/// Returns a copy of `headers` where every entry whose name is listed in
/// `names` (ignoring ASCII case) carries the single value [`REDACTED`].
pub fn redact_headers(headers: &Headers, names: &[String]) -> Headers {
    headers
        .iter()
        .map(|(name, values)| {
            let values = if names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                vec![REDACTED.to_owned()]
            } else {
                values.clone()
            };
            (name.clone(), values)
        })
        .collect()
}

/// Redacts a raw body.
///
/// The body is parsed as JSON; every field selected by one of `paths` is
/// replaced with [`REDACTED`] and the document is re-serialized. Bodies that
/// are not JSON, and JSON bodies where no path matched, come back borrowed and
/// byte-identical.
pub fn redact_body<'a>(body: &'a [u8], paths: &[PathExpr]) -> Cow<'a, [u8]> {
    if paths.is_empty() || body.is_empty() {
        return Cow::Borrowed(body);
    }

    let Ok(document) = serde_json::from_slice::<Value>(body) else {
        return Cow::Borrowed(body);
    };

    match redact_matches(&document, paths) {
        Some(redacted) => match serde_json::to_vec(&redacted) {
            Ok(bytes) => Cow::Owned(bytes),
            Err(error) => {
                tracing::debug!(%error, "failed to re-serialize redacted body");
                Cow::Borrowed(body)
            }
        },
        None => Cow::Borrowed(body),
    }
}

/// Redacts an already-parsed JSON document, returning a new value.
pub fn redact_json(document: &Value, paths: &[PathExpr]) -> Value {
    redact_matches(document, paths).unwrap_or_else(|| document.clone())
}

/// `None` when no path selected anything.
fn redact_matches(document: &Value, paths: &[PathExpr]) -> Option<Value> {
    let pointers: Vec<String> = paths.iter().flat_map(|p| p.pointers(document)).collect();
    if pointers.is_empty() {
        return None;
    }

    let mut redacted = document.clone();
    for pointer in &pointers {
        if let Some(slot) = redacted.pointer_mut(pointer) {
            *slot = Value::String(REDACTED.to_owned());
        }
    }

    Some(redacted)
}
