//! Normalizes an [`HttpExchange`] into span attributes.
//!
//! [`build`] is the single place where request/response facts, the
//! correlation state of the request, and the [`Config`] meet. It writes the
//! bulk attribute set onto the span in one call, then each header as its own
//! attribute, and returns what it wrote.
//!
//! A failing sub-step only drops the attributes it would have produced.
//! Nothing here panics or returns an error to the caller.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use opentelemetry::{Array, KeyValue, StringValue, Value};

use crate::{
    config::Config,
    error::{Error, Result},
    exchange::{Headers, HttpExchange, Params},
    redact::{redact_body, redact_headers, PathExpr},
    report::ATError,
    span::TelemetrySpan,
};

pub const NET_HOST_NAME: &str = "net.host.name";
pub const HTTP_ROUTE: &str = "http.route";
pub const HTTP_TARGET: &str = "http.target";
pub const HTTP_REQUEST_METHOD: &str = "http.request.method";
pub const HTTP_RESPONSE_STATUS_CODE: &str = "http.response.status_code";
pub const HTTP_REQUEST_QUERY_PARAMS: &str = "http.request.query_params";
pub const HTTP_REQUEST_PATH_PARAMS: &str = "http.request.path_params";
pub const HTTP_REQUEST_BODY: &str = "http.request.body";
pub const HTTP_RESPONSE_BODY: &str = "http.response.body";
pub const HTTP_REQUEST_HEADER_PREFIX: &str = "http.request.header.";
pub const HTTP_RESPONSE_HEADER_PREFIX: &str = "http.response.header.";
pub const SDK_TYPE: &str = "apitoolkit.sdk_type";
pub const MSG_ID: &str = "apitoolkit.msg_id";
pub const PARENT_ID: &str = "apitoolkit.parent_id";
pub const ERRORS: &str = "apitoolkit.errors";

/// Which integration produced a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkType {
    Tower,
    Actix,
    Outgoing,
    Custom(&'static str),
}

impl SdkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdkType::Tower => "RustTower",
            SdkType::Actix => "RustActix",
            SdkType::Outgoing => "RustOutgoing",
            SdkType::Custom(name) => name,
        }
    }
}

/// Correlation state of the request being described.
#[derive(Debug, Clone, Copy)]
pub struct Correlation<'a> {
    pub msg_id: &'a str,
    pub parent_id: Option<&'a str>,
    pub errors: &'a [ATError],
    pub sdk_type: SdkType,
}

/// The attributes written for one request/response pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSet {
    bulk: BTreeMap<String, Value>,
    headers: Vec<KeyValue>,
}

impl AttributeSet {
    /// A bulk attribute by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.bulk.get(key)
    }

    /// A per-header attribute by its full key, e.g. `http.request.header.accept`.
    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    pub fn bulk(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.bulk.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn headers(&self) -> &[KeyValue] {
        &self.headers
    }

    fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.bulk.insert(key.to_owned(), value.into());
    }

    fn bulk_key_values(&self) -> Vec<KeyValue> {
        self.bulk
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect()
    }
}

/// Computes the attributes for `exchange` and writes them onto `span`.
pub fn build(
    span: &mut dyn TelemetrySpan,
    exchange: &HttpExchange,
    correlation: &Correlation<'_>,
    config: &Config,
) -> AttributeSet {
    let mut set = AttributeSet::default();

    set.insert(NET_HOST_NAME, exchange.host.clone());
    set.insert(HTTP_ROUTE, exchange.route.clone());
    set.insert(HTTP_TARGET, exchange.raw_target.clone());
    set.insert(HTTP_REQUEST_METHOD, exchange.method.clone());
    set.insert(HTTP_RESPONSE_STATUS_CODE, i64::from(exchange.status_code));
    set.insert(SDK_TYPE, correlation.sdk_type.as_str());
    set.insert(MSG_ID, correlation.msg_id.to_owned());
    if let Some(parent_id) = correlation.parent_id {
        set.insert(PARENT_ID, parent_id.to_owned());
    }

    for (key, params, what) in [
        (HTTP_REQUEST_QUERY_PARAMS, &exchange.query_params, "query params"),
        (HTTP_REQUEST_PATH_PARAMS, &exchange.path_params, "path params"),
    ] {
        match serialize_params(params, what) {
            Ok(json) => set.insert(key, json),
            Err(error) => degrade(config, &error),
        }
    }

    for (capture, body, paths, key) in [
        (
            config.capture_request_body(),
            &exchange.request_body,
            config.redact_request_body(),
            HTTP_REQUEST_BODY,
        ),
        (
            config.capture_response_body(),
            &exchange.response_body,
            config.redact_response_body(),
            HTTP_RESPONSE_BODY,
        ),
    ] {
        match (capture, body) {
            (true, Some(body)) => set.insert(key, encode_body(body, paths)),
            (true, None) => tracing::debug!(key, "body not available; attribute omitted"),
            (false, _) => {}
        }
    }

    if !correlation.errors.is_empty() {
        match serialize_errors(correlation.errors) {
            Ok(json) => set.insert(ERRORS, json),
            Err(error) => degrade(config, &error),
        }
    }

    set.headers.extend(header_attributes(
        HTTP_REQUEST_HEADER_PREFIX,
        &redact_headers(&exchange.request_headers, config.redact_headers()),
    ));
    set.headers.extend(header_attributes(
        HTTP_RESPONSE_HEADER_PREFIX,
        &redact_headers(&exchange.response_headers, config.redact_headers()),
    ));

    span.set_attributes(set.bulk_key_values());
    for attribute in &set.headers {
        span.set_attribute(attribute.clone());
    }

    set
}

fn serialize_params(params: &Params, what: &'static str) -> Result<String> {
    serde_json::to_string(params).map_err(|source| Error::Serialize { what, source })
}

fn serialize_errors(errors: &[ATError]) -> Result<String> {
    serde_json::to_string(errors).map_err(|source| Error::Serialize {
        what: "errors",
        source,
    })
}

fn encode_body(body: &[u8], paths: &[PathExpr]) -> String {
    STANDARD.encode(redact_body(body, paths))
}

fn header_attributes<'a>(
    prefix: &'a str,
    headers: &'a Headers,
) -> impl Iterator<Item = KeyValue> + 'a {
    headers.iter().map(move |(name, values)| {
        let key = format!("{prefix}{}", name.to_ascii_lowercase());
        let value = match values.as_slice() {
            [single] => Value::String(single.clone().into()),
            many => Value::Array(Array::String(
                many.iter().cloned().map(StringValue::from).collect(),
            )),
        };
        KeyValue::new(key, value)
    })
}

fn degrade(config: &Config, error: &Error) {
    if config.debug() {
        tracing::warn!(%error, "skipping attribute");
    } else {
        tracing::debug!(%error, "skipping attribute");
    }
}
