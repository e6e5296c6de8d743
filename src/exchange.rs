//! Framework-neutral request/response facts.
//!
//! Adapters translate their native request and response types into an
//! [`HttpExchange`], which is all the attribute builder ever sees.

use std::collections::BTreeMap;

use http::{header, uri::Authority, HeaderMap, Uri};
use serde_json::{Map, Value};

/// Header name to every value it was sent with, in arrival order.
pub type Headers = BTreeMap<String, Vec<String>>;

/// Query or path parameters as a JSON object.
pub type Params = Map<String, Value>;

/// Everything known about one request/response pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpExchange {
    pub host: String,
    /// `0` when no response was received.
    pub status_code: u16,
    pub query_params: Params,
    pub path_params: Params,
    pub request_headers: Headers,
    pub response_headers: Headers,
    pub method: String,
    /// Path plus query, exactly as requested.
    pub raw_target: String,
    /// Route template, e.g. `/users/:id`.
    pub route: String,
    /// Raw body bytes. `None` when the adapter did not read the body, in
    /// which case no body attribute is written even with capture enabled.
    pub request_body: Option<Vec<u8>>,
    pub response_body: Option<Vec<u8>>,
}

/// Route template of the matched handler, inserted into request extensions
/// by routers that know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTemplate(pub String);

/// Path parameters extracted by the router.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathParams(pub Params);

pub fn headers_from_map(map: &HeaderMap) -> Headers {
    headers_from_pairs(map.iter().map(|(k, v)| (k.as_str(), v.as_bytes())))
}

/// Groups raw header pairs by lower-cased name. Values that are not valid
/// UTF-8 are converted lossily.
pub fn headers_from_pairs<'a, I>(pairs: I) -> Headers
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut headers = Headers::new();
    for (name, value) in pairs {
        headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(String::from_utf8_lossy(value).into_owned());
    }
    headers
}

/// Parses a query string into `name -> [values]`.
pub fn query_params(query: &str) -> Params {
    let mut params = Params::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let entry = params
            .entry(key.into_owned())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = entry {
            values.push(Value::String(value.into_owned()));
        }
    }
    params
}

pub fn path_params<I, K, V>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), Value::String(v.into())))
        .collect()
}

/// Host name of an inbound request, without the port: the `Host` header when
/// present, otherwise the URI authority.
pub fn request_host(uri: &Uri, headers: &HeaderMap) -> String {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(host_without_port)
        .or_else(|| uri.host().map(str::to_owned))
        .unwrap_or_default()
}

/// Strips the port from a `host[:port]` authority.
pub fn host_without_port(authority: &str) -> String {
    authority
        .parse::<Authority>()
        .map(|authority| authority.host().to_owned())
        .unwrap_or_else(|_| authority.to_owned())
}

/// Path and query of a URI, `/` when it has neither.
pub fn raw_target(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde_json::json;

    #[test]
    fn groups_repeated_headers() {
        let mut map = HeaderMap::new();
        map.append("accept", HeaderValue::from_static("text/html"));
        map.append("accept", HeaderValue::from_static("application/json"));
        map.insert("x-id", HeaderValue::from_static("1"));

        let headers = headers_from_map(&map);

        assert_eq!(headers["accept"], vec!["text/html", "application/json"]);
        assert_eq!(headers["x-id"], vec!["1"]);
    }

    #[test]
    fn pairs_are_lowercased() {
        let headers = headers_from_pairs([("Content-Type", b"text/plain".as_slice())]);
        assert_eq!(headers["content-type"], vec!["text/plain"]);
    }

    #[test]
    fn query_values_become_arrays() {
        let params = query_params("page=1&tag=a&tag=b&q=hello%20world");
        assert_eq!(
            Value::Object(params),
            json!({"page": ["1"], "tag": ["a", "b"], "q": ["hello world"]})
        );
    }

    #[test]
    fn host_prefers_header_and_drops_port() {
        let uri: Uri = "http://internal:8080/users".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(request_host(&uri, &headers), "internal");

        headers.insert(header::HOST, HeaderValue::from_static("api.example.com:443"));
        assert_eq!(request_host(&uri, &headers), "api.example.com");
    }

    #[test]
    fn port_is_stripped() {
        assert_eq!(host_without_port("localhost:8080"), "localhost");
        assert_eq!(host_without_port("[::1]:8080"), "[::1]");
        assert_eq!(host_without_port("example.com"), "example.com");
    }

    #[test]
    fn raw_target_keeps_query() {
        let uri: Uri = "/users/123?expand=true".parse().unwrap();
        assert_eq!(raw_target(&uri), "/users/123?expand=true");
    }
}
