use crate::{error::Result, redact::PathExpr};

/// Resolved instrumentation settings.
///
/// Built once through [`Config::builder`] and shared read-only, usually as an
/// `Arc<Config>`, by every request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    redact_headers: Vec<String>,
    redact_request_body: Vec<PathExpr>,
    redact_response_body: Vec<PathExpr>,
    capture_request_body: bool,
    capture_response_body: bool,
    service_name: String,
    service_version: Option<String>,
    tags: Vec<String>,
    debug: bool,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Header names to redact, lower-cased.
    pub fn redact_headers(&self) -> &[String] {
        &self.redact_headers
    }

    pub fn redact_request_body(&self) -> &[PathExpr] {
        &self.redact_request_body
    }

    pub fn redact_response_body(&self) -> &[PathExpr] {
        &self.redact_response_body
    }

    pub fn capture_request_body(&self) -> bool {
        self.capture_request_body
    }

    pub fn capture_response_body(&self) -> bool {
        self.capture_response_body
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_version(&self) -> Option<&str> {
        self.service_version.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

/// Collects raw options for a [`Config`]. Redaction paths are validated in
/// [`ConfigBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    redact_headers: Vec<String>,
    redact_request_body: Vec<String>,
    redact_response_body: Vec<String>,
    capture_request_body: bool,
    capture_response_body: bool,
    service_name: String,
    service_version: Option<String>,
    tags: Vec<String>,
    debug: bool,
}

impl ConfigBuilder {
    pub fn redact_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redact_headers.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn redact_request_body<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redact_request_body.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn redact_response_body<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redact_response_body.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn capture_request_body(mut self, capture: bool) -> Self {
        self.capture_request_body = capture;
        self
    }

    pub fn capture_response_body(mut self, capture: bool) -> Self {
        self.capture_response_body = capture;
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidRedactionPath`](crate::Error::InvalidRedactionPath)
    /// for the first body path that is not a valid JSONPath expression.
    pub fn build(self) -> Result<Config> {
        let compile = |paths: Vec<String>| -> Result<Vec<PathExpr>> {
            paths.into_iter().map(PathExpr::parse).collect()
        };

        let redact_headers = self
            .redact_headers
            .into_iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();

        Ok(Config {
            redact_headers,
            redact_request_body: compile(self.redact_request_body)?,
            redact_response_body: compile(self.redact_response_body)?,
            capture_request_body: self.capture_request_body,
            capture_response_body: self.capture_response_body,
            service_name: self.service_name,
            service_version: self.service_version,
            tags: self.tags,
            debug: self.debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn defaults() {
        let config = Config::builder().build().unwrap();
        assert_eq!(config, Config::default());
        assert!(!config.capture_request_body());
        assert!(!config.capture_response_body());
        assert!(config.redact_headers().is_empty());
        assert!(config.redact_request_body().is_empty());
        assert!(config.redact_response_body().is_empty());
        assert!(config.service_version().is_none());
        assert!(!config.debug());
    }

    #[test]
    fn header_names_are_lowercased() {
        let config = Config::builder()
            .redact_headers(["Authorization", "X-Api-Key"])
            .build()
            .unwrap();
        assert_eq!(config.redact_headers(), ["authorization", "x-api-key"]);
    }

    #[test]
    fn request_and_response_rules_stay_separate() {
        let config = Config::builder()
            .redact_request_body(["$.password"])
            .redact_response_body(["$.token"])
            .build()
            .unwrap();
        assert_eq!(config.redact_request_body()[0].as_str(), "$.password");
        assert_eq!(config.redact_response_body()[0].as_str(), "$.token");
        assert_eq!(config.redact_request_body().len(), 1);
        assert_eq!(config.redact_response_body().len(), 1);
    }

    #[test]
    fn invalid_path_fails_the_build() {
        let result = Config::builder().redact_response_body(["$.ok", "not a path"]).build();
        match result {
            Err(Error::InvalidRedactionPath { path, .. }) => assert_eq!(path, "not a path"),
            other => panic!("expected invalid path error, got {other:?}"),
        }
    }
}
