use std::fmt;

use url::Url;

use crate::error::SourceError;

const DEFAULT_RTMP_PORT: u16 = 1935;
const DEFAULT_RTSP_PORT: u16 = 554;

/// A pull-style media address: scheme, host, port and path.
///
/// `stub://` endpoints address the built-in synthetic stream and need no host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| SourceError::Init(format!("invalid stream url '{}': {}", raw, e)))?;
        let needs_host = url.scheme() != "stub";
        if needs_host && url.host_str().map_or(true, str::is_empty) {
            return Err(SourceError::Init(format!(
                "stream url '{}' is missing a host",
                raw
            )));
        }
        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Host for network endpoints; the stub name for `stub://name`.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port().or(match self.scheme() {
            "rtmp" | "rtmps" => Some(DEFAULT_RTMP_PORT),
            "rtsp" => Some(DEFAULT_RTSP_PORT),
            _ => None,
        })
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Value of a query parameter (used by `stub://` endpoints for tuning).
    pub fn query_param(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtmp_endpoint_defaults_port() {
        let endpoint = Endpoint::parse("rtmp://192.168.137.1/live/dron1").unwrap();
        assert_eq!(endpoint.scheme(), "rtmp");
        assert_eq!(endpoint.host(), "192.168.137.1");
        assert_eq!(endpoint.port(), Some(1935));
        assert_eq!(endpoint.path(), "/live/dron1");
    }

    #[test]
    fn explicit_port_wins() {
        let endpoint = Endpoint::parse("rtmp://127.0.0.1:1936/live/dron").unwrap();
        assert_eq!(endpoint.port(), Some(1936));
    }

    #[test]
    fn stub_endpoint_exposes_query() {
        let endpoint = Endpoint::parse("stub://drone?fps=5&refuse=true").unwrap();
        assert_eq!(endpoint.host(), "drone");
        assert_eq!(endpoint.query_param("fps").as_deref(), Some("5"));
        assert_eq!(endpoint.query_param("refuse").as_deref(), Some("true"));
        assert_eq!(endpoint.query_param("missing"), None);
    }

    #[test]
    fn malformed_urls_are_init_errors() {
        assert!(matches!(
            Endpoint::parse("not a url"),
            Err(SourceError::Init(_))
        ));
    }
}
