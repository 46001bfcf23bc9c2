//! The HTTP side of a worker: a thin connection wrapper over a blocking
//! reqwest client.
//!
//! The crawler does not care which HTTP library sits underneath; it only
//! needs `connect` to resolve a URL into a host:port, `issue_request` to
//! produce a status and a body, and the scheme/port of the current
//! connection. Workers block on the network by design, which is why the
//! pool's thread count is a user-facing knob.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::Method;
use url::Url;

use crate::config::HttpConfig;
use crate::url::{extract_host_port, Scheme};
use crate::CrawlError;

#[derive(Clone)]
struct Connection {
    scheme: Scheme,
    host_port: String,
    port: u16,
}

/// One worker's HTTP handle. Cloning shares the underlying client (a
/// cheap handle clone) but not the connection state, so copies can be
/// pointed at different hosts concurrently.
#[derive(Clone)]
pub struct HttpClient {
    inner: Client,
    conn: Option<Connection>,
}

impl HttpClient {
    /// Builds a client with the configured user agent and timeout.
    pub fn new(config: &HttpConfig) -> Result<Self, CrawlError> {
        let inner = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(HttpClient { inner, conn: None })
    }

    /// Resolves the target URL into a connection, returning the
    /// `"host[:port]"` string, or `None` when the URL is not something
    /// this client can talk to (unparsable, non-http scheme, no host).
    pub fn connect(&mut self, target_url: &str) -> Option<String> {
        let parsed = Url::parse(target_url).ok()?;
        let scheme = Scheme::from_url_scheme(parsed.scheme())?;
        parsed.host_str()?;
        let host_port = extract_host_port(target_url);
        self.conn = Some(Connection {
            scheme,
            host_port: host_port.clone(),
            port: parsed.port_or_known_default().unwrap_or(0),
        });
        Some(host_port)
    }

    /// Issues one request against the connected host and returns the
    /// status code together with the body. The body is captured for any
    /// status, a non-2xx answer is still a page.
    pub fn issue_request(&self, method: &str, path: &str) -> Result<(u16, String), CrawlError> {
        let conn = self.conn.as_ref().ok_or(CrawlError::NotConnected)?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| CrawlError::Method(method.to_string()))?;
        let url = format!("{}://{}{}", conn.scheme.as_str(), conn.host_port, path);
        let response = self.inner.request(method, &url).send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        Ok((status, body))
    }

    /// Scheme of the current connection, `None` when not connected.
    pub fn scheme(&self) -> Option<&str> {
        self.conn.as_ref().map(|conn| conn.scheme.as_str())
    }

    /// Scheme as the fixed buffer nodes carry; empty when not connected.
    pub fn scheme_buffer(&self) -> Scheme {
        self.conn.as_ref().map_or_else(Scheme::default, |conn| conn.scheme)
    }

    /// Port of the current connection, 0 when not connected.
    pub fn port(&self) -> u16 {
        self.conn.as_ref().map_or(0, |conn| conn.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpClient {
        HttpClient::new(&HttpConfig::default()).unwrap()
    }

    #[test]
    fn test_connect_extracts_host_port() {
        let mut c = client();
        assert_eq!(
            c.connect("https://site.com:8443/a/b").as_deref(),
            Some("site.com:8443")
        );
        assert_eq!(c.scheme(), Some("https"));
        assert_eq!(c.port(), 8443);
    }

    #[test]
    fn test_connect_default_ports() {
        let mut c = client();
        c.connect("http://site.com/").unwrap();
        assert_eq!(c.port(), 80);
        c.connect("https://site.com/").unwrap();
        assert_eq!(c.port(), 443);
    }

    #[test]
    fn test_connect_rejects_unsupported_urls() {
        let mut c = client();
        assert_eq!(c.connect("ftp://site.com/"), None);
        assert_eq!(c.connect("not a url"), None);
        assert_eq!(c.connect("/relative/only"), None);
        assert_eq!(c.scheme(), None);
        assert_eq!(c.port(), 0);
    }

    #[test]
    fn test_request_without_connect_fails() {
        let c = client();
        assert!(matches!(
            c.issue_request("GET", "/"),
            Err(CrawlError::NotConnected)
        ));
    }
}
