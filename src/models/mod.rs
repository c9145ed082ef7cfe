use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::connector::call::AbortHandle;
use crate::error::{Error, Result};
use crate::utils::{host_port, is_https, parse_url};

/// Outcome delivered to a caller, either inline or through its callback
pub type CallResult = std::result::Result<ClientResponse, Error>;

/// Callback invoked from the connection's inbound context in asynchronous mode
pub type ResponseCallback = Box<dyn FnOnce(CallResult) + Send + 'static>;

// The (host, port) pair a connection actually targets, after proxy resolution.
// Equality is exact: no DNS alias folding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Destination named by an absolute URL, using the scheme's default port.
    pub fn from_url(url: &Url) -> Result<Self> {
        let (host, port) = host_port(url).ok_or_else(|| Error::UnresolvedHost(url.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable outbound request descriptor handed to the connector
pub struct ClientRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Exchange the request over TLS
    pub confidential: bool,
    /// False for fire-and-forget requests whose response is never awaited
    pub expecting_response: bool,
    on_response: Option<ResponseCallback>,
    abort: AbortHandle,
}

impl ClientRequest {
    // Create a request for an absolute http(s) URL
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = parse_url(url)?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::InvalidRequest(format!("unsupported scheme '{}'", other)));
            }
        }

        Ok(Self {
            method,
            confidential: is_https(&url),
            url,
            headers: HeaderMap::new(),
            body: None,
            expecting_response: true,
            on_response: None,
            abort: AbortHandle::new(),
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::GET, url)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("bad header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("bad header value for '{}': {}", name, e)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Switch to asynchronous mode: the callback receives the outcome.
    pub fn on_response<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        self.on_response = Some(Box::new(callback));
        self
    }

    /// Mark the request as fire-and-forget.
    pub fn without_response(mut self) -> Self {
        self.expecting_response = false;
        self
    }

    pub fn is_asynchronous(&self) -> bool {
        self.on_response.is_some()
    }

    /// Handle that can abort this request from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub(crate) fn take_callback(&mut self) -> Option<ResponseCallback> {
        self.on_response.take()
    }
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(|b| b.len()))
            .field("confidential", &self.confidential)
            .field("expecting_response", &self.expecting_response)
            .field("asynchronous", &self.on_response.is_some())
            .finish()
    }
}

/// Inbound response descriptor
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ClientResponse {
    pub fn new(status: StatusCode, reason: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers,
            body,
        }
    }

    /// Result handed to fire-and-forget callers once their request was written.
    pub fn written() -> Self {
        Self::new(
            StatusCode::ACCEPTED,
            "Request written without awaiting a response",
            HeaderMap::new(),
            Bytes::new(),
        )
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

// Record of one finished exchange for the debug transaction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeLog {
    pub call_id: u64,
    pub method: String,
    pub url: String,
    pub destination: String,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request = ClientRequest::get("https://example.com/a?b=1").unwrap();
        assert!(request.confidential);
        assert!(request.expecting_response);
        assert!(!request.is_asynchronous());
        assert_eq!(Destination::from_url(&request.url).unwrap(), Destination::new("example.com", 443));
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = ClientRequest::get("ftp://example.com/").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_rejects_bad_header() {
        let err = ClientRequest::get("http://example.com/")
            .unwrap()
            .with_header("bad header", "x")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_destination_equality_is_exact() {
        assert_ne!(Destination::new("localhost", 80), Destination::new("127.0.0.1", 80));
        assert_eq!(Destination::new("a", 80).to_string(), "a:80");
    }
}
