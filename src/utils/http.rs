//! HTTP utility functions

use hyper::header::{HeaderMap, CONNECTION};
use hyper::{Method, StatusCode};

/// Check whether a comma-separated header carries the given token
pub fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// Whether the connection may carry further exchanges after this response
pub fn is_persistent(version: &str, headers: &HeaderMap) -> bool {
    if header_has_token(headers, CONNECTION.as_str(), "close") {
        return false;
    }

    if version.eq_ignore_ascii_case("HTTP/1.0") {
        return header_has_token(headers, CONNECTION.as_str(), "keep-alive");
    }

    true
}

/// Responses that never carry a body, whatever their headers say
pub fn is_bodiless(method: &Method, status: StatusCode) -> bool {
    method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_rules() {
        let mut headers = HeaderMap::new();
        assert!(is_persistent("HTTP/1.1", &headers));
        assert!(!is_persistent("HTTP/1.0", &headers));

        headers.insert(CONNECTION, "Keep-Alive".parse().unwrap());
        assert!(is_persistent("HTTP/1.0", &headers));

        headers.insert(CONNECTION, "upgrade, close".parse().unwrap());
        assert!(!is_persistent("HTTP/1.1", &headers));
    }

    #[test]
    fn test_bodiless() {
        assert!(is_bodiless(&Method::HEAD, StatusCode::OK));
        assert!(is_bodiless(&Method::GET, StatusCode::NOT_MODIFIED));
        assert!(!is_bodiless(&Method::GET, StatusCode::OK));
    }
}
