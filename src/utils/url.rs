//! URL utility functions

use url::Url;

/// Parse URL and extract components
pub fn parse_url(url_str: &str) -> Result<Url, url::ParseError> {
    Url::parse(url_str)
}

/// Check if URL is HTTPS
pub fn is_https(url: &Url) -> bool {
    url.scheme() == "https"
}

/// Host and effective port of an absolute URL
pub fn host_port(url: &Url) -> Option<(String, u16)> {
    let host = url.host_str().filter(|h| !h.is_empty())?;
    let port = url.port_or_known_default()?;
    Some((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
}

/// Request target in origin-form (`/path?query`)
pub fn origin_form(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Request target in absolute-form, as sent to a forward proxy
pub fn absolute_form(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

/// Value of the Host header: the port is omitted when it is the scheme default
pub fn host_header(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_port_uses_scheme_default() {
        let url = parse_url("https://example.com/x").unwrap();
        assert_eq!(host_port(&url), Some(("example.com".to_string(), 443)));
        let url = parse_url("http://example.com:8080/x").unwrap();
        assert_eq!(host_port(&url), Some(("example.com".to_string(), 8080)));
    }

    #[test]
    fn test_request_targets() {
        let url = parse_url("http://example.com:8080/a/b?c=d#frag").unwrap();
        assert_eq!(origin_form(&url), "/a/b?c=d");
        assert_eq!(absolute_form(&url), "http://example.com:8080/a/b?c=d");
        assert_eq!(host_header(&url).as_deref(), Some("example.com:8080"));

        let url = parse_url("http://example.com/").unwrap();
        assert_eq!(host_header(&url).as_deref(), Some("example.com"));
    }

    #[test]
    fn test_ipv6_host_loses_brackets() {
        let url = parse_url("http://[::1]:9000/").unwrap();
        assert_eq!(host_port(&url), Some(("::1".to_string(), 9000)));
    }
}
