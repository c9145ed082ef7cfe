//! Minimal HTTP/1.1 framing for requests written to, and responses read
//! from, a pooled connection

use bytes::{BufMut, Bytes, BytesMut};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Method, StatusCode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Error, Result};
use crate::models::{ClientRequest, ClientResponse};
use crate::utils::{absolute_form, header_has_token, host_header, is_bodiless, is_persistent, origin_form};

/// Longest status or header line accepted
const MAX_LINE: usize = 16 * 1024;

/// Most header lines accepted in one response
const MAX_HEADERS: usize = 128;

/// Largest response body accepted, whatever its framing
const MAX_BODY: usize = 64 * 1024 * 1024;

/// A final response plus whether the connection may carry more exchanges
#[derive(Debug)]
pub struct InboundMessage {
    pub response: ClientResponse,
    pub persistent: bool,
}

/// Serialize a request to wire form.
///
/// `absolute_form` selects the request target sent to a forward proxy.
/// When `persistent` is false the request asks the server to close.
pub fn encode_request(request: &ClientRequest, absolute_form_target: bool, persistent: bool) -> Bytes {
    let target = if absolute_form_target {
        absolute_form(&request.url)
    } else {
        origin_form(&request.url)
    };

    let mut buf = BytesMut::with_capacity(256 + request.body.as_ref().map_or(0, |b| b.len()));
    buf.put_slice(request.method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !request.headers.contains_key(HOST) {
        if let Some(host) = host_header(&request.url) {
            put_header(&mut buf, HOST.as_str(), host.as_bytes());
        }
    }

    for (name, value) in request.headers.iter() {
        put_header(&mut buf, name.as_str(), value.as_bytes());
    }

    if let Some(body) = &request.body {
        if !request.headers.contains_key(CONTENT_LENGTH) && !request.headers.contains_key(TRANSFER_ENCODING) {
            put_header(&mut buf, CONTENT_LENGTH.as_str(), body.len().to_string().as_bytes());
        }
    }

    if !persistent && !header_has_token(&request.headers, CONNECTION.as_str(), "close") {
        put_header(&mut buf, CONNECTION.as_str(), b"close");
    }

    buf.put_slice(b"\r\n");

    if let Some(body) = &request.body {
        buf.put_slice(body);
    }

    buf.freeze()
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// Read the next final response for a request sent with `method`.
///
/// Interim 1xx responses are skipped, except 101 which ends the exchange.
pub async fn read_response<R>(reader: &mut R, method: &Method) -> Result<InboundMessage>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let status_line = read_line(reader)
            .await?
            .ok_or_else(|| Error::Communication("connection closed before a response arrived".to_string()))?;

        let (version, status, reason) = parse_status_line(&status_line)?;
        let headers = read_headers(reader).await?;

        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            log::trace!("Skipping interim response {}", status);
            continue;
        }

        let mut persistent = is_persistent(&version, &headers);

        let body = if is_bodiless(method, status) {
            if status == StatusCode::SWITCHING_PROTOCOLS {
                persistent = false;
            }
            Bytes::new()
        } else if header_has_token(&headers, TRANSFER_ENCODING.as_str(), "chunked") {
            read_chunked(reader).await?
        } else if let Some(length) = content_length(&headers)? {
            if length > MAX_BODY {
                return Err(body_too_large(length));
            }
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            Bytes::from(body)
        } else {
            // Close-delimited
            persistent = false;
            let mut body = Vec::new();
            (&mut *reader).take(MAX_BODY as u64 + 1).read_to_end(&mut body).await?;
            if body.len() > MAX_BODY {
                return Err(body_too_large(body.len()));
            }
            Bytes::from(body)
        };

        return Ok(InboundMessage {
            response: ClientResponse::new(status, reason, headers, body),
            persistent,
        });
    }
}

/// One CRLF-terminated line without its terminator; None at a clean EOF.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_LINE as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        return Err(Error::Protocol("truncated or oversized line".to_string()));
    }

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    String::from_utf8(line)
        .map(Some)
        .map_err(|_| Error::Protocol("line is not valid UTF-8".to_string()))
}

fn parse_status_line(line: &str) -> Result<(String, StatusCode, String)> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(Error::Protocol(format!("bad status line '{}'", line)));
    }

    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| Error::Protocol(format!("bad status code in '{}'", line)))?;

    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((version.to_string(), status, reason))
}

async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = HeaderMap::new();

    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| Error::Communication("connection closed inside response headers".to_string()))?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADERS {
            return Err(Error::Protocol("too many response headers".to_string()));
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("malformed header line '{}'", line)))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| Error::Protocol(format!("bad header name '{}'", name)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| Error::Protocol(format!("bad value for header '{}'", name)))?;
        headers.append(name, value);
    }
}

fn body_too_large(length: usize) -> Error {
    Error::Protocol(format!("response body of {} bytes exceeds the {} byte limit", length, MAX_BODY))
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map(Some)
            .ok_or_else(|| Error::Protocol("bad content-length".to_string())),
    }
}

async fn read_chunked<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = BytesMut::new();

    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| Error::Communication("connection closed inside chunked body".to_string()))?;

        // Strip chunk extensions (;key=value)
        let size_hex = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_hex, 16)
            .map_err(|_| Error::Protocol(format!("bad chunk size '{}'", size_hex)))?;

        if size == 0 {
            // Trailers end at the first empty line
            while let Some(trailer) = read_line(reader).await? {
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body.freeze());
        }

        let start = body.len();
        let end = start
            .checked_add(size)
            .filter(|end| *end <= MAX_BODY)
            .ok_or_else(|| body_too_large(size))?;
        body.resize(end, 0);
        reader.read_exact(&mut body[start..]).await?;

        match read_line(reader).await? {
            Some(end) if end.is_empty() => {}
            _ => return Err(Error::Protocol("missing CRLF after chunk".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(bytes: &Bytes) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[test]
    fn test_encode_origin_form() {
        let request = ClientRequest::get("http://example.com:8080/a?b=c")
            .unwrap()
            .with_header("accept", "text/plain")
            .unwrap();
        let wire = text(&encode_request(&request, false, true));

        assert!(wire.starts_with("GET /a?b=c HTTP/1.1\r\nhost: example.com:8080\r\n"));
        assert!(wire.contains("accept: text/plain\r\n"));
        assert!(!wire.contains("connection"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_encode_proxy_form_with_body_and_close() {
        let request = ClientRequest::new(Method::POST, "http://example.com/submit")
            .unwrap()
            .with_body("hello");
        let wire = text(&encode_request(&request, true, false));

        assert!(wire.starts_with("POST http://example.com/submit HTTP/1.1\r\n"));
        assert!(wire.contains("content-length: 5\r\n"));
        assert!(wire.contains("connection: close\r\n"));
        assert!(wire.ends_with("\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_read_content_length_response() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Test: yes\r\n\r\nhelloHTTP/1.1";
        let message = read_response(&mut input, &Method::GET).await.unwrap();

        assert_eq!(message.response.status, StatusCode::OK);
        assert_eq!(message.response.reason, "OK");
        assert_eq!(message.response.header("x-test"), Some("yes"));
        assert_eq!(message.response.text(), "hello");
        assert!(message.persistent);
        // The next response stays in the buffer
        assert_eq!(input, b"HTTP/1.1");
    }

    #[tokio::test]
    async fn test_read_chunked_response() {
        let mut input: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let message = read_response(&mut input, &Method::GET).await.unwrap();

        assert_eq!(message.response.text(), "Wikipedia");
        assert!(message.persistent);
        assert!(input.is_empty());
    }

    #[tokio::test]
    async fn test_interim_responses_are_skipped() {
        let mut input: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n";
        let message = read_response(&mut input, &Method::POST).await.unwrap();
        assert_eq!(message.response.status, StatusCode::NO_CONTENT);
        assert!(message.response.body.is_empty());
    }

    #[tokio::test]
    async fn test_close_delimited_body_ends_persistence() {
        let mut input: &[u8] = b"HTTP/1.0 200 OK\r\n\r\nall of it";
        let message = read_response(&mut input, &Method::GET).await.unwrap();
        assert_eq!(message.response.text(), "all of it");
        assert!(!message.persistent);
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let message = read_response(&mut input, &Method::HEAD).await.unwrap();
        assert!(message.response.body.is_empty());
        assert!(message.persistent);
    }

    #[tokio::test]
    async fn test_connection_close_header() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";
        let message = read_response(&mut input, &Method::GET).await.unwrap();
        assert!(!message.persistent);
    }

    #[tokio::test]
    async fn test_malformed_input() {
        let mut input: &[u8] = b"SMTP ready\r\n\r\n";
        assert!(matches!(
            read_response(&mut input, &Method::GET).await,
            Err(Error::Protocol(_))
        ));

        let mut input: &[u8] = b"";
        assert!(matches!(
            read_response(&mut input, &Method::GET).await,
            Err(Error::Communication(_))
        ));

        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";
        assert!(matches!(
            read_response(&mut input, &Method::GET).await,
            Err(Error::Communication(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_content_length_is_rejected() {
        let mut input: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\n";
        assert!(matches!(
            read_response(&mut input, &Method::GET).await,
            Err(Error::Protocol(_))
        ));

        let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", MAX_BODY + 1);
        let mut input: &[u8] = header.as_bytes();
        assert!(matches!(
            read_response(&mut input, &Method::GET).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_rejected() {
        let mut input: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\nffffffffffffffff\r\n";
        assert!(matches!(
            read_response(&mut input, &Method::GET).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_close_delimited_body_is_rejected() {
        let mut wire = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
        wire.resize(wire.len() + MAX_BODY + 1, b'x');
        let mut input: &[u8] = &wire;
        assert!(matches!(
            read_response(&mut input, &Method::GET).await,
            Err(Error::Protocol(_))
        ));
    }
}
