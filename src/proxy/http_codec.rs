//! Raw HTTP/1.1 marshaling for the tunneled leg.
//!
//! The router renders the public request into one canonical HTTP/1.1 byte
//! message for the client to replay against its local origin, and parses the
//! accumulated origin bytes coming back. Parsing is deliberately tolerant:
//! the origin is arbitrary user software.

use http::{HeaderMap, Method};

/// Serialize a request as `METHOD path?query HTTP/1.1`, headers verbatim,
/// blank line, body. A `Host: localhost` header is synthesized when the
/// original carried none, so strict origins still answer.
pub fn serialize_request(
    method: &Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(path_and_query.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    if !headers.contains_key(http::header::HOST) {
        out.extend_from_slice(b"Host: localhost\r\n");
    }
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// A parsed origin response.
#[derive(Debug)]
pub struct ParsedResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

/// Result of interpreting accumulated response bytes.
#[derive(Debug)]
pub enum ResponseParse {
    Parsed(ParsedResponse),
    /// Not an HTTP message at all; served verbatim as a 200 text body
    /// (legacy tolerance for bare-TCP origins).
    Opaque(Vec<u8>),
    /// Looked like HTTP but did not parse; surfaced as 502.
    Malformed,
}

/// Parse the accumulated buffer as an HTTP/1.1 response.
///
/// Anything shorter than 12 bytes or without an `HTTP/` prefix is opaque.
/// `Transfer-Encoding: chunked` bodies are de-chunked because the public
/// transport re-frames the body itself; malformed chunk framing falls back
/// to the raw remainder.
pub fn parse_response(buf: &[u8]) -> ResponseParse {
    if buf.len() < 12 || !buf.starts_with(b"HTTP/") {
        return ResponseParse::Opaque(buf.to_vec());
    }

    let header_end = match find_header_end(buf) {
        Some(i) => i,
        None => return ResponseParse::Malformed,
    };
    let head = match std::str::from_utf8(&buf[..header_end]) {
        Ok(h) => h,
        Err(_) => return ResponseParse::Malformed,
    };

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    // "HTTP/1.1 200 OK"; the reason phrase is optional.
    let status = match status_line.split_whitespace().nth(1).and_then(|s| s.parse::<u16>().ok()) {
        Some(code) if (100..=599).contains(&code) => code,
        _ => return ResponseParse::Malformed,
    };

    let mut headers: Vec<(String, Vec<u8>)> = Vec::new();
    let mut chunked = false;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return ResponseParse::Malformed;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }
        headers.push((name.to_string(), value.as_bytes().to_vec()));
    }

    let raw_body = &buf[header_end + 4..];
    let body = if chunked {
        decode_chunked(raw_body).unwrap_or_else(|| raw_body.to_vec())
    } else {
        raw_body.to_vec()
    };

    ResponseParse::Parsed(ParsedResponse {
        status,
        headers,
        body,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Decode a chunked transfer-coding body. Trailers are ignored. Returns
/// `None` on any framing violation so the caller can fall back to raw bytes.
fn decode_chunked(mut buf: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(buf.len());
    loop {
        let line_end = buf.windows(2).position(|w| w == b"\r\n")?;
        let size_token = std::str::from_utf8(&buf[..line_end]).ok()?;
        // Chunk extensions (";ext=val") are permitted and dropped.
        let size_token = size_token.split(';').next()?.trim();
        let size = usize::from_str_radix(size_token, 16).ok()?;
        buf = &buf[line_end + 2..];

        if size == 0 {
            return Some(out);
        }
        if buf.len() < size + 2 {
            return None;
        }
        out.extend_from_slice(&buf[..size]);
        if &buf[size..size + 2] != b"\r\n" {
            return None;
        }
        buf = &buf[size + 2..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderName, HeaderValue};

    #[test]
    fn test_serialize_request_line_and_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-custom"),
            HeaderValue::from_static("1"),
        );
        let raw = serialize_request(&Method::POST, "/api?x=1", &headers, b"{\"k\":2}");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("POST /api?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: localhost\r\n"));
        assert!(text.contains("x-custom: 1\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"k\":2}"));
    }

    #[test]
    fn test_serialize_keeps_existing_host() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, HeaderValue::from_static("demo.dev"));
        let raw = serialize_request(&Method::GET, "/", &headers, b"");
        let text = String::from_utf8(raw).unwrap();
        assert!(text.contains("host: demo.dev\r\n"));
        assert!(!text.contains("Host: localhost"));
    }

    #[test]
    fn test_parse_simple_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        match parse_response(raw) {
            ResponseParse::Parsed(resp) => {
                assert_eq!(resp.status, 200);
                assert_eq!(resp.body, b"hello");
                assert!(resp
                    .headers
                    .iter()
                    .any(|(n, v)| n == "Content-Type" && v == b"text/plain"));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_without_reason_phrase() {
        let raw = b"HTTP/1.1 204\r\n\r\n";
        match parse_response(raw) {
            ResponseParse::Parsed(resp) => assert_eq!(resp.status, 204),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_short_or_non_http_is_opaque() {
        assert!(matches!(parse_response(b"hi"), ResponseParse::Opaque(_)));
        assert!(matches!(
            parse_response(b"this is not an http response"),
            ResponseParse::Opaque(_)
        ));
    }

    #[test]
    fn test_http_prefix_without_header_end_is_malformed() {
        assert!(matches!(
            parse_response(b"HTTP/1.1 200 OK\r\nContent-"),
            ResponseParse::Malformed
        ));
    }

    #[test]
    fn test_bad_status_is_malformed() {
        assert!(matches!(
            parse_response(b"HTTP/1.1 9999 NO\r\n\r\n"),
            ResponseParse::Malformed
        ));
    }

    #[test]
    fn test_chunked_body_is_decoded() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        match parse_response(raw) {
            ResponseParse::Parsed(resp) => assert_eq!(resp.body, b"hello world"),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_broken_chunk_framing_falls_back_to_raw() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nnot-chunked";
        match parse_response(raw) {
            ResponseParse::Parsed(resp) => assert_eq!(resp.body, b"not-chunked"),
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
