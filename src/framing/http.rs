//! HTTP/1.x request boundary detection
//!
//! Finds where one request ends: request line, header block terminated
//! by an empty line, then `Content-Length` bytes of body. Positions of
//! the interesting parts are recorded in [`HttpHeaders`], relative to
//! the first byte of the request.

use super::{BoundaryDetector, DetectorFactory, Detection};
use std::ops::Range;

/// Maximum allowed header block size (64 KiB).
const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

/// Maximum allowed request line length.
const MAX_REQUEST_LINE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
}

impl HttpMethod {
    pub fn from_bytes(token: &[u8]) -> Option<Self> {
        Some(match token {
            b"GET" => HttpMethod::Get,
            b"HEAD" => HttpMethod::Head,
            b"POST" => HttpMethod::Post,
            b"PUT" => HttpMethod::Put,
            b"DELETE" => HttpMethod::Delete,
            b"OPTIONS" => HttpMethod::Options,
            b"PATCH" => HttpMethod::Patch,
            b"TRACE" => HttpMethod::Trace,
            b"CONNECT" => HttpMethod::Connect,
            _ => return None,
        })
    }
}

/// Request layout, as byte ranges into the message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    pub method: Option<HttpMethod>,
    pub uri: Range<usize>,
    pub host: Option<Range<usize>>,
    pub content_length: usize,
    pub body: Range<usize>,
}

/// Boundary detector for HTTP/1.0 and HTTP/1.1 requests
///
/// Chunked transfer encoding is rejected as malformed rather than
/// guessed at.
#[derive(Debug, Clone)]
pub struct HttpDetector {
    max_header_bytes: usize,
}

impl Default for HttpDetector {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

impl HttpDetector {
    /// Set the maximum header block size.
    #[must_use]
    pub fn max_header_bytes(mut self, limit: usize) -> Self {
        self.max_header_bytes = limit;
        self
    }

    /// Factory handing each connection its own HTTP framer
    pub fn factory(self) -> DetectorFactory<HttpDetector> {
        DetectorFactory::new(self)
    }
}

impl BoundaryDetector for HttpDetector {
    type Meta = HttpHeaders;

    fn detect(&mut self, bytes: &[u8], meta: &mut HttpHeaders) -> Detection {
        let Some(line_end) = find(bytes, b"\r\n", 0) else {
            if bytes.len() > MAX_REQUEST_LINE {
                return Detection::Malformed("request line too long".into());
            }
            return Detection::Incomplete;
        };
        if line_end > MAX_REQUEST_LINE {
            return Detection::Malformed("request line too long".into());
        }
        if let Err(reason) = parse_request_line(&bytes[..line_end], meta) {
            return Detection::Malformed(reason);
        }

        // The request line's CRLF doubles as the first half of the
        // terminator when there are no headers.
        let Some(blank) = find(bytes, b"\r\n\r\n", line_end) else {
            if bytes.len() > self.max_header_bytes {
                return Detection::Malformed("header block too large".into());
            }
            return Detection::Incomplete;
        };
        if blank > self.max_header_bytes {
            return Detection::Malformed("header block too large".into());
        }

        if let Err(reason) = parse_headers(bytes, line_end + 2, blank + 2, meta) {
            return Detection::Malformed(reason);
        }

        let body_start = blank + 4;
        let Some(body_end) = body_start.checked_add(meta.content_length) else {
            return Detection::Malformed("Content-Length out of range".into());
        };
        meta.body = body_start..body_end;

        if bytes.len() < body_end {
            Detection::Incomplete
        } else {
            Detection::Complete(body_end)
        }
    }
}

/// Parse `METHOD SP URI SP VERSION`.
fn parse_request_line(line: &[u8], meta: &mut HttpHeaders) -> Result<(), String> {
    let mut parts = line.split(|&b| b == b' ');
    let method = parts.next().filter(|p| !p.is_empty());
    let uri = parts.next().filter(|p| !p.is_empty());
    let version = parts.next().filter(|p| !p.is_empty());
    let (Some(method), Some(uri), Some(version)) = (method, uri, version) else {
        return Err("malformed request line".into());
    };
    if parts.next().is_some() {
        return Err("malformed request line".into());
    }

    meta.method = Some(
        HttpMethod::from_bytes(method)
            .ok_or_else(|| format!("unrecognised method {:?}", String::from_utf8_lossy(method)))?,
    );
    if !version.starts_with(b"HTTP/1.") {
        return Err(format!(
            "unsupported version {:?}",
            String::from_utf8_lossy(version)
        ));
    }

    let uri_start = method.len() + 1;
    meta.uri = uri_start..uri_start + uri.len();
    Ok(())
}

/// Parse header lines in `bytes[start..end]`, each terminated by CRLF.
fn parse_headers(
    bytes: &[u8],
    start: usize,
    end: usize,
    meta: &mut HttpHeaders,
) -> Result<(), String> {
    let mut seen_length = false;
    let mut pos = start;

    while pos < end {
        let line_end = find(bytes, b"\r\n", pos).filter(|&e| e < end).unwrap_or(end);
        let line = &bytes[pos..line_end];

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or("header line without colon")?;
        let name = &line[..colon];
        if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
            return Err("malformed header name".into());
        }
        let value = trim(pos + colon + 1, line_end, bytes);

        if name.eq_ignore_ascii_case(b"content-length") {
            if seen_length {
                return Err("duplicate Content-Length".into());
            }
            seen_length = true;
            meta.content_length = parse_length(&bytes[value.clone()])
                .ok_or("invalid Content-Length")?;
        } else if name.eq_ignore_ascii_case(b"host") {
            meta.host = Some(value);
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            return Err("transfer encoding not supported".into());
        }

        pos = line_end + 2;
    }
    Ok(())
}

fn parse_length(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Range of `bytes[start..end]` without surrounding spaces and tabs
fn trim(mut start: usize, mut end: usize, bytes: &[u8]) -> Range<usize> {
    while start < end && matches!(bytes[start], b' ' | b'\t') {
        start += 1;
    }
    while end > start && matches!(bytes[end - 1], b' ' | b'\t') {
        end -= 1;
    }
    start..end
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(bytes: &[u8]) -> (Detection, HttpHeaders) {
        let mut meta = HttpHeaders::default();
        let result = HttpDetector::default().detect(bytes, &mut meta);
        (result, meta)
    }

    #[test]
    fn test_get_without_body() {
        let req = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (result, meta) = detect(req);
        assert_eq!(result, Detection::Complete(req.len()));
        assert_eq!(meta.method, Some(HttpMethod::Get));
        assert_eq!(&req[meta.uri.clone()], b"/index.html");
        assert_eq!(&req[meta.host.clone().unwrap()], b"example.com");
        assert_eq!(meta.body, req.len()..req.len());
    }

    #[test]
    fn test_no_headers_at_all() {
        let req = b"GET / HTTP/1.0\r\n\r\n";
        assert_eq!(detect(req).0, Detection::Complete(req.len()));
    }

    #[test]
    fn test_post_waits_for_body() {
        let head = b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        let mut req = head.to_vec();
        req.extend_from_slice(b"hel");
        assert_eq!(detect(&req).0, Detection::Incomplete);

        req.extend_from_slice(b"lo");
        let (result, meta) = detect(&req);
        assert_eq!(result, Detection::Complete(req.len()));
        assert_eq!(meta.content_length, 5);
        assert_eq!(&req[meta.body], b"hello");
    }

    #[test]
    fn test_boundary_before_trailing_bytes() {
        let first = b"PUT /a HTTP/1.1\r\ncontent-length: 2\r\n\r\nok";
        let mut buf = first.to_vec();
        buf.extend_from_slice(b"GET /b HTTP/1.1\r\n");
        assert_eq!(detect(&buf).0, Detection::Complete(first.len()));
    }

    #[test]
    fn test_incomplete_head() {
        assert_eq!(detect(b"GET / HT").0, Detection::Incomplete);
        assert_eq!(detect(b"GET / HTTP/1.1\r\nHost: x").0, Detection::Incomplete);
    }

    #[test]
    fn test_malformed_inputs() {
        for bad in [
            &b"BREW /pot HTTP/1.1\r\n\r\n"[..],
            b"GET /\r\n\r\n",
            b"GET / SPDY/3\r\n\r\n",
            b"GET / HTTP/1.1\r\nContent-Length: abc\r\n\r\n",
            b"GET / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 1\r\n\r\nx",
            b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n",
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        ] {
            assert!(
                matches!(detect(bad).0, Detection::Malformed(_)),
                "expected malformed: {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn test_content_length_overflow() {
        let req = b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nabc";
        assert!(matches!(detect(req).0, Detection::Malformed(_)));

        // Too many digits for usize at all
        let req = b"POST / HTTP/1.1\r\nContent-Length: 99999999999999999999999\r\n\r\n";
        assert!(matches!(detect(req).0, Detection::Malformed(_)));
    }

    #[test]
    fn test_header_limit() {
        let mut detector = HttpDetector::default().max_header_bytes(32);
        let mut meta = HttpHeaders::default();
        let req = b"GET / HTTP/1.1\r\nX-Padding: aaaaaaaaaaaaaaaaaaaaaaaa";
        assert!(matches!(
            detector.detect(req, &mut meta),
            Detection::Malformed(_)
        ));
    }
}
