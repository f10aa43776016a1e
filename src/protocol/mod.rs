//! Pure byte-slicing helpers for raw HTTP/1.x payloads.
//!
//! All functions operate on the unmodified wire bytes of a single HTTP
//! message and never allocate. Header names are matched
//! case-insensitively; values are returned with surrounding whitespace
//! trimmed.
//!
//! Reference: RFC 7230 (HTTP/1.1 message syntax).

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Request method: the token before the first space of the start line.
/// Returns the whole first line when no space is present.
pub fn method(payload: &[u8]) -> &[u8] {
    let line = first_line(payload);
    match find(line, b" ") {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Request path: the token between the first two spaces of the start line.
pub fn path(payload: &[u8]) -> &[u8] {
    let line = first_line(payload);
    let Some(start) = find(line, b" ") else {
        return &[];
    };
    let rest = &line[start + 1..];
    match find(rest, b" ") {
        Some(end) => &rest[..end],
        None => rest,
    }
}

/// Response status code: the token after the first space of a status line.
pub fn status(payload: &[u8]) -> &[u8] {
    // Same start-line position as a request path.
    path(payload)
}

/// True when the payload begins with an HTTP status line.
pub fn is_response(payload: &[u8]) -> bool {
    payload.starts_with(b"HTTP/")
}

/// Message body: everything after the first `\r\n\r\n`, or empty when the
/// header block is not complete yet.
pub fn body(payload: &[u8]) -> &[u8] {
    match find(payload, HEADER_END) {
        Some(idx) => &payload[idx + HEADER_END.len()..],
        None => &[],
    }
}

/// Byte length of the header block including the `\r\n\r\n` terminator,
/// or the whole payload length when the block is unterminated.
pub fn header_length(payload: &[u8]) -> usize {
    match find(payload, HEADER_END) {
        Some(idx) => idx + HEADER_END.len(),
        None => payload.len(),
    }
}

/// Case-insensitive header lookup. Returns the trimmed value.
pub fn header<'a>(payload: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let mut found = None;
    parse_headers(payload, |h, v| {
        if h.eq_ignore_ascii_case(name.as_bytes()) {
            found = Some(v);
            return false;
        }
        true
    });
    found
}

/// Invokes `callback(name, value)` for each header line until the
/// callback returns `false` or the header block ends.
pub fn parse_headers<'a>(payload: &'a [u8], mut callback: impl FnMut(&'a [u8], &'a [u8]) -> bool) {
    let mut rest = match find(payload, CRLF) {
        Some(idx) => &payload[idx + CRLF.len()..],
        None => return,
    };

    while !rest.is_empty() {
        let line = match find(rest, CRLF) {
            Some(idx) => {
                let line = &rest[..idx];
                rest = &rest[idx + CRLF.len()..];
                line
            }
            None => {
                let line = rest;
                rest = &[];
                line
            }
        };

        if line.is_empty() {
            return;
        }
        let Some(colon) = find(line, b":") else {
            continue;
        };
        let name = trim(&line[..colon]);
        let value = trim(&line[colon + 1..]);
        if !callback(name, value) {
            return;
        }
    }
}

/// Span of the full header line `Name: value\r\n` within the payload,
/// including the trailing CRLF. Used to delete a header without touching
/// any other byte.
pub fn header_line_span(payload: &[u8], name: &str) -> Option<std::ops::Range<usize>> {
    let header_end = find(payload, HEADER_END).map_or(payload.len(), |idx| idx + CRLF.len());
    let mut pos = find(payload, CRLF)? + CRLF.len();

    while pos < header_end {
        let line_end = match find(&payload[pos..], CRLF) {
            Some(idx) => pos + idx + CRLF.len(),
            None => payload.len(),
        };
        let line = &payload[pos..line_end];
        if let Some(colon) = find(line, b":") {
            if trim(&line[..colon]).eq_ignore_ascii_case(name.as_bytes()) {
                return Some(pos..line_end);
            }
        }
        pos = line_end;
    }
    None
}

fn first_line(payload: &[u8]) -> &[u8] {
    match find(payload, CRLF) {
        Some(idx) => &payload[..idx],
        None => payload,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace());
    let Some(start) = start else { return &[] };
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace());
    match end {
        Some(end) => &bytes[start..=end],
        None => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"POST /api/v1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 2\r\n\r\nab";

    #[test]
    fn test_start_line_tokens() {
        assert_eq!(method(REQUEST), b"POST");
        assert_eq!(path(REQUEST), b"/api/v1");
        assert_eq!(method(b"GET / HTTP/1.1"), b"GET");
        assert_eq!(status(b"HTTP/1.1 200 OK\r\n\r\n"), b"200");
    }

    #[test]
    fn test_body_and_header_length() {
        assert_eq!(body(REQUEST), b"ab");
        assert_eq!(header_length(REQUEST), REQUEST.len() - 2);
        assert_eq!(body(b"GET / HTTP/1.1"), b"");
        assert_eq!(header_length(b"GET / HTTP/1.1"), 14);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        assert_eq!(header(REQUEST, "content-length"), Some(&b"2"[..]));
        assert_eq!(header(REQUEST, "HOST"), Some(&b"example.com"[..]));
        assert_eq!(header(REQUEST, "Accept"), None);
    }

    #[test]
    fn test_parse_headers_early_exit() {
        let mut seen = Vec::new();
        parse_headers(REQUEST, |name, _| {
            seen.push(name.to_vec());
            false
        });
        assert_eq!(seen, vec![b"Host".to_vec()]);
    }

    #[test]
    fn test_parse_headers_stops_at_body() {
        let payload = b"POST / HTTP/1.1\r\nA: 1\r\n\r\nB: not-a-header";
        let mut names = Vec::new();
        parse_headers(payload, |name, value| {
            names.push((name.to_vec(), value.to_vec()));
            true
        });
        assert_eq!(names, vec![(b"A".to_vec(), b"1".to_vec())]);
    }

    #[test]
    fn test_header_line_span_strips_cleanly() {
        let payload = b"POST / HTTP/1.1\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\n";
        let span = header_line_span(payload, "Expect").unwrap();
        let mut stripped = payload.to_vec();
        stripped.drain(span);
        assert_eq!(
            stripped,
            b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\n".to_vec()
        );
        assert!(header_line_span(payload, "Accept").is_none());
    }

    #[test]
    fn test_is_response() {
        assert!(is_response(b"HTTP/1.1 200 OK\r\n\r\n"));
        assert!(!is_response(REQUEST));
    }
}
