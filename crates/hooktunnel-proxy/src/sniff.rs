//! Best-effort HTTP request detection on the first bytes of a connection.
//!
//! The classifier only looks at bytes the relay has already read and will
//! replay upstream verbatim. It never decides whether a connection is
//! forwarded; a `None` result simply means "treat as opaque".

/// Methods recognised when classifying a request line
pub const RECOGNIZED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Terminator of an HTTP/1.x header block
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Maximum number of headers inspected
const MAX_HEADERS: usize = 64;

/// Request line and host extracted from a connection prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffedRequest {
    pub method: String,
    pub path: String,
    /// Value of the `Host` header, empty when absent
    pub host: String,
}

/// Returns true when `buf` contains a complete header block.
pub fn has_complete_head(buf: &[u8]) -> bool {
    find_head_end(buf).is_some()
}

/// Offset just past the `\r\n\r\n` terminator, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Classify a connection prefix as an HTTP request.
///
/// Only a prefix containing a full `\r\n\r\n`-terminated head whose request
/// line uses one of [`RECOGNIZED_METHODS`] and an `HTTP/` version matches.
pub fn sniff_request(prefix: &[u8]) -> Option<SniffedRequest> {
    let head_end = find_head_end(prefix)?;
    let head = &prefix[..head_end];

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        // Too many headers or malformed framing: fall back to the request line alone
        Ok(httparse::Status::Partial) | Err(_) => return sniff_request_line(head),
    }

    let method = req.method?.to_ascii_uppercase();
    if !RECOGNIZED_METHODS.contains(&method.as_str()) {
        return None;
    }

    let host = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
        .unwrap_or_default();

    Some(SniffedRequest {
        method,
        path: req.path?.to_string(),
        host,
    })
}

/// Lenient split-on-space parse used when httparse rejects the head.
fn sniff_request_line(head: &[u8]) -> Option<SniffedRequest> {
    // ISO-8859-1 decoding: every byte maps to one char
    let text: String = head.iter().map(|&b| b as char).collect();
    let mut lines = text.split("\r\n");

    let mut parts = lines.next()?.split(' ');
    let method = parts.next()?.to_ascii_uppercase();
    let path = parts.next()?;
    let proto = parts.next()?;

    if !RECOGNIZED_METHODS.contains(&method.as_str()) || !proto.starts_with("HTTP/") {
        return None;
    }

    let host = lines
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("host")
                .then(|| value.trim().to_string())
        })
        .unwrap_or_default();

    Some(SniffedRequest {
        method,
        path: path.to_string(),
        host,
    })
}
