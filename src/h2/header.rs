//! Header field model and `http` crate interop.

use std::fmt;

use http::{HeaderMap, StatusCode};

use crate::error::{Error, Result};
use crate::h2::frame::ErrorCode;

/// One header field. Names are stored lowercase, as HTTP/2 requires.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut name = name.into();
        name.make_ascii_lowercase();
        Self {
            name,
            value: value.into(),
        }
    }

    /// True for `:method`, `:status` and the rest of the reserved namespace.
    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

impl<N: Into<String>, V: Into<String>> From<(N, V)> for Header {
    fn from((name, value): (N, V)) -> Self {
        Self::new(name, value)
    }
}

const PSEUDO_HEADERS: [&str; 5] = [":method", ":scheme", ":authority", ":path", ":status"];

/// RFC 9113 Section 8.2.2: connection-specific fields have no meaning in HTTP/2.
fn is_connection_specific(name: &str) -> bool {
    matches!(
        name,
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

fn malformed(message: String) -> Error {
    Error::protocol(ErrorCode::ProtocolError, message)
}

/// Check a header block's structure.
///
/// Pseudo-headers must be known, unique, and precede every regular header.
/// Connection-specific headers are rejected.
pub fn validate_block(headers: &[Header]) -> Result<()> {
    let mut seen_regular = false;
    let mut seen_pseudo: Vec<&str> = Vec::new();

    for header in headers {
        if header.is_pseudo() {
            if seen_regular {
                return Err(malformed(format!(
                    "pseudo-header {} after regular header",
                    header.name
                )));
            }
            if !PSEUDO_HEADERS.contains(&header.name.as_str()) {
                return Err(malformed(format!("unknown pseudo-header {}", header.name)));
            }
            if seen_pseudo.contains(&header.name.as_str()) {
                return Err(malformed(format!("duplicate pseudo-header {}", header.name)));
            }
            seen_pseudo.push(&header.name);
        } else {
            seen_regular = true;
            if header.name.is_empty() || header.name.bytes().any(|b| b.is_ascii_uppercase()) {
                return Err(malformed(format!("invalid header name {:?}", header.name)));
            }
            if is_connection_specific(&header.name) {
                return Err(malformed(format!(
                    "connection-specific header {}",
                    header.name
                )));
            }
        }
    }
    Ok(())
}

/// Append the regular headers from a map, dropping anything HTTP/2 forbids.
fn push_regular(out: &mut Vec<Header>, map: &HeaderMap) {
    for (name, value) in map {
        let name = name.as_str();
        if is_connection_specific(name) || name == "host" {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        // TE is allowed only as "trailers".
        if name == "te" && !value.eq_ignore_ascii_case("trailers") {
            continue;
        }
        out.push(Header::new(name, value));
    }
}

/// Build a request header block from `http` request parts.
///
/// `:authority` comes from the URI, falling back to the Host header.
pub fn request_headers(parts: &http::request::Parts) -> Vec<Header> {
    let uri = &parts.uri;
    let scheme = uri.scheme_str().unwrap_or("https");
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            parts
                .headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/");

    let mut headers = Vec::with_capacity(parts.headers.len() + 4);
    headers.push(Header::new(":method", parts.method.as_str()));
    headers.push(Header::new(":scheme", scheme));
    headers.push(Header::new(":authority", authority));
    headers.push(Header::new(":path", path));
    push_regular(&mut headers, &parts.headers);
    headers
}

/// Build a response header block.
pub fn response_headers(status: StatusCode, map: &HeaderMap) -> Vec<Header> {
    let mut headers = Vec::with_capacity(map.len() + 1);
    headers.push(Header::new(":status", status.as_str()));
    push_regular(&mut headers, map);
    headers
}

/// Extract `:status` from a response header block.
pub fn status(headers: &[Header]) -> Option<StatusCode> {
    headers
        .iter()
        .find(|h| h.name == ":status")
        .and_then(|h| StatusCode::from_bytes(h.value.as_bytes()).ok())
}

/// Look up the first value of a header by (lowercase) name.
pub fn find<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name == name)
        .map(|h| h.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    #[test]
    fn test_name_is_lowercased() {
        let h = Header::new("Content-Type", "text/plain");
        assert_eq!(h.name, "content-type");
        assert_eq!(h.value, "text/plain");
    }

    #[test]
    fn test_request_headers_from_parts() {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("https://example.com/upload?x=1")
            .header("Connection", "keep-alive")
            .header("TE", "gzip")
            .header("X-Custom", "yes")
            .body(())
            .unwrap()
            .into_parts();

        let headers = request_headers(&parts);
        assert_eq!(
            headers[..4],
            [
                Header::new(":method", "POST"),
                Header::new(":scheme", "https"),
                Header::new(":authority", "example.com"),
                Header::new(":path", "/upload?x=1"),
            ]
        );
        assert_eq!(find(&headers, "x-custom"), Some("yes"));
        assert_eq!(find(&headers, "connection"), None);
        assert_eq!(find(&headers, "te"), None);
        assert!(validate_block(&headers).is_ok());
    }

    #[test]
    fn test_response_headers_and_status() {
        let mut map = HeaderMap::new();
        map.insert("content-length", "5".parse().unwrap());
        map.insert("transfer-encoding", "chunked".parse().unwrap());

        let headers = response_headers(StatusCode::NOT_FOUND, &map);
        assert_eq!(headers.len(), 2);
        assert_eq!(status(&headers), Some(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_pseudo_after_regular_rejected() {
        let headers = vec![Header::new("accept", "*/*"), Header::new(":path", "/")];
        assert_eq!(
            validate_block(&headers).unwrap_err().code(),
            ErrorCode::ProtocolError
        );
    }

    #[test]
    fn test_duplicate_and_unknown_pseudo_rejected() {
        let dup = vec![Header::new(":path", "/"), Header::new(":path", "/x")];
        assert!(validate_block(&dup).is_err());

        let unknown = vec![Header::new(":protocol-x", "1")];
        assert!(validate_block(&unknown).is_err());
    }

    #[test]
    fn test_connection_specific_rejected() {
        let headers = vec![Header::new(":status", "200"), Header::new("upgrade", "h2c")];
        assert!(validate_block(&headers).is_err());
    }
}
