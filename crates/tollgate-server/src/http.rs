//! HTTP/1.1 message heads as seen by a forward proxy.
//!
//! Heads are parsed with `httparse` into owned values so the connection
//! buffer can be reused while a request is in flight. Bodies are never
//! buffered; [`BodyKind`] tells the copier how a body is delimited.

use std::fmt::Write as _;
use std::net::Ipv6Addr;

use tollgate_core::MAX_HEADER_COUNT;

/// Header names the proxy consumes and never forwards.
pub const PROXY_AUTHORIZATION: &str = "proxy-authorization";
pub const PROXY_CONNECTION: &str = "proxy-connection";

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("malformed head: {0}")]
    Malformed(#[from] httparse::Error),
    #[error("head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("connection closed mid-message")]
    UnexpectedEof,
    #[error("invalid request target: {0}")]
    BadTarget(String),
    #[error("invalid content-length")]
    BadContentLength,
    #[error("unsupported transfer-encoding: {0}")]
    UnsupportedTransferEncoding(String),
    #[error("invalid chunk: {0}")]
    BadChunk(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    /// Read until the peer closes. Only valid for responses.
    UntilClose,
}

/// Common access to a parsed head.
pub trait Head: Sized {
    /// Parse a complete head from the front of `buf`; `None` when more bytes are needed.
    fn parse(buf: &[u8]) -> Result<Option<Self>, HttpError>;

    /// Bytes the head occupied on the wire.
    fn wire_len(&self) -> usize;

    fn headers(&self) -> &[Header];

    /// First value of `name`, compared case-insensitively.
    fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers()
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::trim)
    }

    /// Whether the comma-separated list in `name` contains `token`.
    fn has_token(&self, name: &str, token: &str) -> bool {
        self.headers()
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .filter_map(|h| std::str::from_utf8(&h.value).ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Vec<Header> {
    headers
        .iter()
        .map(|h| Header {
            name: h.name.to_string(),
            value: h.value.to_vec(),
        })
        .collect()
}

fn content_length<H: Head>(head: &H) -> Result<Option<u64>, HttpError> {
    let mut found: Option<u64> = None;
    for h in head.headers() {
        if !h.name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let value = std::str::from_utf8(&h.value)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(HttpError::BadContentLength)?;
        match found {
            Some(prev) if prev != value => return Err(HttpError::BadContentLength),
            _ => found = Some(value),
        }
    }
    Ok(found)
}

/// Final transfer coding, lowercased, when `Transfer-Encoding` is present.
fn final_transfer_coding<H: Head>(head: &H) -> Option<String> {
    head.headers()
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("transfer-encoding"))
        .filter_map(|h| std::str::from_utf8(&h.value).ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .last()
}

/// Request line and headers of a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent: absolute-form, authority-form or origin-form.
    pub target: String,
    /// Minor version: `HTTP/1.{version}`.
    pub version: u8,
    pub headers: Vec<Header>,
    wire_len: usize,
}

impl Head for RequestHead {
    fn parse(buf: &[u8]) -> Result<Option<Self>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };
        Ok(Some(Self {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers: owned_headers(req.headers),
            wire_len: len,
        }))
    }

    fn wire_len(&self) -> usize {
        self.wire_len
    }

    fn headers(&self) -> &[Header] {
        &self.headers
    }
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Remove every `name` header, returning the first value.
    pub fn take_header(&mut self, name: &str) -> Option<Vec<u8>> {
        let mut first = None;
        self.headers.retain_mut(|h| {
            if h.name.eq_ignore_ascii_case(name) {
                if first.is_none() {
                    first = Some(std::mem::take(&mut h.value));
                }
                false
            } else {
                true
            }
        });
        first
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
        self.headers.push(Header {
            name: name.to_string(),
            value: value.into(),
        });
    }

    /// Whether the client wants the connection kept open after this exchange.
    ///
    /// `Proxy-Connection` is honoured for clients that still send it.
    pub fn keep_alive(&self) -> bool {
        for name in ["connection", PROXY_CONNECTION] {
            if self.has_token(name, "close") {
                return false;
            }
            if self.has_token(name, "keep-alive") {
                return true;
            }
        }
        self.version >= 1
    }

    pub fn body_kind(&self) -> Result<BodyKind, HttpError> {
        if let Some(coding) = final_transfer_coding(self) {
            return if coding == "chunked" {
                Ok(BodyKind::Chunked)
            } else {
                Err(HttpError::UnsupportedTransferEncoding(coding))
            };
        }
        Ok(match content_length(self)? {
            Some(0) | None => BodyKind::Empty,
            Some(n) => BodyKind::Length(n),
        })
    }

    /// Body framing for forwarding. A chunked body loses any `Content-Length`
    /// so the upstream sees a single framing header.
    pub fn take_body_kind(&mut self) -> Result<BodyKind, HttpError> {
        let kind = self.body_kind()?;
        if kind == BodyKind::Chunked {
            self.take_header("content-length");
        }
        Ok(kind)
    }

    /// Serialize with `path` as the request target.
    pub fn encode(&self, path: &str) -> Vec<u8> {
        let mut line = String::with_capacity(self.method.len() + path.len() + 12);
        let _ = write!(line, "{} {} HTTP/1.{}\r\n", self.method, path, self.version);
        let mut out = line.into_bytes();
        for h in &self.headers {
            out.extend_from_slice(h.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(&h.value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Status line and headers of an upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub version: u8,
    pub headers: Vec<Header>,
    wire_len: usize,
}

impl Head for ResponseHead {
    fn parse(buf: &[u8]) -> Result<Option<Self>, HttpError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut resp = httparse::Response::new(&mut headers);
        let len = match resp.parse(buf)? {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };
        Ok(Some(Self {
            status: resp.code.unwrap_or_default(),
            version: resp.version.unwrap_or(1),
            headers: owned_headers(resp.headers),
            wire_len: len,
        }))
    }

    fn wire_len(&self) -> usize {
        self.wire_len
    }

    fn headers(&self) -> &[Header] {
        &self.headers
    }
}

impl ResponseHead {
    /// 1xx other than `101 Switching Protocols`.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn keep_alive(&self) -> bool {
        if self.has_token("connection", "close") {
            return false;
        }
        self.version >= 1 || self.has_token("connection", "keep-alive")
    }

    /// Body framing of a response to a `request_method` request.
    pub fn body_kind(&self, request_method: &str) -> Result<BodyKind, HttpError> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyKind::Empty);
        }
        if let Some(coding) = final_transfer_coding(self) {
            return Ok(if coding == "chunked" {
                BodyKind::Chunked
            } else {
                BodyKind::UntilClose
            });
        }
        Ok(match content_length(self)? {
            Some(0) => BodyKind::Empty,
            Some(n) => BodyKind::Length(n),
            None => BodyKind::UntilClose,
        })
    }
}

/// Split `host[:port]` (IPv6 literals in brackets), defaulting the port.
pub fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16), HttpError> {
    let bad = || HttpError::BadTarget(authority.to_string());
    let authority = authority.trim();

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
        host.parse::<Ipv6Addr>().map_err(|_| bad())?;
        let port = match tail {
            "" => None,
            t => Some(t.strip_prefix(':').ok_or_else(bad)?),
        };
        (host, port)
    } else if authority.parse::<Ipv6Addr>().is_ok() {
        (authority, None)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty()
        || host
            .bytes()
            .any(|b| b.is_ascii_whitespace() || matches!(b, b'/' | b'@' | b'?' | b'#'))
    {
        return Err(bad());
    }
    let port = match port {
        None => default_port,
        Some(p) => p.parse::<u16>().ok().filter(|p| *p != 0).ok_or_else(bad)?,
    };
    Ok((host.to_string(), port))
}

/// Format `host:port`, bracketing IPv6 literals.
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Upstream of a plain HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
    /// Origin-form target sent upstream.
    pub path: String,
}

impl ForwardTarget {
    /// Resolve from an absolute-form target, or from `Host` for origin-form.
    pub fn from_request(head: &RequestHead) -> Result<Self, HttpError> {
        let target = head.target.as_str();

        if target.starts_with('/') {
            let host = head
                .header_str("host")
                .ok_or_else(|| HttpError::BadTarget(target.to_string()))?;
            let (host, port) = parse_authority(host, 80)?;
            return Ok(Self {
                host,
                port,
                path: target.to_string(),
            });
        }

        let rest = target
            .get(..7)
            .filter(|scheme| scheme.eq_ignore_ascii_case("http://"))
            .map(|_| &target[7..])
            .ok_or_else(|| HttpError::BadTarget(target.to_string()))?;

        let split = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (authority, path) = rest.split_at(split);
        let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
        let (host, port) = parse_authority(authority, 80)?;

        let path = match path {
            "" => "/".to_string(),
            p if p.starts_with('/') => p.to_string(),
            p => format!("/{p}"),
        };
        let path = match path.find('#') {
            Some(i) => path[..i].to_string(),
            None => path,
        };

        Ok(Self { host, port, path })
    }

    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port)
    }

    /// `Host` header value: the port is omitted when it is the default.
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            if self.host.contains(':') {
                format!("[{}]", self.host)
            } else {
                self.host.clone()
            }
        } else {
            self.authority()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(raw: &str) -> RequestHead {
        RequestHead::parse(raw.as_bytes()).unwrap().unwrap()
    }

    fn resp(raw: &str) -> ResponseHead {
        ResponseHead::parse(raw.as_bytes()).unwrap().unwrap()
    }

    #[test]
    fn parses_connect_request() {
        let raw = "CONNECT example.com:443 HTTP/1.1\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\nleftover";
        let head = req(raw);
        assert!(head.is_connect());
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.wire_len(), raw.len() - "leftover".len());
        assert_eq!(
            head.header_str("PROXY-AUTHORIZATION"),
            Some("Basic dXNlcjpwYXNz")
        );
    }

    #[test]
    fn partial_head_needs_more() {
        assert!(
            RequestHead::parse(b"GET http://a/ HTTP/1.1\r\nHost: a\r\n")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            RequestHead::parse(b"\x16\x03\x01\x02\x00 junk\r\n\r\n"),
            Err(HttpError::Malformed(_))
        ));
    }

    #[test]
    fn take_header_removes_all_copies() {
        let mut head = req(
            "GET http://a/ HTTP/1.1\r\nProxy-Authorization: one\r\nHost: a\r\nproxy-authorization: two\r\n\r\n",
        );
        assert_eq!(head.take_header(PROXY_AUTHORIZATION), Some(b"one".to_vec()));
        assert!(head.header(PROXY_AUTHORIZATION).is_none());
        assert_eq!(head.headers.len(), 1);
    }

    #[test]
    fn keep_alive_rules() {
        assert!(req("GET / HTTP/1.1\r\nHost: a\r\n\r\n").keep_alive());
        assert!(!req("GET / HTTP/1.1\r\nConnection: close\r\n\r\n").keep_alive());
        assert!(!req("GET / HTTP/1.0\r\n\r\n").keep_alive());
        assert!(req("GET / HTTP/1.0\r\nProxy-Connection: Keep-Alive\r\n\r\n").keep_alive());
        assert!(!resp("HTTP/1.1 200 OK\r\nConnection: upgrade, close\r\n\r\n").keep_alive());
    }

    #[test]
    fn request_body_framing() {
        assert_eq!(
            req("GET / HTTP/1.1\r\n\r\n").body_kind().unwrap(),
            BodyKind::Empty
        );
        assert_eq!(
            req("POST / HTTP/1.1\r\nContent-Length: 12\r\n\r\n")
                .body_kind()
                .unwrap(),
            BodyKind::Length(12)
        );
        assert_eq!(
            req("POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n")
                .body_kind()
                .unwrap(),
            BodyKind::Chunked
        );
        assert!(
            req("POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\n")
                .body_kind()
                .is_err()
        );
        assert!(
            req("POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n")
                .body_kind()
                .is_err()
        );
    }

    #[test]
    fn chunked_body_drops_content_length() {
        let mut head = req(
            "POST http://a/ HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert_eq!(head.take_body_kind().unwrap(), BodyKind::Chunked);
        assert!(head.header("content-length").is_none());

        let encoded = String::from_utf8(head.encode("/")).unwrap();
        assert!(encoded.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!encoded.to_ascii_lowercase().contains("content-length"));

        let mut head = req("POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n");
        assert_eq!(head.take_body_kind().unwrap(), BodyKind::Length(5));
        assert_eq!(head.header_str("content-length"), Some("5"));
    }

    #[test]
    fn response_body_framing() {
        let ok = resp("HTTP/1.1 200 OK\r\nContent-Length: 500\r\n\r\n");
        assert_eq!(ok.body_kind("GET").unwrap(), BodyKind::Length(500));
        assert_eq!(ok.body_kind("HEAD").unwrap(), BodyKind::Empty);
        assert_eq!(
            resp("HTTP/1.1 204 No Content\r\n\r\n")
                .body_kind("GET")
                .unwrap(),
            BodyKind::Empty
        );
        assert_eq!(
            resp("HTTP/1.0 200 OK\r\n\r\n").body_kind("GET").unwrap(),
            BodyKind::UntilClose
        );
        assert!(resp("HTTP/1.1 100 Continue\r\n\r\n").is_interim());
        assert!(!resp("HTTP/1.1 101 Switching Protocols\r\n\r\n").is_interim());
    }

    #[test]
    fn authority_forms() {
        assert_eq!(
            parse_authority("example.com:443", 80).unwrap(),
            ("example.com".into(), 443)
        );
        assert_eq!(
            parse_authority("example.com", 443).unwrap(),
            ("example.com".into(), 443)
        );
        assert_eq!(
            parse_authority("[::1]:8443", 443).unwrap(),
            ("::1".into(), 8443)
        );
        assert_eq!(parse_authority("::1", 443).unwrap(), ("::1".into(), 443));
        assert!(parse_authority("example.com:0", 443).is_err());
        assert!(parse_authority("example.com:http", 443).is_err());
        assert!(parse_authority("", 443).is_err());
        assert!(parse_authority("a b:80", 443).is_err());
        assert_eq!(format_authority("::1", 443), "[::1]:443");
    }

    #[test]
    fn absolute_form_target() {
        let head = req("GET http://user@Example.com:8080/x?y=1#frag HTTP/1.1\r\n\r\n");
        let target = ForwardTarget::from_request(&head).unwrap();
        assert_eq!(target.host, "Example.com");
        assert_eq!(target.port, 8080);
        assert_eq!(target.path, "/x?y=1");
        assert_eq!(target.host_header(), "Example.com:8080");

        let bare = ForwardTarget::from_request(&req("GET http://example.com HTTP/1.1\r\n\r\n"))
            .unwrap();
        assert_eq!(bare.path, "/");
        assert_eq!(bare.port, 80);
        assert_eq!(bare.host_header(), "example.com");
    }

    #[test]
    fn origin_form_uses_host_header() {
        let head = req("GET /status HTTP/1.1\r\nHost: internal:81\r\n\r\n");
        let target = ForwardTarget::from_request(&head).unwrap();
        assert_eq!(target.authority(), "internal:81");
        assert_eq!(target.path, "/status");
        assert!(ForwardTarget::from_request(&req("GET /status HTTP/1.1\r\n\r\n")).is_err());
        assert!(
            ForwardTarget::from_request(&req("GET https://a/ HTTP/1.1\r\n\r\n")).is_err()
        );
    }

    #[test]
    fn encode_uses_given_path() {
        let head = req("GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n");
        assert_eq!(
            head.encode("/x"),
            b"GET /x HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n".to_vec()
        );
    }
}
