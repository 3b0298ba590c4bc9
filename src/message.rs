//! Wire-level HTTP messages and body streams
//!
//! These are the transport's view of an exchange. The [`HttpRequest`] and
//! [`HttpResponse`] adapters wrap them for handlers.
//!
//! [`HttpRequest`]: crate::request::HttpRequest
//! [`HttpResponse`]: crate::response::HttpResponse

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, COOKIE, TRAILER, TRANSFER_ENCODING};
use hyper::{Method, StatusCode, Uri, Version};
use parking_lot::Mutex;
use std::io;

/// An inbound request as received from the transport
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Body bytes, or the transport error that interrupted reading them
    pub body: Result<Bytes, String>,
    /// Trailers, once fully received
    pub trailers: Option<HeaderMap>,
}

impl WireRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Ok(Bytes::new()),
            trailers: None,
        }
    }

    /// Shorthand for a GET request (used heavily by tests)
    pub fn get(uri: &str) -> Self {
        Self::new(Method::GET, uri.parse().unwrap_or_else(|_| Uri::from_static("/")))
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.append(HeaderName::from_static(name), value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Ok(body.into());
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_trailers(mut self, trailers: HeaderMap) -> Self {
        self.trailers = Some(trailers);
        self
    }

    /// Declared Content-Length, if any
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the body uses chunked transfer encoding
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    /// Whether the client announced trailers on a chunked body
    pub fn expects_trailers(&self) -> bool {
        self.is_chunked() && self.headers.contains_key(TRAILER)
    }

    /// Request cookies, in header order
    pub fn cookies(&self) -> Vec<Cookie> {
        self.headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Cookie::parse_header)
            .collect()
    }
}

/// A request cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse a `Cookie:` header value (`a=1; b=2`)
    pub fn parse_header(value: &str) -> Vec<Cookie> {
        value
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                let value = value.trim().trim_matches('"');
                Some(Cookie::new(name, value))
            })
            .collect()
    }
}

/// A `Set-Cookie` entry on a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            max_age: None,
            secure: false,
            http_only: false,
        }
    }

    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={}", max_age));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

/// A completed response handed back to the transport
#[derive(Debug, Clone)]
pub struct FinishedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub trailers: Option<HeaderMap>,
}

impl FinishedResponse {
    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("")
    }
}

struct RequestBodyState {
    data: Bytes,
    position: usize,
    closed: bool,
}

/// Input stream over a request body
pub struct RequestBody {
    state: Mutex<RequestBodyState>,
    failure: Option<String>,
    content_length: Option<u64>,
}

impl RequestBody {
    pub(crate) fn new(body: &Result<Bytes, String>, content_length: Option<u64>) -> Self {
        let (data, failure) = match body {
            Ok(data) => (data.clone(), None),
            Err(e) => (Bytes::new(), Some(e.clone())),
        };
        Self {
            state: Mutex::new(RequestBodyState {
                data,
                position: 0,
                closed: false,
            }),
            failure,
            content_length,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Read into `buf`, returning 0 at end of body
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(failure) = &self.failure {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, failure.clone()));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "request body is closed"));
        }
        let remaining = &state.data[state.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        state.position += n;
        Ok(n)
    }

    /// Read everything that has not been read yet
    pub fn read_to_end(&self) -> io::Result<Bytes> {
        if let Some(failure) = &self.failure {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, failure.clone()));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "request body is closed"));
        }
        let rest = state.data.slice(state.position..);
        state.position = state.data.len();
        Ok(rest)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the stream; reports a body that never fully arrived
    pub fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        match &self.failure {
            Some(failure) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("request body incomplete: {}", failure),
            )),
            None => Ok(()),
        }
    }
}

struct ResponseBodyState {
    buffer: Vec<u8>,
    content_length: Option<u64>,
    closed: bool,
}

/// Output stream for a response body
pub struct ResponseBody {
    state: Mutex<ResponseBodyState>,
}

impl ResponseBody {
    pub(crate) fn new(capacity: usize, content_length: Option<u64>) -> Self {
        Self {
            state: Mutex::new(ResponseBodyState {
                buffer: Vec::with_capacity(capacity),
                content_length,
                closed: false,
            }),
        }
    }

    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "response body is closed"));
        }
        if let Some(limit) = state.content_length {
            if (state.buffer.len() + data.len()) as u64 > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("write exceeds content length {}", limit),
                ));
            }
        }
        state.buffer.extend_from_slice(data);
        Ok(())
    }

    pub fn write_str(&self, data: &str) -> io::Result<()> {
        self.write(data.as_bytes())
    }

    /// Push a content length into the stream
    pub fn set_content_length(&self, content_length: Option<u64>) {
        self.state.lock().content_length = content_length;
    }

    pub fn content_length(&self) -> Option<u64> {
        self.state.lock().content_length
    }

    pub fn buffered_len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Drop anything written so far
    pub fn reset(&self) {
        self.state.lock().buffer.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the stream and take the buffered bytes.
    ///
    /// Returns `Ok(None)` if the stream was already closed.
    pub(crate) fn close(&self) -> io::Result<Option<Bytes>> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(None);
        }
        state.closed = true;
        let data = Bytes::from(std::mem::take(&mut state.buffer));
        if let Some(expected) = state.content_length {
            if data.len() as u64 != expected {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "response body has {} bytes but content length is {}",
                        data.len(),
                        expected
                    ),
                ));
            }
        }
        Ok(Some(data))
    }
}
