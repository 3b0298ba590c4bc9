//! Response adapter handed to handlers

use crate::connection::{SessionFuture, UpgradeSession, UpgradedIo, VirtualConnection};
use crate::error::DispatchError;
use crate::message::{FinishedResponse, ResponseBody, SetCookie};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, SET_COOKIE, UPGRADE,
};
use hyper::StatusCode;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::OnceLock;

/// A protocol switch requested by the handler
pub(crate) struct PendingUpgrade {
    pub protocol: String,
    pub session: UpgradeSession,
}

struct ResponseHead {
    status: StatusCode,
    headers: HeaderMap,
    content_length: Option<u64>,
    trailers: HeaderMap,
    committed: bool,
}

/// Public view of the outbound response
pub struct HttpResponse {
    head: Mutex<ResponseHead>,
    body: OnceLock<ResponseBody>,
    upgrade: Mutex<Option<PendingUpgrade>>,
    buffer_size: usize,
}

impl HttpResponse {
    pub(crate) fn new(buffer_size: usize) -> Self {
        Self {
            head: Mutex::new(ResponseHead {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                content_length: None,
                trailers: HeaderMap::new(),
                committed: false,
            }),
            body: OnceLock::new(),
            upgrade: Mutex::new(None),
            buffer_size,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.head.lock().status
    }

    pub fn set_status(&self, status: StatusCode) {
        self.head.lock().status = status;
    }

    pub fn reason(&self) -> &'static str {
        self.status().canonical_reason().unwrap_or("")
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head
            .lock()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }

    pub fn headers(&self, name: &str) -> Vec<String> {
        self.head
            .lock()
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(String::from)
            .collect()
    }

    pub fn contains_header(&self, name: &str) -> bool {
        self.head.lock().headers.contains_key(name)
    }

    /// Replace any existing values of `name`
    pub fn set_header(&self, name: &str, value: &str) -> Result<(), DispatchError> {
        let (name, value) = parse_header(name, value)?;
        if name == CONTENT_LENGTH {
            let length = value
                .to_str()
                .ok()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| DispatchError::Config(format!("invalid content length {:?}", value)))?;
            self.set_content_length(Some(length));
            return Ok(());
        }
        self.head.lock().headers.insert(name, value);
        Ok(())
    }

    pub fn add_header(&self, name: &str, value: &str) -> Result<(), DispatchError> {
        let (name, value) = parse_header(name, value)?;
        self.head.lock().headers.append(name, value);
        Ok(())
    }

    pub fn remove_header(&self, name: &str) {
        self.head.lock().headers.remove(name);
    }

    pub fn add_cookie(&self, cookie: &SetCookie) -> Result<(), DispatchError> {
        self.add_header(SET_COOKIE.as_str(), &cookie.to_header_value())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.head.lock().content_length
    }

    /// Set the message content length.
    ///
    /// Once the body stream exists this does not reach it; push the new
    /// length with [`ResponseBody::set_content_length`].
    pub fn set_content_length(&self, length: Option<u64>) {
        self.head.lock().content_length = length;
    }

    /// Chunked when no content length is known
    pub fn is_chunked(&self) -> bool {
        self.head.lock().content_length.is_none()
    }

    /// Add a trailer; only valid on chunked responses
    pub fn set_trailer(&self, name: &str, value: &str) -> Result<(), DispatchError> {
        let (name, value) = parse_header(name, value)?;
        let mut head = self.head.lock();
        if head.content_length.is_some() {
            return Err(DispatchError::Config(
                "trailers require a chunked response".to_string(),
            ));
        }
        head.trailers.insert(name, value);
        Ok(())
    }

    /// The body stream, created on first access
    pub fn body(&self) -> &ResponseBody {
        self.body.get_or_init(|| {
            let content_length = self.head.lock().content_length;
            ResponseBody::new(self.buffer_size, content_length)
        })
    }

    pub fn has_buffered_content(&self) -> bool {
        self.body.get().map(|b| b.buffered_len() > 0).unwrap_or(false)
    }

    pub fn is_committed(&self) -> bool {
        self.head.lock().committed
    }

    /// Whether the body stream was opened and closed
    pub fn is_body_closed(&self) -> bool {
        self.body.get().map(|b| b.is_closed()).unwrap_or(false)
    }

    /// Answer with `101 Switching Protocols` to `protocol`.
    ///
    /// After the response is written the raw connection is handed to
    /// `session`. The connection stays counted as active until the session
    /// returns. A `websocket` switch is run as a web connection.
    pub fn switch_protocols<F, Fut>(&self, protocol: &str, session: F) -> Result<(), DispatchError>
    where
        F: FnOnce(UpgradedIo) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.set_header(UPGRADE.as_str(), protocol)?;
        self.set_header(CONNECTION.as_str(), "upgrade")?;
        self.set_status(StatusCode::SWITCHING_PROTOCOLS);
        *self.upgrade.lock() = Some(PendingUpgrade {
            protocol: protocol.to_string(),
            session: Box::new(move |io: UpgradedIo| -> SessionFuture { Box::pin(session(io)) }),
        });
        Ok(())
    }

    pub fn is_upgrade_pending(&self) -> bool {
        self.upgrade.lock().is_some()
    }

    pub(crate) fn take_upgrade(&self) -> Option<PendingUpgrade> {
        self.upgrade.lock().take()
    }

    /// Close the body and hand the finished response to the transport.
    ///
    /// A response is written at most once; later calls return `Ok(())`.
    pub(crate) fn finish(&self, conn: &VirtualConnection) -> Result<(), DispatchError> {
        let length = self.body().content_length();
        let body = match self.body().close() {
            Ok(Some(body)) => body,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.head.lock().committed = true;
                return Err(e.into());
            }
        };

        let response = {
            let mut head = self.head.lock();
            if head.committed {
                return Ok(());
            }
            head.committed = true;
            let mut headers = head.headers.clone();
            if let Some(length) = length {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            }
            let trailers = if length.is_none() && !head.trailers.is_empty() {
                Some(head.trailers.clone())
            } else {
                None
            };
            FinishedResponse {
                status: head.status,
                headers,
                body,
                trailers,
            }
        };

        conn.transport().write_response(conn, response)
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), DispatchError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| DispatchError::Config(format!("invalid header name {:?}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| DispatchError::Config(format!("invalid header value for {}: {}", name, e)))?;
    Ok((name, value))
}
