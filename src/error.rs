//! Error taxonomy and synthesized HTML error pages for the dispatcher

use hyper::StatusCode;
use std::io;
use thiserror::Error;

/// Minimum size of a padded 404 body. Some browsers replace shorter
/// error bodies with their own "friendly" page.
pub const MIN_NOT_FOUND_BODY_LEN: usize = 513;

/// Errors produced while dispatching a request over a link
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No virtual host matched the requested host and port
    #[error("no virtual host for {host}:{port} on endpoint {endpoint}")]
    NoVirtualHost {
        endpoint: String,
        host: String,
        port: u16,
    },

    /// A virtual host matched but no handler is registered for the URL
    #[error("no handler registered for {url} on virtual host {virtual_host}")]
    NoHandler { virtual_host: String, url: String },

    /// The handler returned an error
    #[error("handler failed: {0}")]
    Handler(String),

    /// The handler panicked
    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    /// No executor is available to run the handler
    #[error("no executor available to dispatch work")]
    ExecutorUnavailable,

    /// Reading or closing a body stream failed
    #[error("stream error: {0}")]
    Io(#[from] io::Error),

    /// The connection was already torn down
    #[error("connection {0} is closed")]
    ConnectionClosed(u64),

    /// A channel operation was not valid in its current lifecycle state
    #[error("channel {channel} cannot {operation} while {state}")]
    InvalidLifecycle {
        channel: String,
        operation: &'static str,
        state: &'static str,
    },

    /// A connection mode change that is not an edge of the mode state machine
    #[error("invalid upgrade from {from} to {to}")]
    InvalidUpgrade {
        from: &'static str,
        to: &'static str,
    },

    /// The transport has no raw connection to hand over for an upgrade
    #[error("connection {0} cannot be upgraded")]
    UpgradeUnavailable(u64),

    /// Invalid dispatcher configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Status code a synthesized response uses for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::NoVirtualHost { .. } | DispatchError::NoHandler { .. } => {
                StatusCode::NOT_FOUND
            }
            DispatchError::ExecutorUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert a panic payload into an error
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        DispatchError::HandlerPanic(message)
    }
}

/// A synthesized HTML error page
#[derive(Debug, Clone)]
pub struct ErrorPage {
    status: StatusCode,
    detail: Option<String>,
    address: Option<String>,
    pad: bool,
}

impl ErrorPage {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            detail: None,
            address: None,
            pad: false,
        }
    }

    /// Detail text shown below the status line (escaped when rendered)
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// host:port diagnostic line
    pub fn with_address(mut self, host: &str, port: u16) -> Self {
        self.address = Some(format!("{}:{}", host, port));
        self
    }

    /// Pad short 404 bodies
    pub fn with_padding(mut self, pad: bool) -> Self {
        self.pad = pad;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Render the page as UTF-8 HTML
    pub fn render(&self) -> String {
        let reason = self.status.canonical_reason().unwrap_or("Error");
        let mut body = String::with_capacity(MIN_NOT_FOUND_BODY_LEN);
        body.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<title>");
        body.push_str(&format!("{} {}", self.status.as_u16(), reason));
        body.push_str("</title>\n</head>\n<body>\n<h1>");
        body.push_str(&format!("Error {}: {}", self.status.as_u16(), reason));
        body.push_str("</h1>\n");
        if let Some(detail) = &self.detail {
            body.push_str("<p>");
            body.push_str(&escape_html(detail));
            body.push_str("</p>\n");
        }
        if let Some(address) = &self.address {
            body.push_str("<p>Host: ");
            body.push_str(&escape_html(address));
            body.push_str("</p>\n");
        }
        body.push_str("</body>\n</html>\n");

        if self.pad && self.status == StatusCode::NOT_FOUND {
            pad_body(&mut body);
        }
        body
    }
}

/// Append an HTML comment until the body reaches [`MIN_NOT_FOUND_BODY_LEN`]
pub fn pad_body(body: &mut String) {
    const OPEN: &str = "<!--\n";
    const CLOSE: &str = "\n-->\n";
    const FILL: &str = "Padding so that browsers display this page. ";

    if body.len() >= MIN_NOT_FOUND_BODY_LEN {
        return;
    }
    body.push_str(OPEN);
    let target = MIN_NOT_FOUND_BODY_LEN - CLOSE.len();
    while body.len() < target {
        let remaining = target - body.len();
        if remaining >= FILL.len() {
            body.push_str(FILL);
        } else {
            body.push_str(&FILL[..remaining]);
        }
    }
    body.push_str(CLOSE);
}

/// Escape text for inclusion in HTML element content
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let err = DispatchError::NoVirtualHost {
            endpoint: "http".into(),
            host: "example.com".into(),
            port: 80,
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            DispatchError::ExecutorUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            DispatchError::Handler("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            DispatchError::HandlerPanic("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_from_panic_payloads() {
        let err = DispatchError::from_panic(Box::new("static message"));
        assert_eq!(err.to_string(), "handler panicked: static message");

        let err = DispatchError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err.to_string(), "handler panicked: owned");

        let err = DispatchError::from_panic(Box::new(42u32));
        assert_eq!(err.to_string(), "handler panicked: unknown panic payload");
    }

    #[test]
    fn test_render_contains_status_and_detail() {
        let page = ErrorPage::new(StatusCode::INTERNAL_SERVER_ERROR)
            .with_detail("handler <failed>")
            .render();
        assert!(page.starts_with("<!DOCTYPE html>"));
        assert!(page.contains("<title>500 Internal Server Error</title>"));
        assert!(page.contains("handler &lt;failed&gt;"));
        assert!(!page.contains("Host:"));
    }

    #[test]
    fn test_render_with_address() {
        let page = ErrorPage::new(StatusCode::NOT_FOUND)
            .with_address("example.com", 8080)
            .render();
        assert!(page.contains("<p>Host: example.com:8080</p>"));
    }

    #[test]
    fn test_short_not_found_is_padded() {
        let page = ErrorPage::new(StatusCode::NOT_FOUND)
            .with_detail("/missing")
            .with_padding(true)
            .render();
        assert!(page.len() >= MIN_NOT_FOUND_BODY_LEN);
        assert!(page.contains("<!--"));
        assert!(page.trim_end().ends_with("-->"));
    }

    #[test]
    fn test_padding_only_applies_to_not_found() {
        let page = ErrorPage::new(StatusCode::SERVICE_UNAVAILABLE)
            .with_padding(true)
            .render();
        assert!(page.len() < MIN_NOT_FOUND_BODY_LEN);
        assert!(!page.contains("<!--"));
    }

    #[test]
    fn test_long_body_is_not_padded() {
        let detail = "x".repeat(MIN_NOT_FOUND_BODY_LEN);
        let page = ErrorPage::new(StatusCode::NOT_FOUND)
            .with_detail(detail)
            .with_padding(true)
            .render();
        assert!(!page.contains("<!--"));
    }

    #[test]
    fn test_pad_body_reaches_minimum_exactly() {
        let mut body = String::from("short");
        pad_body(&mut body);
        assert_eq!(body.len(), MIN_NOT_FOUND_BODY_LEN);

        let mut body = "y".repeat(600);
        pad_body(&mut body);
        assert_eq!(body.len(), 600);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;"
        );
    }
}
