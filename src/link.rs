//! Per-connection dispatch link
//!
//! A [`DispatchLink`] mediates between the transport and the application for
//! one connection (or one HTTP/2 stream). It resolves the virtual host,
//! dispatches the handler on an executor, synthesizes error responses and
//! tears the connection down exactly once.
//!
//! Teardown can be driven from several directions at the same time: the
//! handler finishing, the transport destroying the link after a disconnect,
//! or an upgraded protocol handler closing its own connection. Three atomics
//! keep the outcome deterministic:
//!
//! * `state` moves `Open -> Closing -> Closed` by compare-and-swap, so only
//!   one close reaches the transport.
//! * `count` moves `Untracked -> Held -> Released`, so the channel's active
//!   count goes up once on `ready` and down once on whichever teardown path
//!   gets there first.
//! * `web_conn_can_close` decides whether the container or an upgraded web
//!   connection performs the close.

use crate::channel::DispatchChannel;
use crate::classify::Executor;
use crate::connection::{ConnectionMode, TlsInfo, UpgradedConnection, VirtualConnection};
use crate::error::{pad_body, DispatchError, ErrorPage};
use crate::host::TrustCache;
use crate::request::HttpRequest;
use crate::response::{HttpResponse, PendingUpgrade};
use crate::vhost::{RequestHandler, WelcomePage};
use hyper::header::UPGRADE;
use hyper::StatusCode;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

const COUNT_UNTRACKED: u8 = 0;
const COUNT_HELD: u8 = 1;
const COUNT_RELEASED: u8 = 2;

const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";

/// What `ready` did with the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler was submitted to an executor
    Dispatched,
    /// The built-in landing page was served
    WelcomePage,
    /// A 404 was served
    NotFound,
    /// No executor could take the work; a 503 was served
    Unavailable,
    /// The link was torn down before it became ready; nothing was sent
    Closed,
}

/// Per-connection state holder
pub struct DispatchLink {
    id: u64,
    channel: Arc<DispatchChannel>,
    endpoint: String,
    buffer_size: usize,
    connection: Weak<VirtualConnection>,
    request: Mutex<Option<Arc<HttpRequest>>>,
    response: Mutex<Option<Arc<HttpResponse>>>,
    tls: Mutex<Option<TlsInfo>>,
    trust_cache: Arc<TrustCache>,
    ready: AtomicBool,
    state: AtomicU8,
    count: AtomicU8,
    web_conn_can_close: AtomicBool,
}

impl DispatchLink {
    /// Initialise a link with the request and response adapters for `conn`
    pub(crate) fn new(channel: Arc<DispatchChannel>, conn: &Arc<VirtualConnection>) -> Arc<Self> {
        let config = channel.config();
        let buffer_size = channel.buffer_size();
        let trust_cache = Arc::new(TrustCache::new());
        let info = conn.info().clone();
        let request = conn.take_request().map(|message| {
            Arc::new(HttpRequest::new(
                message,
                info.clone(),
                Arc::clone(&channel.settings().trust),
                Arc::clone(&trust_cache),
            ))
        });
        if request.is_none() {
            warn!(connection = conn.id(), "Link created for a connection without a request");
        }

        Arc::new(Self {
            id: conn.id(),
            channel,
            endpoint: config.endpoint.clone(),
            buffer_size,
            connection: Arc::downgrade(conn),
            request: Mutex::new(request),
            response: Mutex::new(Some(Arc::new(HttpResponse::new(buffer_size)))),
            tls: Mutex::new(info.tls),
            trust_cache,
            ready: AtomicBool::new(false),
            state: AtomicU8::new(STATE_OPEN),
            count: AtomicU8::new(COUNT_UNTRACKED),
            web_conn_can_close: AtomicBool::new(true),
        })
    }

    /// Identifier of the underlying connection
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &Arc<DispatchChannel> {
        &self.channel
    }

    /// Endpoint captured from the channel configuration at creation
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn request(&self) -> Option<Arc<HttpRequest>> {
        self.request.lock().clone()
    }

    pub fn response(&self) -> Option<Arc<HttpResponse>> {
        self.response.lock().clone()
    }

    /// TLS details of the connection; dropped on destroy
    pub fn tls_info(&self) -> Option<TlsInfo> {
        self.tls.lock().clone()
    }

    pub fn is_secure(&self) -> bool {
        self.tls.lock().is_some()
    }

    pub fn connection(&self) -> Option<Arc<VirtualConnection>> {
        self.connection.upgrade()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Whether this link currently holds one of the channel's active counts
    pub fn holds_active_count(&self) -> bool {
        self.count.load(Ordering::SeqCst) == COUNT_HELD
    }

    /// The transport finished the handshake: route and dispatch the request
    pub fn ready(self: &Arc<Self>) -> DispatchOutcome {
        self.ready.store(true, Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) == STATE_OPEN {
            *self.response.lock() = Some(Arc::new(HttpResponse::new(self.buffer_size)));
        }
        if self
            .count
            .compare_exchange(COUNT_UNTRACKED, COUNT_HELD, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.channel.increment_active_conns();
        }
        if self.state.load(Ordering::SeqCst) != STATE_OPEN {
            debug!(link = self.id, "Link already closed; not dispatching");
            self.release_count();
            return DispatchOutcome::Closed;
        }

        let settings = Arc::clone(self.channel.settings());

        let Some(virtual_host) = settings.resolver.find_virtual_host(&self.endpoint, self) else {
            let url = self.request_url();
            debug!(
                link = self.id,
                endpoint = %self.endpoint,
                url = %url,
                "No virtual host for request"
            );
            if settings.welcome_page_enabled {
                self.send_page(StatusCode::NOT_FOUND, WelcomePage::not_found_page(&url));
            } else {
                self.send_response(StatusCode::NOT_FOUND, Some(&url), false);
            }
            return DispatchOutcome::NotFound;
        };

        let Some(handler) = virtual_host.discriminate(self) else {
            let url = self.request_url();
            debug!(
                link = self.id,
                virtual_host = virtual_host.name(),
                url = %url,
                "No handler for request"
            );
            if settings.welcome_page_enabled {
                let is_root = self.request().map(|r| r.path() == "/").unwrap_or(false);
                if is_root {
                    self.send_page(StatusCode::OK, WelcomePage::landing_page());
                    return DispatchOutcome::WelcomePage;
                }
                self.send_page(StatusCode::NOT_FOUND, WelcomePage::not_found_page(&url));
            } else {
                self.send_response(StatusCode::NOT_FOUND, Some(&url), settings.verbose_not_found);
            }
            return DispatchOutcome::NotFound;
        };

        let Some(executor) = self.select_executor() else {
            warn!(link = self.id, "No executor available; rejecting request");
            self.send_response(StatusCode::SERVICE_UNAVAILABLE, None, false);
            return DispatchOutcome::Unavailable;
        };

        debug!(
            link = self.id,
            virtual_host = virtual_host.name(),
            executor = executor.name(),
            "Dispatching request"
        );
        let link = Arc::clone(self);
        executor.execute(Box::new(move || link.wrap_handler_and_execute(handler)));
        DispatchOutcome::Dispatched
    }

    /// Classified executor for the request, else the default one
    fn select_executor(&self) -> Option<Arc<dyn Executor>> {
        let settings = self.channel.settings();
        if let (Some(classifier), Some(request)) = (&settings.classifier, self.request()) {
            if let Some(executor) = classifier.classify(&request, self) {
                return Some(executor);
            }
        }
        settings.executor.clone()
    }

    /// Run `handler` and complete the exchange.
    ///
    /// Errors and panics from the handler never escape. They turn into a
    /// 500 while the link is still ready, and the link's active count is
    /// released in any case.
    pub fn wrap_handler_and_execute(self: &Arc<Self>, handler: Arc<dyn RequestHandler>) {
        let (Some(request), Some(response)) = (self.request(), self.response()) else {
            debug!(link = self.id, "Link destroyed before its handler ran");
            self.release_count();
            return;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&request, &response)));
        let failure = match result {
            Ok(Ok(())) => response
                .take_upgrade()
                .and_then(|pending| self.start_upgrade(&response, pending).err()),
            Ok(Err(e)) => Some(e),
            Err(payload) => Some(DispatchError::from_panic(payload)),
        };

        match failure {
            None => self.finish(None),
            Some(e) => {
                error!(link = self.id, url = %request.path(), error = %e, "Handler failed");
                if self.is_ready() {
                    self.send_response(StatusCode::INTERNAL_SERVER_ERROR, None, false);
                }
                self.release_count();
            }
        }
    }

    /// Close the body streams, then the connection.
    ///
    /// The first failure (the one passed in, else the request body's, else
    /// the response's) is handed to [`close`](Self::close).
    pub fn finish(&self, failure: Option<DispatchError>) {
        let mut failure = failure;

        if let Some(request) = self.request() {
            if let Err(e) = request.close_body() {
                warn!(link = self.id, error = %e, "Failed to close request body");
                if failure.is_none() {
                    failure = Some(e.into());
                }
            }
        }

        if let (Some(response), Some(conn)) = (self.response(), self.connection()) {
            if let Err(e) = response.finish(&conn) {
                warn!(link = self.id, error = %e, "Failed to complete response");
                if failure.is_none() {
                    failure = Some(e);
                }
            }
        }

        self.close(failure.as_ref());
    }

    /// Idempotent terminal close
    pub fn close(&self, failure: Option<&DispatchError>) {
        let Some(conn) = self.connection().filter(|c| c.is_attached()) else {
            // Transport already discarded its state: nothing left to close
            self.state.store(STATE_CLOSED, Ordering::SeqCst);
            self.release_count();
            return;
        };

        if conn.claim_stream_close() {
            debug!(link = self.id, "Closing streams of container-upgraded connection");
            self.close_streams(&conn);
            return;
        }

        if conn.mode() == ConnectionMode::UpgradedWebConnection
            && self
                .web_conn_can_close
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            debug!(link = self.id, "Upgraded connection already closing");
            return;
        }

        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Closed elsewhere; a count taken by a late ready is still ours to drop
            self.release_count();
            return;
        }

        if self.channel.is_immediate_stop() {
            debug!(link = self.id, "Channel stopped; skipping transport close");
        } else {
            conn.transport().close(&conn, failure);
        }
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.release_count();
    }

    fn close_streams(&self, conn: &VirtualConnection) {
        if let Some(request) = self.request() {
            if let Err(e) = request.close_body() {
                warn!(link = self.id, error = %e, "Failed to close request body");
            }
        }
        if let Some(response) = self.response() {
            if let Err(e) = response.finish(conn) {
                warn!(link = self.id, error = %e, "Failed to close response body");
            }
        }
    }

    /// The transport tore the connection down.
    ///
    /// For upgrades other than HTTP/2 the registered upgraded connection is
    /// closed and the active count stays held until the following `close`.
    /// Adapters are released in every case.
    pub fn destroy(&self, failure: Option<&DispatchError>) {
        self.ready.store(false, Ordering::SeqCst);
        let conn = self.connection();
        let mode = conn.as_ref().map(|c| c.mode()).unwrap_or(ConnectionMode::Plain);
        debug!(
            link = self.id,
            mode = %mode,
            failure = ?failure,
            "Destroying link"
        );

        if mode.is_non_http2_upgrade() {
            if let Some(upgraded) = conn.as_ref().and_then(|c| c.take_upgraded()) {
                upgraded.close();
            }
        } else {
            self.state.store(STATE_CLOSED, Ordering::SeqCst);
            self.release_count();
        }

        self.request.lock().take();
        self.response.lock().take();
        self.tls.lock().take();
        self.trust_cache.clear();
    }

    /// Move the connection to an upgraded mode
    pub fn upgrade(
        &self,
        mode: ConnectionMode,
        upgraded: Option<Arc<dyn UpgradedConnection>>,
    ) -> Result<(), DispatchError> {
        let conn = self.connection().ok_or(DispatchError::ConnectionClosed(self.id))?;
        conn.set_mode(mode)?;
        if let Some(upgraded) = upgraded {
            conn.register_upgraded(upgraded);
        }
        debug!(link = self.id, mode = %mode, "Connection upgraded");
        Ok(())
    }

    /// Hand the connection to the transport for a protocol switch.
    ///
    /// The next close only closes the streams, so the active count stays
    /// held until the transport closes the link when the session ends.
    fn start_upgrade(&self, response: &HttpResponse, pending: PendingUpgrade) -> Result<(), DispatchError> {
        let PendingUpgrade { protocol, session } = pending;
        let mode = if protocol.eq_ignore_ascii_case("websocket") {
            ConnectionMode::UpgradedWebConnection
        } else {
            ConnectionMode::UpgradedGeneric
        };
        let result = self
            .connection()
            .ok_or(DispatchError::ConnectionClosed(self.id))
            .and_then(|conn| {
                conn.set_mode(mode)?;
                let upgraded = conn.transport().upgrade(&conn, session)?;
                conn.register_upgraded(upgraded);
                conn.request_stream_close();
                Ok(())
            });
        match &result {
            Ok(()) => debug!(link = self.id, mode = %mode, protocol = %protocol, "Switching protocols"),
            Err(e) => {
                warn!(link = self.id, protocol = %protocol, error = %e, "Protocol switch failed");
                response.remove_header(UPGRADE.as_str());
            }
        }
        result
    }

    /// Synthesize an HTML error response and finish the exchange.
    ///
    /// The body is only written when the handler has not buffered anything.
    pub fn send_response(&self, status: StatusCode, detail: Option<&str>, add_address: bool) {
        let mut page = ErrorPage::new(status).with_padding(self.channel.settings().pad_not_found_body);
        if let Some(detail) = detail {
            page = page.with_detail(detail);
        }
        if add_address {
            if let Some(request) = self.request() {
                page = page.with_address(&request.requested_host(), request.requested_port());
            }
        }
        self.write_synthesized(status, page.render());
        self.finish(None);
    }

    fn send_page(&self, status: StatusCode, mut body: String) {
        if status == StatusCode::NOT_FOUND && self.channel.settings().pad_not_found_body {
            pad_body(&mut body);
        }
        self.write_synthesized(status, body);
        self.finish(None);
    }

    fn write_synthesized(&self, status: StatusCode, body: String) {
        let Some(response) = self.response() else {
            debug!(link = self.id, status = status.as_u16(), "No response to write; link destroyed");
            return;
        };
        if let Err(e) = self.prepare_synthesized(&response, status, &body) {
            warn!(link = self.id, status = status.as_u16(), error = %e, "Failed to build response");
        }
    }

    fn prepare_synthesized(
        &self,
        response: &HttpResponse,
        status: StatusCode,
        body: &str,
    ) -> Result<(), DispatchError> {
        response.set_status(status);
        response.set_header("connection", "close")?;
        response.set_header("content-type", HTML_CONTENT_TYPE)?;
        if self.is_secure() {
            if let Some(hsts) = &self.channel.settings().hsts_value {
                response.set_header("strict-transport-security", hsts)?;
            }
        }
        if response.has_buffered_content() {
            return Ok(());
        }
        let length = body.len() as u64;
        response.set_content_length(Some(length));
        let stream = response.body();
        stream.set_content_length(Some(length));
        stream.write_str(body)?;
        Ok(())
    }

    /// Release this link's active count if it still holds one
    pub(crate) fn release_count(&self) {
        if self
            .count
            .compare_exchange(COUNT_HELD, COUNT_RELEASED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.channel.decrement_active_conns();
        }
    }

    fn request_url(&self) -> String {
        self.request()
            .map(|r| r.request_url())
            .unwrap_or_else(|| "/".to_string())
    }
}

impl fmt::Debug for DispatchLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchLink")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .field("holds_active_count", &self.holds_active_count())
            .finish()
    }
}
