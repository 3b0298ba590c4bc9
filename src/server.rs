//! hyper/tokio listener bridging sockets to a dispatch channel
//!
//! Each request becomes one [`VirtualConnection`] whose transport hands the
//! finished response back to the hyper service through a oneshot channel.
//! HTTP/2 requests are streams of a multiplexed connection and are marked
//! [`ConnectionMode::UpgradedHttp2`]. If hyper drops the service future
//! (client went away) the link is destroyed.
//!
//! A handler that switches protocols gets the raw connection once hyper has
//! written the `101`. The upgrade task then owns teardown: it destroys and
//! closes the link when the session ends.

use crate::channel::{ChainEventListener, DispatchChannel};
use crate::connection::{
    ConnectionInfo, ConnectionMode, TlsInfo, Transport, UpgradeSession, UpgradedConnection,
    VirtualConnection,
};
use crate::error::DispatchError;
use crate::link::DispatchLink;
use crate::message::{FinishedResponse, WireRequest};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderMap, HeaderValue, CONNECTION};
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Accepts connections for one endpoint and feeds them to its channel
pub struct DispatchServer {
    bind_addr: SocketAddr,
    channel: Arc<DispatchChannel>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl DispatchServer {
    pub fn new(
        bind_addr: SocketAddr,
        channel: Arc<DispatchChannel>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            channel,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn channel(&self) -> &Arc<DispatchChannel> {
        &self.channel
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(
            addr = %local,
            protocol,
            channel = self.channel.name(),
            "Dispatch server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            let local_addr = stream.local_addr().unwrap_or(local);
                            let info = ConnectionInfo::new(local_addr, remote);
                            let channel = Arc::clone(&self.channel);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            let info = info.with_tls(tls_info(tls_stream.get_ref().1));
                                            if let Err(e) = handle_connection(tls_stream, info, channel).await {
                                                debug!(addr = %remote, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %remote, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, info, channel).await {
                                    debug!(addr = %remote, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(channel = self.channel.name(), "Dispatch server no longer accepting");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn tls_info(session: &rustls::ServerConnection) -> TlsInfo {
    TlsInfo {
        protocol: session.protocol_version().map(|v| format!("{:?}", v)),
        cipher_suite: session.negotiated_cipher_suite().map(|s| format!("{:?}", s.suite())),
        alpn: session
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned()),
        server_name: session.server_name().map(String::from),
    }
}

async fn handle_connection<S>(
    stream: S,
    info: ConnectionInfo,
    channel: Arc<DispatchChannel>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let channel = Arc::clone(&channel);
        let info = info.clone();
        async move { dispatch_request(req, channel, info).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn dispatch_request(
    req: Request<Incoming>,
    channel: Arc<DispatchChannel>,
    info: ConnectionInfo,
) -> Result<Response<DispatchBody>, Infallible> {
    let (mut parts, body) = req.into_parts();
    let on_upgrade = parts.extensions.remove::<OnUpgrade>();
    let (body, trailers) = match body.collect().await {
        Ok(collected) => {
            let trailers = collected.trailers().cloned();
            (Ok(collected.to_bytes()), trailers)
        }
        Err(e) => {
            debug!(remote = %info.remote_addr, error = %e, "Request body incomplete");
            (Err(e.to_string()), None)
        }
    };
    let message = WireRequest {
        method: parts.method,
        uri: parts.uri,
        version: parts.version,
        headers: parts.headers,
        body,
        trailers,
    };
    let http2 = message.version == Version::HTTP_2;

    let (tx, rx) = oneshot::channel();
    let transport = Arc::new(HyperTransport::new(tx, on_upgrade));
    let conn = VirtualConnection::new(info, transport.clone(), message);
    if http2 {
        if let Err(e) = conn.set_mode(ConnectionMode::UpgradedHttp2) {
            warn!(connection = conn.id(), error = %e, "Failed to mark HTTP/2 stream");
        }
    }

    let link = channel.get_connection_link(&conn);
    let mut guard = DestroyOnDrop::new(Arc::clone(&link));
    let outcome = link.ready();
    debug!(connection = conn.id(), outcome = ?outcome, "Request routed");

    let response = match rx.await {
        Ok(finished) => into_hyper(finished),
        Err(_) => {
            warn!(connection = conn.id(), "Connection closed without a response");
            let mut response = Response::new(DispatchBody::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
            response
        }
    };
    if transport.is_upgrading() {
        guard.disarm();
    }
    Ok(response)
}

/// Destroys the link when the request future completes or is dropped,
/// unless an upgrade task took over teardown
struct DestroyOnDrop {
    link: Arc<DispatchLink>,
    armed: bool,
}

impl DestroyOnDrop {
    fn new(link: Arc<DispatchLink>) -> Self {
        Self { link, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DestroyOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.link.destroy(None);
        }
    }
}

/// Cancels an upgrade task from the link side
struct UpgradeHandle {
    cancel: Arc<Notify>,
}

impl UpgradedConnection for UpgradeHandle {
    fn close(&self) {
        self.cancel.notify_one();
    }
}

/// Transport handing the finished response to the waiting hyper service
struct HyperTransport {
    sender: Mutex<Option<oneshot::Sender<FinishedResponse>>>,
    on_upgrade: Mutex<Option<OnUpgrade>>,
    upgrading: AtomicBool,
    runtime: Handle,
}

impl HyperTransport {
    fn new(sender: oneshot::Sender<FinishedResponse>, on_upgrade: Option<OnUpgrade>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
            on_upgrade: Mutex::new(on_upgrade),
            upgrading: AtomicBool::new(false),
            runtime: Handle::current(),
        }
    }

    fn is_upgrading(&self) -> bool {
        self.upgrading.load(Ordering::SeqCst)
    }
}

impl Transport for HyperTransport {
    fn write_response(
        &self,
        conn: &VirtualConnection,
        response: FinishedResponse,
    ) -> Result<(), DispatchError> {
        let sender = self
            .sender
            .lock()
            .take()
            .ok_or(DispatchError::ConnectionClosed(conn.id()))?;
        sender
            .send(response)
            .map_err(|_| DispatchError::ConnectionClosed(conn.id()))
    }

    fn close(&self, conn: &VirtualConnection, failure: Option<&DispatchError>) {
        if let Some(failure) = failure {
            debug!(connection = conn.id(), error = %failure, "Closing connection after failure");
        }
        // Wakes the service if nothing was written
        self.sender.lock().take();
    }

    fn upgrade(
        &self,
        conn: &VirtualConnection,
        session: UpgradeSession,
    ) -> Result<Arc<dyn UpgradedConnection>, DispatchError> {
        let link = conn.link().ok_or(DispatchError::ConnectionClosed(conn.id()))?;
        let conn = link.connection().ok_or(DispatchError::ConnectionClosed(conn.id()))?;
        let on_upgrade = self
            .on_upgrade
            .lock()
            .take()
            .ok_or(DispatchError::UpgradeUnavailable(conn.id()))?;
        let cancel = Arc::new(Notify::new());
        self.upgrading.store(true, Ordering::SeqCst);

        let handle = UpgradeHandle {
            cancel: Arc::clone(&cancel),
        };
        self.runtime.spawn(async move {
            tokio::select! {
                result = on_upgrade => match result {
                    Ok(upgraded) => {
                        debug!(connection = conn.id(), "Upgrade complete, starting session");
                        tokio::select! {
                            _ = session(TokioIo::new(upgraded)) => {
                                debug!(connection = conn.id(), "Upgraded session ended");
                            }
                            _ = cancel.notified() => {
                                debug!(connection = conn.id(), "Upgraded session cancelled");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(connection = conn.id(), error = %e, "Failed to upgrade connection");
                    }
                },
                _ = cancel.notified() => {
                    debug!(connection = conn.id(), "Upgrade cancelled before completion");
                }
            }
            link.destroy(None);
            link.close(None);
        });

        Ok(Arc::new(handle))
    }
}

fn into_hyper(finished: FinishedResponse) -> Response<DispatchBody> {
    let mut response = Response::new(DispatchBody::new(finished.body, finished.trailers));
    *response.status_mut() = finished.status;
    *response.headers_mut() = finished.headers;
    response
}

/// Fully buffered response body with optional trailers
#[derive(Debug, Default)]
pub struct DispatchBody {
    data: Option<Bytes>,
    trailers: Option<HeaderMap>,
}

impl DispatchBody {
    pub fn new(data: Bytes, trailers: Option<HeaderMap>) -> Self {
        Self {
            data: Some(data).filter(|d| !d.is_empty()),
            trailers,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl Body for DispatchBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(data) = this.data.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        if let Some(trailers) = this.trailers.take() {
            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
        }
        Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.trailers.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        if self.trailers.is_some() {
            return SizeHint::default();
        }
        let len = self.data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
        SizeHint::with_exact(len)
    }
}

/// Collects `stop_chain` signals so shutdown can wait for quiesced channels
#[derive(Default)]
pub struct QuiesceMonitor {
    stopped: Mutex<HashSet<String>>,
    notify: Notify,
}

impl QuiesceMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_stopped(&self, channel: &str) -> bool {
        self.stopped.lock().contains(channel)
    }

    /// Wait until every named channel has signalled
    pub async fn wait_for(&self, channels: &[String]) {
        loop {
            let notified = self.notify.notified();
            if channels.iter().all(|c| self.is_stopped(c)) {
                return;
            }
            notified.await;
        }
    }

    /// Forget earlier signals before a new quiesce cycle
    pub fn reset(&self) {
        self.stopped.lock().clear();
    }
}

impl ChainEventListener for QuiesceMonitor {
    fn stop_chain(&self, channel: &str) {
        info!(channel, "Channel quiesced");
        self.stopped.lock().insert(channel.to_string());
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{SessionFuture, UpgradedIo};
    use std::time::Duration;

    #[test]
    fn test_dispatch_body_frames() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("abc"));
        let body = DispatchBody::new(Bytes::from_static(b"hello"), Some(trailers));
        assert!(!body.is_end_stream());
        assert_eq!(body.size_hint().exact(), None);

        let body = DispatchBody::new(Bytes::from_static(b"hello"), None);
        assert_eq!(body.size_hint().exact(), Some(5));

        let body = DispatchBody::empty();
        assert!(body.is_end_stream());
    }

    #[tokio::test]
    async fn test_dispatch_body_collects_data_and_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", HeaderValue::from_static("abc"));
        let collected = DispatchBody::new(Bytes::from_static(b"hello"), Some(trailers))
            .collect()
            .await
            .unwrap();
        assert_eq!(collected.trailers().unwrap().get("x-checksum").unwrap(), "abc");
        assert_eq!(collected.to_bytes(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_hyper_transport_delivers_once() {
        let (tx, rx) = oneshot::channel();
        let transport = Arc::new(HyperTransport::new(tx, None));
        let conn = VirtualConnection::new(
            crate::connection::testing::test_info(),
            transport.clone(),
            WireRequest::get("/"),
        );
        let response = FinishedResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"OK"),
            trailers: None,
        };
        transport.write_response(&conn, response.clone()).unwrap();
        assert!(matches!(
            transport.write_response(&conn, response),
            Err(DispatchError::ConnectionClosed(_))
        ));
        assert_eq!(rx.await.unwrap().body_str(), "OK");
    }

    #[tokio::test]
    async fn test_hyper_transport_close_wakes_waiter() {
        let (tx, rx) = oneshot::channel();
        let transport = HyperTransport::new(tx, None);
        let conn = VirtualConnection::new(
            crate::connection::testing::test_info(),
            crate::connection::testing::RecordingTransport::new(),
            WireRequest::get("/"),
        );
        transport.close(&conn, None);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_hyper_transport_without_upgrade_refuses_switch() {
        let (tx, _rx) = oneshot::channel();
        let transport = HyperTransport::new(tx, None);
        let conn = VirtualConnection::new(
            crate::connection::testing::test_info(),
            crate::connection::testing::RecordingTransport::new(),
            WireRequest::get("/"),
        );
        let session: UpgradeSession = Box::new(|_io: UpgradedIo| -> SessionFuture { Box::pin(async {}) });
        let result = transport.upgrade(&conn, session);
        assert!(result.is_err());
        assert!(!transport.is_upgrading());
    }

    #[tokio::test]
    async fn test_quiesce_monitor_waits_for_all() {
        let monitor = QuiesceMonitor::new();
        let names = vec!["http".to_string(), "https".to_string()];

        let waiter = {
            let monitor = Arc::clone(&monitor);
            let names = names.clone();
            tokio::spawn(async move { monitor.wait_for(&names).await })
        };

        monitor.stop_chain("http");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        monitor.stop_chain("https");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        monitor.reset();
        assert!(!monitor.is_stopped("http"));
    }
}
