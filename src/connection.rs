//! Transport-side view of an inbound connection
//!
//! A [`VirtualConnection`] is what the transport hands to a channel: the
//! inbound request, addressing details, and the few pieces of shared state the
//! link uses to coordinate with the transport and with upgraded protocol
//! handlers (mode, stream-close marker, upgraded connection object).

use crate::error::DispatchError;
use crate::link::DispatchLink;
use crate::message::{FinishedResponse, WireRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Raw I/O of a connection after `101 Switching Protocols`
pub type UpgradedIo = TokioIo<hyper::upgrade::Upgraded>;

/// Future driving an upgraded connection until its protocol is done
pub type SessionFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Takes over the raw connection once the upgrade response is on the wire
pub type UpgradeSession = Box<dyn FnOnce(UpgradedIo) -> SessionFuture + Send>;

/// Lower layer of a connection: where responses go and who closes the socket
pub trait Transport: Send + Sync {
    /// Deliver a completed response
    fn write_response(
        &self,
        conn: &VirtualConnection,
        response: FinishedResponse,
    ) -> Result<(), DispatchError>;

    /// Close the underlying connection
    fn close(&self, conn: &VirtualConnection, failure: Option<&DispatchError>);

    /// Run `session` on the raw connection after the upgrade response.
    ///
    /// The transport owns teardown from here: when the session ends it
    /// destroys and then closes the connection's link. The returned handle
    /// cuts the session short.
    fn upgrade(
        &self,
        conn: &VirtualConnection,
        session: UpgradeSession,
    ) -> Result<Arc<dyn UpgradedConnection>, DispatchError> {
        drop(session);
        Err(DispatchError::UpgradeUnavailable(conn.id()))
    }
}

/// An object owning an upgraded connection (e.g. a WebSocket session)
pub trait UpgradedConnection: Send + Sync {
    fn close(&self);
}

/// Protocol mode of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Ordinary request/response framing
    Plain,
    /// Upgraded to some other protocol through `Upgrade:`
    UpgradedGeneric,
    /// A stream of an HTTP/2 connection
    UpgradedHttp2,
    /// Upgraded and owned by a web connection handler that may close it itself
    UpgradedWebConnection,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Plain => "plain",
            ConnectionMode::UpgradedGeneric => "upgraded",
            ConnectionMode::UpgradedHttp2 => "http2",
            ConnectionMode::UpgradedWebConnection => "web-connection",
        }
    }

    pub fn is_upgraded(&self) -> bool {
        !matches!(self, ConnectionMode::Plain)
    }

    /// Upgraded to something other than HTTP/2
    pub fn is_non_http2_upgrade(&self) -> bool {
        matches!(
            self,
            ConnectionMode::UpgradedGeneric | ConnectionMode::UpgradedWebConnection
        )
    }

    /// Whether `self -> next` is a legal mode transition
    pub fn can_transition_to(&self, next: ConnectionMode) -> bool {
        match (self, next) {
            (ConnectionMode::Plain, next) => next != ConnectionMode::Plain,
            (ConnectionMode::UpgradedGeneric, ConnectionMode::UpgradedWebConnection) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit close request for request/response streams on an upgrade
/// initiated by the container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCloseMarker {
    None,
    /// Streams must be closed directly on the next close
    Requested,
    /// Streams were closed; further closes take the normal path
    Closed,
}

/// Negotiated TLS details of a secure connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub protocol: Option<String>,
    pub cipher_suite: Option<String>,
    pub alpn: Option<String>,
    pub server_name: Option<String>,
}

/// Addressing details of a connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub tls: Option<TlsInfo>,
}

impl ConnectionInfo {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsInfo) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}

/// A connection (or HTTP/2 stream) accepted by the transport
pub struct VirtualConnection {
    id: u64,
    info: ConnectionInfo,
    transport: Arc<dyn Transport>,
    request: Mutex<Option<WireRequest>>,
    mode: Mutex<ConnectionMode>,
    stream_marker: Mutex<StreamCloseMarker>,
    upgraded: Mutex<Option<Arc<dyn UpgradedConnection>>>,
    link: Mutex<Option<Arc<DispatchLink>>>,
    attached: AtomicBool,
}

impl VirtualConnection {
    pub fn new(info: ConnectionInfo, transport: Arc<dyn Transport>, request: WireRequest) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            info,
            transport,
            request: Mutex::new(Some(request)),
            mode: Mutex::new(ConnectionMode::Plain),
            stream_marker: Mutex::new(StreamCloseMarker::None),
            upgraded: Mutex::new(None),
            link: Mutex::new(None),
            attached: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Take the inbound request; only the first link initialisation gets it
    pub(crate) fn take_request(&self) -> Option<WireRequest> {
        self.request.lock().take()
    }

    pub fn mode(&self) -> ConnectionMode {
        *self.mode.lock()
    }

    /// Move to `next` if that is a legal transition
    pub fn set_mode(&self, next: ConnectionMode) -> Result<(), DispatchError> {
        let mut mode = self.mode.lock();
        if !mode.can_transition_to(next) {
            return Err(DispatchError::InvalidUpgrade {
                from: mode.as_str(),
                to: next.as_str(),
            });
        }
        *mode = next;
        Ok(())
    }

    pub fn stream_marker(&self) -> StreamCloseMarker {
        *self.stream_marker.lock()
    }

    /// Ask the next close to close request/response streams directly
    pub fn request_stream_close(&self) {
        let mut marker = self.stream_marker.lock();
        if *marker == StreamCloseMarker::None {
            *marker = StreamCloseMarker::Requested;
        }
    }

    /// Claim the pending stream close. Only one caller gets `true`.
    pub(crate) fn claim_stream_close(&self) -> bool {
        let mut marker = self.stream_marker.lock();
        if *marker == StreamCloseMarker::Requested {
            *marker = StreamCloseMarker::Closed;
            true
        } else {
            false
        }
    }

    pub fn register_upgraded(&self, upgraded: Arc<dyn UpgradedConnection>) {
        *self.upgraded.lock() = Some(upgraded);
    }

    pub(crate) fn take_upgraded(&self) -> Option<Arc<dyn UpgradedConnection>> {
        self.upgraded.lock().take()
    }

    pub fn has_upgraded(&self) -> bool {
        self.upgraded.lock().is_some()
    }

    pub fn link(&self) -> Option<Arc<DispatchLink>> {
        self.link.lock().clone()
    }

    /// The associated link, creating it with `create` if there is none
    pub(crate) fn link_or_insert_with(
        &self,
        create: impl FnOnce() -> Arc<DispatchLink>,
    ) -> Arc<DispatchLink> {
        let mut slot = self.link.lock();
        match slot.as_ref() {
            Some(existing) => Arc::clone(existing),
            None => {
                let link = create();
                *slot = Some(Arc::clone(&link));
                link
            }
        }
    }

    /// Whether the transport still holds state for this connection
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Transport has discarded its state for this connection
    pub fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
        self.link.lock().take();
    }
}

impl fmt::Debug for VirtualConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualConnection")
            .field("id", &self.id)
            .field("remote", &self.info.remote_addr)
            .field("local", &self.info.local_addr)
            .field("mode", &self.mode())
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Transport that records what the link asked of it
    #[derive(Default)]
    pub struct RecordingTransport {
        pub closes: AtomicUsize,
        pub responses: Mutex<Vec<FinishedResponse>>,
        pub fail_writes: AtomicBool,
        pub refuse_upgrades: AtomicBool,
        pub upgrades: AtomicUsize,
    }

    /// Upgrade handle that only counts closes
    #[derive(Default)]
    pub struct CountingUpgrade {
        pub closes: AtomicUsize,
    }

    impl UpgradedConnection for CountingUpgrade {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub fn last_response(&self) -> Option<FinishedResponse> {
            self.responses.lock().last().cloned()
        }

        pub fn response_count(&self) -> usize {
            self.responses.lock().len()
        }
    }

    impl Transport for RecordingTransport {
        fn write_response(
            &self,
            _conn: &VirtualConnection,
            response: FinishedResponse,
        ) -> Result<(), DispatchError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DispatchError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "peer went away",
                )));
            }
            self.responses.lock().push(response);
            Ok(())
        }

        fn close(&self, _conn: &VirtualConnection, _failure: Option<&DispatchError>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn upgrade(
            &self,
            conn: &VirtualConnection,
            _session: UpgradeSession,
        ) -> Result<Arc<dyn UpgradedConnection>, DispatchError> {
            if self.refuse_upgrades.load(Ordering::SeqCst) {
                return Err(DispatchError::UpgradeUnavailable(conn.id()));
            }
            self.upgrades.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingUpgrade::default()))
        }
    }

    pub fn test_info() -> ConnectionInfo {
        ConnectionInfo::new(
            "127.0.0.1:9080".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        )
    }
}
