//! Dispatch channel: per-endpoint lifecycle and active connection accounting
//!
//! A channel creates one [`DispatchLink`] per inbound connection and keeps a
//! single atomic count of the links currently holding a connection open.
//! Stopping with a grace period puts the channel in quiescing mode: the
//! listener is told "no active connections" exactly once, either right away
//! or when the last link releases its count. Stopping without a grace period
//! tells links not to call into the transport any more.

use crate::connection::VirtualConnection;
use crate::error::DispatchError;
use crate::factory::ChannelRegistry;
use crate::link::DispatchLink;
use crate::settings::{DispatcherSettings, DEFAULT_BUFFER_SIZE};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receives chain-level events from a channel
pub trait ChainEventListener: Send + Sync {
    /// Every connection has finished after a quiesce request
    fn stop_chain(&self, channel: &str);
}

/// Listener that ignores events
#[derive(Debug, Default)]
pub struct NoopChainListener;

impl ChainEventListener for NoopChainListener {
    fn stop_chain(&self, _channel: &str) {}
}

/// Per-channel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Endpoint identifier used for virtual host lookup
    pub endpoint: String,
    /// Response buffer size; the factory default applies when unset
    pub buffer_size: Option<usize>,
}

impl ChannelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            buffer_size: None,
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }
}

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initialized,
    Started,
    Stopped,
    Destroyed,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Started => "started",
            ChannelState::Stopped => "stopped",
            ChannelState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner of link creation and active connection accounting for one endpoint
pub struct DispatchChannel {
    name: String,
    config: RwLock<Arc<ChannelConfig>>,
    settings: Arc<DispatcherSettings>,
    listener: Arc<dyn ChainEventListener>,
    state: Mutex<ChannelState>,
    active: AtomicUsize,
    quiescing: AtomicBool,
    immediate_stop: AtomicBool,
    default_buffer_size: usize,
    registry: Weak<ChannelRegistry>,
}

impl DispatchChannel {
    /// Create a channel outside of any factory
    pub fn new(
        name: impl Into<String>,
        config: ChannelConfig,
        settings: Arc<DispatcherSettings>,
        listener: Arc<dyn ChainEventListener>,
    ) -> Arc<Self> {
        Self::with_registry(name, config, settings, listener, DEFAULT_BUFFER_SIZE, Weak::new())
    }

    pub(crate) fn with_registry(
        name: impl Into<String>,
        config: ChannelConfig,
        settings: Arc<DispatcherSettings>,
        listener: Arc<dyn ChainEventListener>,
        default_buffer_size: usize,
        registry: Weak<ChannelRegistry>,
    ) -> Arc<Self> {
        let name = name.into();
        debug!(channel = %name, endpoint = %config.endpoint, "Channel created");
        Arc::new(Self {
            name,
            config: RwLock::new(Arc::new(config)),
            settings,
            listener,
            state: Mutex::new(ChannelState::Initialized),
            active: AtomicUsize::new(0),
            quiescing: AtomicBool::new(false),
            immediate_stop: AtomicBool::new(false),
            default_buffer_size,
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> Arc<ChannelConfig> {
        self.config.read().clone()
    }

    pub fn settings(&self) -> &Arc<DispatcherSettings> {
        &self.settings
    }

    /// Replace the configuration; links keep what they already captured
    pub fn update(&self, config: ChannelConfig) {
        info!(channel = %self.name, endpoint = %config.endpoint, "Channel configuration updated");
        *self.config.write() = Arc::new(config);
    }

    pub fn buffer_size(&self) -> usize {
        self.config.read().buffer_size.unwrap_or(self.default_buffer_size)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn start(&self) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        match *state {
            ChannelState::Initialized | ChannelState::Stopped => {
                self.quiescing.store(false, Ordering::SeqCst);
                self.immediate_stop.store(false, Ordering::SeqCst);
                *state = ChannelState::Started;
                info!(channel = %self.name, "Channel started");
                Ok(())
            }
            ChannelState::Started => Ok(()),
            ChannelState::Destroyed => Err(DispatchError::InvalidLifecycle {
                channel: self.name.clone(),
                operation: "start",
                state: state.as_str(),
            }),
        }
    }

    /// Stop the channel.
    ///
    /// A non-zero grace period quiesces: the channel keeps serving and
    /// signals [`ChainEventListener::stop_chain`] once the active count is
    /// zero. A zero grace period stops immediately.
    pub fn stop(&self, grace: Duration) {
        if grace.is_zero() {
            self.quiescing.store(false, Ordering::SeqCst);
            self.immediate_stop.store(true, Ordering::SeqCst);
            let mut state = self.state.lock();
            if *state != ChannelState::Destroyed {
                *state = ChannelState::Stopped;
            }
            info!(channel = %self.name, active = self.active_connections(), "Channel stopped");
            return;
        }

        info!(
            channel = %self.name,
            active = self.active_connections(),
            grace_ms = grace.as_millis() as u64,
            "Channel quiescing"
        );
        self.quiescing.store(true, Ordering::SeqCst);
        if self.active.load(Ordering::SeqCst) == 0 {
            self.signal_quiesced();
        }
    }

    /// Deregister from the owning factory
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Destroyed {
                return;
            }
            *state = ChannelState::Destroyed;
        }
        self.quiescing.store(false, Ordering::SeqCst);
        self.immediate_stop.store(true, Ordering::SeqCst);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.name);
        }
        info!(channel = %self.name, "Channel destroyed");
    }

    pub fn is_quiescing(&self) -> bool {
        self.quiescing.load(Ordering::SeqCst)
    }

    /// Whether `stop` was called without a grace period
    pub fn is_immediate_stop(&self) -> bool {
        self.immediate_stop.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn increment_active_conns(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(channel = %self.name, active = now, "Active connections incremented");
    }

    pub fn decrement_active_conns(&self) {
        match self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
        {
            Ok(1) => {
                debug!(channel = %self.name, active = 0, "Active connections decremented");
                if self.quiescing.load(Ordering::SeqCst) {
                    self.signal_quiesced();
                }
            }
            Ok(previous) => {
                debug!(channel = %self.name, active = previous - 1, "Active connections decremented");
            }
            Err(_) => {
                warn!(channel = %self.name, "Active connection count already zero; decrement ignored");
            }
        }
    }

    /// Fire `stop_chain` if this caller is the one ending the quiesce cycle
    fn signal_quiesced(&self) {
        if self
            .quiescing
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(channel = %self.name, "No active connections; signalling chain stop");
            self.listener.stop_chain(&self.name);
        }
    }

    /// The link for `conn`, created and initialised on first use
    pub fn get_connection_link(self: &Arc<Self>, conn: &Arc<VirtualConnection>) -> Arc<DispatchLink> {
        conn.link_or_insert_with(|| DispatchLink::new(Arc::clone(self), conn))
    }
}

impl fmt::Debug for DispatchChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchChannel")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("active", &self.active_connections())
            .field("quiescing", &self.is_quiescing())
            .field("immediate_stop", &self.is_immediate_stop())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CountingListener;
    use super::*;
    use crate::connection::testing::{test_info, RecordingTransport};
    use crate::message::WireRequest;
    use crate::vhost::VirtualHostMap;

    fn channel_with(listener: Arc<CountingListener>) -> Arc<DispatchChannel> {
        let settings = Arc::new(DispatcherSettings::new(Arc::new(VirtualHostMap::new())));
        let channel = DispatchChannel::new("http", ChannelConfig::new("defaultHttpEndpoint"), settings, listener);
        channel.start().unwrap();
        channel
    }

    #[test]
    fn test_lifecycle() {
        let channel = channel_with(CountingListener::new());
        assert_eq!(channel.state(), ChannelState::Started);
        channel.stop(Duration::ZERO);
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert!(channel.is_immediate_stop());

        channel.start().unwrap();
        assert!(!channel.is_immediate_stop());

        channel.destroy();
        assert_eq!(channel.state(), ChannelState::Destroyed);
        assert!(matches!(
            channel.start(),
            Err(DispatchError::InvalidLifecycle { operation: "start", .. })
        ));
    }

    #[test]
    fn test_counter_never_negative() {
        let channel = channel_with(CountingListener::new());
        channel.decrement_active_conns();
        assert_eq!(channel.active_connections(), 0);
        channel.increment_active_conns();
        channel.decrement_active_conns();
        channel.decrement_active_conns();
        assert_eq!(channel.active_connections(), 0);
    }

    #[test]
    fn test_quiesce_signals_once_after_last_decrement() {
        let listener = CountingListener::new();
        let channel = channel_with(listener.clone());
        for _ in 0..3 {
            channel.increment_active_conns();
        }

        channel.stop(Duration::from_secs(30));
        assert!(channel.is_quiescing());
        assert_eq!(listener.stop_count(), 0);

        channel.decrement_active_conns();
        channel.decrement_active_conns();
        assert_eq!(listener.stop_count(), 0);
        channel.decrement_active_conns();
        assert_eq!(listener.stop_count(), 1);

        // Later traffic does not signal again in the same cycle
        channel.increment_active_conns();
        channel.decrement_active_conns();
        assert_eq!(listener.stop_count(), 1);
    }

    #[test]
    fn test_quiesce_with_no_connections_signals_immediately() {
        let listener = CountingListener::new();
        let channel = channel_with(listener.clone());
        channel.stop(Duration::from_millis(500));
        assert_eq!(listener.stop_count(), 1);
        assert!(!channel.is_quiescing());
    }

    #[test]
    fn test_immediate_stop_clears_quiescing() {
        let listener = CountingListener::new();
        let channel = channel_with(listener.clone());
        channel.increment_active_conns();
        channel.stop(Duration::from_secs(1));
        channel.stop(Duration::ZERO);
        assert!(!channel.is_quiescing());
        channel.decrement_active_conns();
        assert_eq!(listener.stop_count(), 0);
    }

    #[test]
    fn test_concurrent_decrements_signal_once() {
        let listener = CountingListener::new();
        let channel = channel_with(listener.clone());
        for _ in 0..64 {
            channel.increment_active_conns();
        }
        channel.stop(Duration::from_secs(5));

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let channel = Arc::clone(&channel);
                std::thread::spawn(move || channel.decrement_active_conns())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(channel.active_connections(), 0);
        assert_eq!(listener.stop_count(), 1);
    }

    #[test]
    fn test_update_and_buffer_size() {
        let channel = channel_with(CountingListener::new());
        assert_eq!(channel.buffer_size(), DEFAULT_BUFFER_SIZE);
        let before = channel.config();
        channel.update(ChannelConfig::new("other").with_buffer_size(1024));
        assert_eq!(before.endpoint, "defaultHttpEndpoint");
        assert_eq!(channel.config().endpoint, "other");
        assert_eq!(channel.buffer_size(), 1024);
    }

    #[test]
    fn test_get_connection_link_is_idempotent() {
        let channel = channel_with(CountingListener::new());
        let vc = VirtualConnection::new(test_info(), RecordingTransport::new(), WireRequest::get("/"));
        let first = channel.get_connection_link(&vc);
        let second = channel.get_connection_link(&vc);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.request().unwrap().path(), "/");
    }
}
