//! Named cache of dispatch channels

use crate::channel::{ChainEventListener, ChannelConfig, DispatchChannel};
use crate::settings::{DispatcherSettings, DEFAULT_BUFFER_SIZE};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Channels by name; channels hold a weak reference for deregistration
pub type ChannelRegistry = DashMap<String, Arc<DispatchChannel>>;

/// Creates one [`DispatchChannel`] per configured name and applies
/// factory-wide defaults to new channels
pub struct DispatchFactory {
    registry: Arc<ChannelRegistry>,
    settings: Arc<DispatcherSettings>,
    listener: Arc<dyn ChainEventListener>,
    default_buffer_size: AtomicUsize,
}

impl DispatchFactory {
    pub fn new(settings: Arc<DispatcherSettings>, listener: Arc<dyn ChainEventListener>) -> Self {
        Self {
            registry: Arc::new(DashMap::new()),
            settings,
            listener,
            default_buffer_size: AtomicUsize::new(DEFAULT_BUFFER_SIZE),
        }
    }

    pub fn with_default_buffer_size(self, size: usize) -> Self {
        self.set_default_buffer_size(size);
        self
    }

    pub fn settings(&self) -> &Arc<DispatcherSettings> {
        &self.settings
    }

    pub fn default_buffer_size(&self) -> usize {
        self.default_buffer_size.load(Ordering::Relaxed)
    }

    /// Applies to channels created afterwards
    pub fn set_default_buffer_size(&self, size: usize) {
        self.default_buffer_size.store(size.max(1), Ordering::Relaxed);
    }

    /// The channel called `name`, created from `config` on first reference
    pub fn find_or_create(&self, name: &str, config: ChannelConfig) -> Arc<DispatchChannel> {
        let entry = self.registry.entry(name.to_string()).or_insert_with(|| {
            info!(channel = name, endpoint = %config.endpoint, "Creating dispatch channel");
            DispatchChannel::with_registry(
                name,
                config,
                Arc::clone(&self.settings),
                Arc::clone(&self.listener),
                self.default_buffer_size(),
                Arc::downgrade(&self.registry),
            )
        });
        Arc::clone(entry.value())
    }

    pub fn get(&self, name: &str) -> Option<Arc<DispatchChannel>> {
        self.registry.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Push new configuration to an existing channel
    pub fn update(&self, name: &str, config: ChannelConfig) -> bool {
        match self.get(name) {
            Some(channel) => {
                channel.update(config);
                true
            }
            None => {
                debug!(channel = name, "Update for unknown channel ignored");
                false
            }
        }
    }

    /// Remove and destroy the channel called `name`
    pub fn remove(&self, name: &str) -> Option<Arc<DispatchChannel>> {
        let (_, channel) = self.registry.remove(name)?;
        channel.destroy();
        Some(channel)
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::CountingListener;
    use crate::channel::ChannelState;
    use crate::vhost::VirtualHostMap;

    fn factory() -> DispatchFactory {
        let settings = Arc::new(DispatcherSettings::new(Arc::new(VirtualHostMap::new())));
        DispatchFactory::new(settings, CountingListener::new())
    }

    #[test]
    fn test_find_or_create_caches_by_name() {
        let factory = factory();
        let a = factory.find_or_create("http", ChannelConfig::new("defaultHttpEndpoint"));
        let b = factory.find_or_create("http", ChannelConfig::new("ignored"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().endpoint, "defaultHttpEndpoint");
        assert_eq!(factory.len(), 1);
    }

    #[test]
    fn test_default_buffer_size_applies_to_new_channels() {
        let factory = factory().with_default_buffer_size(4096);
        let first = factory.find_or_create("a", ChannelConfig::new("a"));
        assert_eq!(first.buffer_size(), 4096);

        factory.set_default_buffer_size(1024);
        let second = factory.find_or_create("b", ChannelConfig::new("b"));
        assert_eq!(first.buffer_size(), 4096);
        assert_eq!(second.buffer_size(), 1024);

        let explicit = factory.find_or_create("c", ChannelConfig::new("c").with_buffer_size(16));
        assert_eq!(explicit.buffer_size(), 16);
    }

    #[test]
    fn test_update_existing_channel() {
        let factory = factory();
        factory.find_or_create("http", ChannelConfig::new("one"));
        assert!(factory.update("http", ChannelConfig::new("two")));
        assert_eq!(factory.get("http").unwrap().config().endpoint, "two");
        assert!(!factory.update("missing", ChannelConfig::new("x")));
    }

    #[test]
    fn test_remove_destroys_channel() {
        let factory = factory();
        let channel = factory.find_or_create("http", ChannelConfig::new("e"));
        let removed = factory.remove("http").unwrap();
        assert!(Arc::ptr_eq(&channel, &removed));
        assert_eq!(channel.state(), ChannelState::Destroyed);
        assert!(factory.get("http").is_none());
        assert!(factory.remove("http").is_none());
    }

    #[test]
    fn test_destroy_deregisters() {
        let factory = factory();
        let channel = factory.find_or_create("https", ChannelConfig::new("e"));
        factory.find_or_create("http", ChannelConfig::new("e"));
        channel.destroy();
        assert_eq!(factory.channel_names(), vec!["http".to_string()]);
    }
}
