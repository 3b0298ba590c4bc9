//! Dispatcher-wide options injected into channels and links

use crate::classify::{Executor, WorkClassifier};
use crate::host::{PrivateHeaderTrust, TrustPolicy};
use crate::vhost::VirtualHostResolver;
use std::sync::Arc;

/// Default size of a response body buffer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Options shared by every channel of a factory
#[derive(Clone)]
pub struct DispatcherSettings {
    pub resolver: Arc<dyn VirtualHostResolver>,
    pub trust: Arc<TrustPolicy>,
    pub welcome_page_enabled: bool,
    pub pad_not_found_body: bool,
    pub hsts_value: Option<String>,
    /// Include host:port in 404 bodies when discrimination finds no handler
    pub verbose_not_found: bool,
    pub executor: Option<Arc<dyn Executor>>,
    pub classifier: Option<Arc<dyn WorkClassifier>>,
}

impl DispatcherSettings {
    pub fn new(resolver: Arc<dyn VirtualHostResolver>) -> Self {
        Self {
            resolver,
            trust: Arc::new(TrustPolicy::new(PrivateHeaderTrust::default())),
            welcome_page_enabled: true,
            pad_not_found_body: true,
            hsts_value: None,
            verbose_not_found: false,
            executor: None,
            classifier: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn WorkClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_trust(mut self, trust: PrivateHeaderTrust) -> Self {
        self.trust = Arc::new(TrustPolicy::new(trust));
        self
    }

    pub fn with_welcome_page(mut self, enabled: bool) -> Self {
        self.welcome_page_enabled = enabled;
        self
    }

    pub fn with_padding(mut self, pad: bool) -> Self {
        self.pad_not_found_body = pad;
        self
    }

    pub fn with_hsts(mut self, value: Option<String>) -> Self {
        self.hsts_value = value;
        self
    }

    pub fn with_verbose_not_found(mut self, verbose: bool) -> Self {
        self.verbose_not_found = verbose;
        self
    }
}
