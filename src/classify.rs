//! Executors and work classification
//!
//! Handlers are synchronous and may block, so they run on an [`Executor`]
//! rather than on the transport's async workers. A [`WorkClassifier`] can
//! route individual requests to a different pool than the default one.

use crate::link::DispatchLink;
use crate::request::HttpRequest;
use hyper::Method;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::debug;

/// A unit of work submitted to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs dispatched handler tasks
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, task: Task);
}

/// Picks an executor for a request; `None` means the default executor
pub trait WorkClassifier: Send + Sync {
    fn classify(&self, request: &HttpRequest, link: &DispatchLink) -> Option<Arc<dyn Executor>>;
}

/// Runs tasks on the calling thread
#[derive(Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn name(&self) -> &str {
        "inline"
    }

    fn execute(&self, task: Task) {
        task();
    }
}

/// Runs tasks on tokio's blocking pool with a concurrency limit
pub struct BlockingPoolExecutor {
    name: String,
    handle: Handle,
    permits: Arc<Semaphore>,
    submitted: AtomicU64,
}

impl BlockingPoolExecutor {
    pub fn new(name: impl Into<String>, handle: Handle, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            handle,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            submitted: AtomicU64::new(0),
        }
    }

    /// Number of tasks submitted so far
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Executor for BlockingPoolExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, task: Task) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let permits = Arc::clone(&self.permits);
        let handle = self.handle.clone();
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = handle.spawn_blocking(task).await {
                debug!(error = %e, "Dispatched task did not complete");
            }
        });
    }
}

/// One classification rule
#[derive(Clone)]
pub struct ClassificationRule {
    pub path_prefix: String,
    pub method: Option<Method>,
    pub executor: Arc<dyn Executor>,
}

impl ClassificationRule {
    fn matches(&self, request: &HttpRequest) -> bool {
        if let Some(method) = &self.method {
            if method != request.method() {
                return false;
            }
        }
        request.path().starts_with(&self.path_prefix)
    }
}

/// First-match classifier over path prefix and method rules
#[derive(Default, Clone)]
pub struct RuleClassifier {
    rules: Vec<ClassificationRule>,
}

impl RuleClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl WorkClassifier for RuleClassifier {
    fn classify(&self, request: &HttpRequest, _link: &DispatchLink) -> Option<Arc<dyn Executor>> {
        self.rules
            .iter()
            .find(|rule| rule.matches(request))
            .map(|rule| Arc::clone(&rule.executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_inline_executor_runs_immediately() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        InlineExecutor.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_pool_executor_runs_tasks() {
        let executor = BlockingPoolExecutor::new("default", Handle::current(), 2);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..4 {
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Ok(Some(i)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            seen.push(i);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(executor.submitted(), 4);
        assert_eq!(executor.name(), "default");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_pool_limits_concurrency() {
        let executor = BlockingPoolExecutor::new("limited", Handle::current(), 1);
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..3 {
            let running = Arc::clone(&running);
            let max_seen = Arc::clone(&max_seen);
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(());
            }));
        }
        drop(tx);

        let mut done = 0;
        while let Ok(Some(())) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            done += 1;
        }
        assert_eq!(done, 3);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
