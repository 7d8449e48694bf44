//! Trait implemented by user spiders so fetching and parsing stay outside
//! the scheduling core.

use crate::proxy::ProxyHelper;
use crate::storage::{Bucket, Priority, Queue, StorageResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Errors coming out of user handlers. The reactor logs them and keeps
/// going; they never take the engine down.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Narrow capability handed to handlers: enqueue URLs and read/write side
/// data, without a back-pointer to the reactor itself.
#[derive(Clone)]
pub struct EngineHandle {
    queue: Arc<dyn Queue>,
    bucket: Arc<dyn Bucket>,
}

impl EngineHandle {
    pub(crate) fn new(queue: Arc<dyn Queue>, bucket: Arc<dyn Bucket>) -> Self {
        Self { queue, bucket }
    }

    /// Enqueue a discovered URL unless it was already completed or queued.
    /// Returns `Ok(false)` when the URL was skipped.
    pub fn add(&self, url: &str, priority: Priority) -> StorageResult<bool> {
        self.queue.add(url, priority)
    }

    /// Enqueue bypassing the completed-URL filter. Still refuses URLs
    /// currently in the queue.
    pub fn add_direct(&self, url: &str, priority: Priority) -> StorageResult<bool> {
        self.queue.add_direct(url, priority)
    }

    /// Side-data store shared with the engine.
    pub fn bucket(&self) -> &dyn Bucket {
        self.bucket.as_ref()
    }
}

#[async_trait]
pub trait Spider: Send + Sync {
    /// Initial URLs, injected at [`Priority::P0`] on first run only.
    fn seeders(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called once per repository lifetime, before any URL is processed.
    /// Errors here abort startup.
    async fn on_init(&self, engine: &EngineHandle) -> Result<(), HandlerError> {
        let _ = engine;
        Ok(())
    }

    /// Called for every popped URL with a client already wired to the
    /// worker's proxy (when proxying is configured). Returning an error
    /// downgrades the proxy disposition to delete unless the handler set a
    /// flag, and the URL still counts as processed.
    async fn on_process(
        &self,
        url: &str,
        client: &reqwest::Client,
        proxy: &mut ProxyHelper,
        engine: &EngineHandle,
    ) -> Result<(), HandlerError>;
}
