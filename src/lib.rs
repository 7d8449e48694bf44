//! # trawler
//!
//! Scheduling core for distributed web crawlers. The engine owns the hard
//! parts: a durable priority URL queue with timeout reclamation, a
//! persisted cuckoo filter for at-most-once processing, an N-worker
//! reactor with cooperative drain detection, and a rotating proxy pool.
//! User spiders do the fetching and parsing and feed discovered URLs back
//! into the queue.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use trawler::{
//!     CuckooFilter, EngineHandle, HandlerError, Priority, ProxyHelper,
//!     Reactor, ReactorOpt, SledBucket, SledQueue, Spider,
//! };
//!
//! struct MySpider;
//!
//! #[trawler::async_trait]
//! impl Spider for MySpider {
//!     fn seeders(&self) -> Vec<String> {
//!         vec!["https://example.com".to_string()]
//!     }
//!
//!     async fn on_process(
//!         &self,
//!         url: &str,
//!         client: &reqwest::Client,
//!         _proxy: &mut ProxyHelper,
//!         engine: &EngineHandle,
//!     ) -> Result<(), HandlerError> {
//!         let body = client.get(url).send().await?.text().await?;
//!         for link in discover_links(&body) {
//!             engine.add(&link, Priority::P1)?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! async fn crawl() -> Result<(), Box<dyn std::error::Error>> {
//!     let filter = Arc::new(CuckooFilter::open("data/filter.cuckoo", 1 << 20)?);
//!     let queue = Arc::new(SledQueue::open("data/queue", filter, Duration::from_secs(300))?);
//!     let bucket = Arc::new(SledBucket::open("data/bucket")?);
//!     let reactor = Reactor::new(queue, bucket, 8, ReactorOpt::new())?;
//!     reactor.run(Arc::new(MySpider)).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod logging;
pub mod proxy;
pub mod reactor;
pub mod spider;
pub mod storage;

// Re-export main types for library usage
pub use proxy::provider::{api_provider, tunnel_provider};
pub use proxy::{Proxy, ProxyEndpoint, ProxyError, ProxyHelper, ProxyPool, ProxyStream};
pub use reactor::{Reactor, ReactorError, ReactorOpt};
pub use spider::{EngineHandle, HandlerError, Spider};
pub use storage::{
    Bucket, CuckooFilter, Filter, Priority, Queue, QueueItem, SledBucket, SledQueue,
    StorageError, UrlState,
};

pub use async_trait::async_trait;
