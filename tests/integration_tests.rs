//! End-to-end scenarios: seeded crawls draining through the reactor,
//! priority ordering, reclamation, and proxied runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use trawler::{
    tunnel_provider, Bucket, CuckooFilter, EngineHandle, Filter, HandlerError, Priority,
    ProxyHelper, Queue, Reactor, ReactorOpt, SledBucket, SledQueue, Spider, StorageError,
    UrlState,
};

const QUEUE_TIMEOUT: Duration = Duration::from_millis(400);

fn create_stores(dir: &TempDir) -> (Arc<CuckooFilter>, Arc<SledQueue>, Arc<SledBucket>) {
    let filter = Arc::new(CuckooFilter::open(dir.path().join("filter.cuckoo"), 4096).unwrap());
    let queue = Arc::new(
        SledQueue::open(
            dir.path().join("queue"),
            Arc::clone(&filter) as Arc<dyn Filter>,
            QUEUE_TIMEOUT,
        )
        .unwrap(),
    );
    let bucket = Arc::new(SledBucket::open(dir.path().join("bucket")).unwrap());
    (filter, queue, bucket)
}

/// Records every processed URL in arrival order.
struct TracingSpider {
    seeds: Vec<String>,
    inject: Vec<(String, Priority)>,
    delay: Duration,
    processed: Mutex<Vec<String>>,
}

impl TracingSpider {
    fn seeded(seeds: &[&str]) -> Self {
        Self {
            seeds: seeds.iter().map(|s| s.to_string()).collect(),
            inject: Vec::new(),
            delay: Duration::ZERO,
            processed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Spider for TracingSpider {
    fn seeders(&self) -> Vec<String> {
        self.seeds.clone()
    }

    async fn on_init(&self, engine: &EngineHandle) -> Result<(), HandlerError> {
        for (url, priority) in &self.inject {
            engine.add(url, *priority)?;
        }
        Ok(())
    }

    async fn on_process(
        &self,
        url: &str,
        _client: &reqwest::Client,
        _proxy: &mut ProxyHelper,
        _engine: &EngineHandle,
    ) -> Result<(), HandlerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.processed.lock().push(url.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_seeded_crawl_drains_and_filters() {
    let dir = TempDir::new().unwrap();
    let (filter, queue, bucket) = create_stores(&dir);
    let reactor = Reactor::new(
        Arc::clone(&queue) as Arc<dyn Queue>,
        Arc::clone(&bucket) as Arc<dyn Bucket>,
        2,
        ReactorOpt::new(),
    )
    .unwrap();

    let spider = Arc::new(TracingSpider::seeded(&["a", "b", "c"]));
    reactor.run(Arc::clone(&spider) as Arc<dyn Spider>).await.unwrap();

    let mut processed = spider.processed.lock().clone();
    processed.sort();
    assert_eq!(processed, vec!["a", "b", "c"]);

    assert!(queue.length(UrlState::Waiting).unwrap().is_empty());
    assert!(queue.length(UrlState::Processing).unwrap().is_empty());
    for url in ["a", "b", "c"] {
        assert!(filter.contains(url).unwrap());
        assert!(!queue.add(url, Priority::P0).unwrap());
    }
}

#[tokio::test]
async fn test_single_worker_pops_in_priority_order() {
    let dir = TempDir::new().unwrap();
    let (_filter, queue, bucket) = create_stores(&dir);
    let reactor = Reactor::new(
        Arc::clone(&queue) as Arc<dyn Queue>,
        bucket as Arc<dyn Bucket>,
        1,
        ReactorOpt::new(),
    )
    .unwrap();

    let mut spider = TracingSpider::seeded(&[]);
    spider.inject = vec![
        ("x".to_string(), Priority::P3),
        ("y".to_string(), Priority::P0),
        ("z".to_string(), Priority::P1),
    ];
    let spider = Arc::new(spider);
    reactor.run(Arc::clone(&spider) as Arc<dyn Spider>).await.unwrap();

    assert_eq!(*spider.processed.lock(), vec!["y", "z", "x"]);
}

#[tokio::test]
async fn test_timed_out_processing_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let (_filter, queue, _bucket) = create_stores(&dir);

    assert!(queue.add("u", Priority::P0).unwrap());
    let popped = queue.pop().unwrap();
    assert_eq!(popped.url, "u");
    assert_eq!(popped.state, UrlState::Processing);

    tokio::time::sleep(QUEUE_TIMEOUT + Duration::from_millis(200)).await;

    let reclaimed = queue.collect().unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].url, "u");
    assert_eq!(reclaimed[0].state, UrlState::Processing);
    assert_eq!(queue.lookup("u").unwrap(), UrlState::NotExist);
}

#[tokio::test]
async fn test_concurrent_workers_split_the_seed_set() {
    let dir = TempDir::new().unwrap();
    let (_filter, queue, bucket) = create_stores(&dir);
    let reactor = Reactor::new(
        Arc::clone(&queue) as Arc<dyn Queue>,
        bucket as Arc<dyn Bucket>,
        2,
        ReactorOpt::new(),
    )
    .unwrap();

    let mut spider = TracingSpider::seeded(&["p", "q"]);
    spider.delay = Duration::from_millis(100);
    let spider = Arc::new(spider);
    reactor.run(Arc::clone(&spider) as Arc<dyn Spider>).await.unwrap();

    // Both drained through the barrier, each URL processed exactly once.
    let processed = spider.processed.lock().clone();
    assert_eq!(processed.len(), 2);
    let unique: HashSet<&String> = processed.iter().collect();
    assert_eq!(unique.len(), 2);
}

#[tokio::test]
async fn test_add_twice_enqueues_once() {
    let dir = TempDir::new().unwrap();
    let (_filter, queue, _bucket) = create_stores(&dir);

    assert!(queue.add("u", Priority::P2).unwrap());
    assert!(!queue.add("u", Priority::P2).unwrap());

    let waiting = queue.length(UrlState::Waiting).unwrap();
    assert_eq!(waiting.get(&Priority::P2), Some(&1));
    assert!(matches!(
        queue.pop().map(|item| item.url),
        Ok(url) if url == "u"
    ));
    assert!(matches!(queue.pop(), Err(StorageError::EndOfStream)));
}

#[tokio::test]
async fn test_proxied_crawl_completes() {
    let dir = TempDir::new().unwrap();
    let (_filter, queue, bucket) = create_stores(&dir);

    let provider = tunnel_provider("tunnel.test.local:9001".to_string(), "user", "pass");
    let reactor = Reactor::new(
        Arc::clone(&queue) as Arc<dyn Queue>,
        bucket as Arc<dyn Bucket>,
        1,
        ReactorOpt::new()
            .proxy_providers(vec![provider])
            .proxy_parallels(2)
            .interval(Duration::from_millis(10)),
    )
    .unwrap();

    let spider = Arc::new(TracingSpider::seeded(&["a", "b"]));
    reactor.run(Arc::clone(&spider) as Arc<dyn Spider>).await.unwrap();

    let mut processed = spider.processed.lock().clone();
    processed.sort();
    assert_eq!(processed, vec!["a", "b"]);
    assert!(queue.length(UrlState::Waiting).unwrap().is_empty());
}
