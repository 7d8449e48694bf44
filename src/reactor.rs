//! Worker-pool scheduler driving spiders against the queue and proxy pool.
//!
//! The reactor owns the queue and bucket for its lifetime, runs the
//! one-time spider initialization, injects seed URLs on first run, then
//! keeps `parallels` workers popping, processing and finishing URLs until
//! the whole pool agrees the queue has drained.

use crate::config::Config;
use crate::proxy::{Proxy, ProxyFlag, ProxyHelper, ProxyPool, ProxyStream};
use crate::spider::{EngineHandle, Spider};
use crate::storage::{Bucket, Priority, Queue, StorageError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Bucket key marking that `on_init` and seeder injection already ran.
const INIT_MARKER_KEY: &str = "_IsInit";

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("spider initialization failed: {0}")]
    Init(String),

    #[error("failed to inject seeder {url}: {source}")]
    Seed {
        url: String,
        source: StorageError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Optional reactor settings, builder style.
pub struct ReactorOpt {
    providers: Vec<ProxyStream>,
    interval: Duration,
    download_retry: u32,
    proxy_parallels: usize,
    collect_interval: Option<Duration>,
    debug: bool,
}

impl ReactorOpt {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            interval: Duration::ZERO,
            download_retry: 3,
            proxy_parallels: 1,
            collect_interval: None,
            debug: false,
        }
    }

    /// Proxy sources. Leaving this empty runs workers without proxying.
    pub fn proxy_providers(mut self, providers: Vec<ProxyStream>) -> Self {
        self.providers = providers;
        self
    }

    /// Replicas of each provider URL kept in the ready pool.
    pub fn proxy_parallels(mut self, n: usize) -> Self {
        self.proxy_parallels = n.max(1);
        self
    }

    /// Per-worker sleep after each handler invocation.
    pub fn interval(mut self, d: Duration) -> Self {
        self.interval = d;
        self
    }

    /// Retry hint surfaced to handlers; the scheduler itself never reads it.
    pub fn download_retry(mut self, n: u32) -> Self {
        self.download_retry = n;
        self
    }

    /// Periodically reclaim Processing rows whose worker died. Reclaimed
    /// URLs are deleted and logged; re-add them from a handler if they
    /// should be retried.
    pub fn collect_interval(mut self, d: Duration) -> Self {
        self.collect_interval = Some(d);
        self
    }

    /// Truncate the queue and bucket before starting.
    pub fn debug(mut self, enable: bool) -> Self {
        self.debug = enable;
        self
    }
}

impl Default for ReactorOpt {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Reactor {
    pub queue: Arc<dyn Queue>,
    pub bucket: Arc<dyn Bucket>,
    pub interval: Duration,
    /// Handler-visible retry hint from [`ReactorOpt::download_retry`].
    pub download_retry: u32,
    parallels: usize,
    proxy_parallels: usize,
    collect_interval: Option<Duration>,
    // Taken once when run() starts the proxy pool.
    providers: Mutex<Option<Vec<ProxyStream>>>,
}

impl Reactor {
    pub fn new(
        queue: Arc<dyn Queue>,
        bucket: Arc<dyn Bucket>,
        parallels: usize,
        opt: ReactorOpt,
    ) -> Result<Self, ReactorError> {
        if opt.debug {
            info!("debug mode: truncating queue and bucket");
            queue.truncate()?;
            bucket.truncate()?;
        }
        let providers = if opt.providers.is_empty() {
            None
        } else {
            Some(opt.providers)
        };
        Ok(Self {
            queue,
            bucket,
            interval: opt.interval,
            download_retry: opt.download_retry,
            parallels: parallels.max(1),
            proxy_parallels: opt.proxy_parallels,
            collect_interval: opt.collect_interval,
            providers: Mutex::new(providers),
        })
    }

    /// Run the spider to completion: returns once every worker has
    /// observed a drained queue. Startup errors abort; handler and
    /// transient errors are logged and survived.
    pub async fn run(&self, spider: Arc<dyn Spider>) -> Result<(), ReactorError> {
        let engine = EngineHandle::new(Arc::clone(&self.queue), Arc::clone(&self.bucket));

        match self.bucket.get(INIT_MARKER_KEY) {
            Err(StorageError::NotExist) => {
                info!("first run, calling on_init");
                spider
                    .on_init(&engine)
                    .await
                    .map_err(|e| ReactorError::Init(e.to_string()))?;
                self.bucket.set(INIT_MARKER_KEY, "")?;

                let seeders = spider.seeders();
                info!(count = seeders.len(), "injecting seeders");
                let mut injected = 0usize;
                for url in &seeders {
                    match self.queue.add(url, Priority::P0) {
                        Ok(true) => injected += 1,
                        Ok(false) => {}
                        Err(source) => {
                            return Err(ReactorError::Seed {
                                url: url.clone(),
                                source,
                            })
                        }
                    }
                }
                info!(injected, "seeders injected");
            }
            Ok(_) => {}
            Err(e) => return Err(ReactorError::Storage(e)),
        }

        let pool = self
            .providers
            .lock()
            .take()
            .map(|providers| {
                Arc::new(ProxyPool::start(
                    providers,
                    self.parallels,
                    self.proxy_parallels,
                ))
            });

        let collector = self.collect_interval.map(|every| {
            let queue = Arc::clone(&self.queue);
            tokio::spawn(collect_loop(queue, every))
        });

        let idle: Arc<Vec<AtomicBool>> =
            Arc::new((0..self.parallels).map(|_| AtomicBool::new(false)).collect());

        let mut workers = JoinSet::new();
        for worker_id in 0..self.parallels {
            workers.spawn(worker_loop(WorkerContext {
                worker_id,
                parallels: self.parallels,
                interval: self.interval,
                queue: Arc::clone(&self.queue),
                engine: engine.clone(),
                spider: Arc::clone(&spider),
                pool: pool.clone(),
                idle: Arc::clone(&idle),
            }));
            // Ramp up one worker per second.
            sleep(Duration::from_secs(Config::WORKER_STAGGER_SECS)).await;
        }
        info!(parallels = self.parallels, "all workers started");

        while let Some(result) = workers.join_next().await {
            match result {
                Ok(worker_id) => info!(worker = worker_id, "worker finished"),
                Err(e) => error!(error = %e, "worker task failed"),
            }
        }

        if let Some(handle) = collector {
            handle.abort();
        }
        info!("all workers finished, reactor run complete");
        Ok(())
    }
}

struct WorkerContext {
    worker_id: usize,
    parallels: usize,
    interval: Duration,
    queue: Arc<dyn Queue>,
    engine: EngineHandle,
    spider: Arc<dyn Spider>,
    pool: Option<Arc<ProxyPool>>,
    idle: Arc<Vec<AtomicBool>>,
}

async fn worker_loop(ctx: WorkerContext) -> usize {
    let WorkerContext {
        worker_id,
        parallels,
        interval,
        queue,
        engine,
        spider,
        pool,
        idle,
    } = ctx;

    info!(worker = worker_id, "worker started");
    let mut pop_err_count: u64 = 0;

    loop {
        let item = match queue.pop() {
            Ok(item) => item,
            Err(StorageError::EndOfStream) => {
                debug!(worker = worker_id, "queue reported empty");
                idle[worker_id].store(true, Ordering::SeqCst);
                // Another in-flight handler may still enqueue new URLs, so
                // exit only when every worker has independently gone idle.
                sleep(Duration::from_secs((parallels / 2) as u64)).await;
                if idle.iter().all(|flag| flag.load(Ordering::SeqCst)) {
                    break;
                }
                continue;
            }
            Err(e) => {
                pop_err_count += 1;
                warn!(worker = worker_id, error = %e, "queue pop failed");
                sleep(Duration::from_secs(pop_err_count)).await;
                continue;
            }
        };
        idle[worker_id].store(false, Ordering::SeqCst);
        pop_err_count = 0;

        let proxy = match &pool {
            Some(pool) => match pool.acquire().await {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    warn!(worker = worker_id, error = %e, "proxy acquisition failed");
                    continue;
                }
            },
            None => None,
        };

        let client = match build_client(proxy.as_ref()) {
            Ok(client) => client,
            Err(e) => {
                warn!(worker = worker_id, error = %e, "failed to build http client");
                if let (Some(pool), Some(proxy)) = (&pool, proxy) {
                    pool.put_back(proxy);
                }
                continue;
            }
        };

        debug!(worker = worker_id, url = %item.url, "processing url");
        let mut helper = ProxyHelper::new();
        if let Err(e) = spider
            .on_process(&item.url, &client, &mut helper, &engine)
            .await
        {
            warn!(worker = worker_id, url = %item.url, error = %e, "handler failed");
            if helper.is_unset() {
                helper.delete();
            }
        }

        // The URL counts as processed either way; a finish failure only
        // delays the row until collect reclaims it.
        if let Err(e) = queue.finish(&item.url) {
            warn!(worker = worker_id, url = %item.url, error = %e, "failed to finish url");
        }

        if let (Some(pool), Some(proxy)) = (&pool, proxy) {
            match helper.flag() {
                ProxyFlag::Unset | ProxyFlag::PutBack => pool.put_back(proxy),
                ProxyFlag::Freeze => pool.freeze(proxy, helper.duration()),
                ProxyFlag::Forbidden => pool.forbid(proxy, helper.duration()),
                ProxyFlag::Delete => pool.discard(proxy),
            }
        }

        sleep(interval).await;
    }
    worker_id
}

fn build_client(proxy: Option<&Proxy>) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(proxy) = proxy {
        // Rotating upstreams front arbitrary exits; certificate names
        // rarely survive the hop.
        builder = builder
            .proxy(reqwest::Proxy::all(&proxy.url)?)
            .danger_accept_invalid_certs(true);
    }
    builder.build()
}

async fn collect_loop(queue: Arc<dyn Queue>, every: Duration) {
    let mut tick = tokio::time::interval(every);
    // interval fires immediately; skip the zero tick.
    tick.tick().await;
    loop {
        tick.tick().await;
        match queue.collect() {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                for item in &reclaimed {
                    warn!(url = %item.url, "reclaimed timed-out url");
                }
                info!(reclaimed = reclaimed.len(), "collect pass finished");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "collect pass failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spider::HandlerError;
    use crate::storage::{CuckooFilter, SledBucket, SledQueue, UrlState};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn create_stores(dir: &TempDir) -> (Arc<SledQueue>, Arc<SledBucket>) {
        let filter = Arc::new(
            CuckooFilter::open(dir.path().join("filter.cuckoo"), 4096).unwrap(),
        );
        let queue = Arc::new(
            SledQueue::open(dir.path().join("queue"), filter, Duration::from_secs(5)).unwrap(),
        );
        let bucket = Arc::new(SledBucket::open(dir.path().join("bucket")).unwrap());
        (queue, bucket)
    }

    /// Spider that records processed URLs and can enqueue follow-ups.
    struct RecordingSpider {
        seeds: Vec<String>,
        follow_ups: HashMap<String, Vec<String>>,
        processed: Mutex<Vec<String>>,
        init_calls: AtomicUsize,
    }

    impl RecordingSpider {
        fn new(seeds: &[&str]) -> Self {
            Self {
                seeds: seeds.iter().map(|s| s.to_string()).collect(),
                follow_ups: HashMap::new(),
                processed: Mutex::new(Vec::new()),
                init_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Spider for RecordingSpider {
        fn seeders(&self) -> Vec<String> {
            self.seeds.clone()
        }

        async fn on_init(&self, _engine: &EngineHandle) -> Result<(), HandlerError> {
            self.init_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn on_process(
            &self,
            url: &str,
            _client: &reqwest::Client,
            _proxy: &mut ProxyHelper,
            engine: &EngineHandle,
        ) -> Result<(), HandlerError> {
            self.processed.lock().push(url.to_string());
            if let Some(discovered) = self.follow_ups.get(url) {
                for next in discovered {
                    engine.add(next, Priority::P1)?;
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_drains_seeds() {
        let dir = TempDir::new().unwrap();
        let (queue, bucket) = create_stores(&dir);
        let reactor = Reactor::new(
            Arc::clone(&queue) as Arc<dyn Queue>,
            Arc::clone(&bucket) as Arc<dyn Bucket>,
            2,
            ReactorOpt::new(),
        )
        .unwrap();

        let spider = Arc::new(RecordingSpider::new(&["a", "b", "c"]));
        reactor.run(Arc::clone(&spider) as Arc<dyn Spider>).await.unwrap();

        let mut processed = spider.processed.lock().clone();
        processed.sort();
        assert_eq!(processed, vec!["a", "b", "c"]);
        assert!(queue.length(UrlState::Waiting).unwrap().is_empty());
        assert!(queue.length(UrlState::Processing).unwrap().is_empty());

        // Finished URLs are filtered out for good.
        assert!(!queue.add("a", Priority::P0).unwrap());
    }

    #[tokio::test]
    async fn test_on_init_runs_once() {
        let dir = TempDir::new().unwrap();
        let (queue, bucket) = create_stores(&dir);
        let reactor = Reactor::new(
            Arc::clone(&queue) as Arc<dyn Queue>,
            Arc::clone(&bucket) as Arc<dyn Bucket>,
            1,
            ReactorOpt::new(),
        )
        .unwrap();

        let spider = Arc::new(RecordingSpider::new(&["a"]));
        reactor.run(Arc::clone(&spider) as Arc<dyn Spider>).await.unwrap();
        reactor.run(Arc::clone(&spider) as Arc<dyn Spider>).await.unwrap();

        assert_eq!(spider.init_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Seeders were injected on the first run only; the second run found
        // an already-drained queue.
        assert_eq!(spider.processed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_discoveries_are_processed() {
        let dir = TempDir::new().unwrap();
        let (queue, bucket) = create_stores(&dir);
        let reactor = Reactor::new(
            Arc::clone(&queue) as Arc<dyn Queue>,
            Arc::clone(&bucket) as Arc<dyn Bucket>,
            2,
            ReactorOpt::new(),
        )
        .unwrap();

        let mut spider = RecordingSpider::new(&["root"]);
        spider.follow_ups.insert(
            "root".to_string(),
            vec!["leaf-1".to_string(), "leaf-2".to_string()],
        );
        let spider = Arc::new(spider);
        reactor.run(Arc::clone(&spider) as Arc<dyn Spider>).await.unwrap();

        let mut processed = spider.processed.lock().clone();
        processed.sort();
        assert_eq!(processed, vec!["leaf-1", "leaf-2", "root"]);
    }

    #[tokio::test]
    async fn test_debug_truncates_stores() {
        let dir = TempDir::new().unwrap();
        let (queue, bucket) = create_stores(&dir);
        queue.add("stale", Priority::P0).unwrap();
        bucket.set("marker", "1").unwrap();

        Reactor::new(
            Arc::clone(&queue) as Arc<dyn Queue>,
            Arc::clone(&bucket) as Arc<dyn Bucket>,
            1,
            ReactorOpt::new().debug(true),
        )
        .unwrap();

        assert!(queue.length(UrlState::Waiting).unwrap().is_empty());
        assert!(matches!(bucket.get("marker"), Err(StorageError::NotExist)));
    }
}
