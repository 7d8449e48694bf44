//! Rotating proxy pool.
//!
//! A feeder task multiplexes every provider stream into one bounded ready
//! channel, fanning each endpoint out into `proxy_parallels` replicas. The
//! put-back buffer is re-injected ahead of new provider output, a TTL
//! black-list drops banned URLs at both intake and acquisition, and the
//! freeze list parks all replicas of a URL until their thaw time.
//!
//! Lock order: pool (ready receiver) -> freeze; freeze -> put-back. Never
//! the reverse.

use crate::config::Config;
use crate::proxy::{Proxy, ProxyEndpoint, ProxyError, ProxyStream};
use dashmap::DashSet;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How long the feeder waits on providers before re-checking put-back.
const FEEDER_POLL: Duration = Duration::from_millis(200);

struct FreezeEntry {
    thaw_at: Instant,
    parked: Vec<Proxy>,
}

type PutBack = Mutex<VecDeque<Proxy>>;
type BlackList = Mutex<HashMap<String, Instant>>;
type FreezeList = Mutex<HashMap<String, FreezeEntry>>;

pub struct ProxyPool {
    // Exclusive access to the receiver doubles as the pool lock: one
    // worker acquires at a time.
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<Proxy>>,
    put_back: Arc<PutBack>,
    pool_filter: Arc<DashSet<String>>,
    black_list: Arc<BlackList>,
    freeze_list: Arc<FreezeList>,
    feeder: JoinHandle<()>,
    thaw: JoinHandle<()>,
}

impl ProxyPool {
    /// Spawn the feeder and thaw tasks over the given providers. The ready
    /// channel holds up to `2 * parallels` proxies; each provider URL is
    /// fanned out into `proxy_parallels` replicas.
    pub fn start(
        providers: Vec<ProxyStream>,
        parallels: usize,
        proxy_parallels: usize,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(parallels.max(1) * 2);
        let put_back: Arc<PutBack> = Arc::new(Mutex::new(VecDeque::new()));
        let pool_filter: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let black_list: Arc<BlackList> = Arc::new(Mutex::new(HashMap::new()));
        let freeze_list: Arc<FreezeList> = Arc::new(Mutex::new(HashMap::new()));

        let feeder = tokio::spawn(feeder_loop(
            providers,
            ready_tx,
            Arc::clone(&put_back),
            Arc::clone(&pool_filter),
            Arc::clone(&black_list),
            proxy_parallels,
        ));
        let thaw = tokio::spawn(thaw_loop(
            Arc::clone(&freeze_list),
            Arc::clone(&put_back),
        ));

        Self {
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            put_back,
            pool_filter,
            black_list,
            freeze_list,
            feeder,
            thaw,
        }
    }

    /// Take one usable proxy. Holds the pool lock for the whole call and
    /// makes at most `ready.len() + 1` attempts within a hard deadline:
    /// banned and expired proxies are dropped, frozen ones are parked.
    pub async fn acquire(&self) -> Result<Proxy, ProxyError> {
        let mut ready = self.ready_rx.lock().await;
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(Config::PROXY_ACQUIRE_TIMEOUT_SECS);

        let attempts = ready.len() + 1;
        for _ in 0..attempts {
            let proxy = match tokio::time::timeout_at(deadline, ready.recv()).await {
                Err(_) => return Err(ProxyError::Timeout),
                Ok(None) => return Err(ProxyError::Drained),
                Ok(Some(proxy)) => proxy,
            };

            if self.is_black_listed(&proxy.url) {
                debug!(url = %proxy.url, "dropping black-listed proxy");
                self.pool_filter.remove(&proxy.pool_key());
                continue;
            }
            if proxy.is_expired() {
                debug!(url = %proxy.url, "dropping expired proxy");
                self.pool_filter.remove(&proxy.pool_key());
                continue;
            }

            let url = proxy.url.clone();
            let mut freeze_list = self.freeze_list.lock();
            if let Some(entry) = freeze_list.get_mut(&url) {
                entry.parked.push(proxy);
                drop(freeze_list);
                debug!(url = %url, "parking frozen proxy");
                continue;
            }
            drop(freeze_list);

            return Ok(proxy);
        }
        Err(ProxyError::Busy)
    }

    /// Return an unharmed proxy ahead of new provider output.
    pub fn put_back(&self, proxy: Proxy) {
        self.put_back.lock().push_back(proxy);
    }

    /// Park the proxy and every same-URL replica arriving within `d`.
    pub fn freeze(&self, proxy: Proxy, d: Duration) {
        let thaw_at = Instant::now() + d;
        let mut freeze_list = self.freeze_list.lock();
        match freeze_list.get_mut(&proxy.url) {
            Some(entry) => {
                entry.thaw_at = thaw_at;
                entry.parked.push(proxy);
            }
            None => {
                freeze_list.insert(
                    proxy.url.clone(),
                    FreezeEntry {
                        thaw_at,
                        parked: vec![proxy],
                    },
                );
            }
        }
    }

    /// TTL-ban the proxy URL and drop this instance.
    pub fn forbid(&self, proxy: Proxy, d: Duration) {
        self.black_list
            .lock()
            .insert(proxy.url.clone(), Instant::now() + d);
        self.pool_filter.remove(&proxy.pool_key());
    }

    /// Drop this proxy instance, releasing its pool-filter key so the
    /// provider can re-issue it.
    pub fn discard(&self, proxy: Proxy) {
        self.pool_filter.remove(&proxy.pool_key());
    }

    fn is_black_listed(&self, url: &str) -> bool {
        let mut black_list = self.black_list.lock();
        match black_list.get(url) {
            Some(expires) if *expires > Instant::now() => true,
            Some(_) => {
                black_list.remove(url);
                false
            }
            None => false,
        }
    }
}

impl Drop for ProxyPool {
    fn drop(&mut self) {
        self.feeder.abort();
        self.thaw.abort();
    }
}

/// providers -> ready, put-back first.
async fn feeder_loop(
    providers: Vec<ProxyStream>,
    ready_tx: mpsc::Sender<Proxy>,
    put_back: Arc<PutBack>,
    pool_filter: Arc<DashSet<String>>,
    black_list: Arc<BlackList>,
    proxy_parallels: usize,
) {
    let mut merged = stream::select_all(providers);
    loop {
        // Drain the put-back buffer fully, oldest first.
        loop {
            let next = put_back.lock().pop_front();
            match next {
                Some(proxy) => {
                    debug!(url = %proxy.url, index = proxy.index, "re-queueing put-back proxy");
                    if ready_tx.send(proxy).await.is_err() {
                        return;
                    }
                }
                None => break,
            }
        }

        // Then take one endpoint from whichever provider has output,
        // coming back around regularly so put-backs are not starved.
        let endpoint = match tokio::time::timeout(FEEDER_POLL, merged.next()).await {
            Err(_) => continue,
            Ok(None) => {
                info!("all proxy providers closed, feeder exiting");
                return;
            }
            Ok(Some(endpoint)) => endpoint,
        };

        let banned = {
            let black_list = black_list.lock();
            black_list
                .get(&endpoint.url)
                .map(|expires| *expires > Instant::now())
                .unwrap_or(false)
        };
        if banned {
            debug!(url = %endpoint.url, "provider endpoint is black-listed, skipping");
            continue;
        }

        for index in 0..proxy_parallels {
            let key = format!("{}:{}", endpoint.url, index);
            if endpoint.enable_filter && pool_filter.contains(&key) {
                debug!(key = %key, "replica already pooled, skipping");
                continue;
            }
            pool_filter.insert(key);
            let proxy = Proxy {
                url: endpoint.url.clone(),
                index,
                create_time: SystemTime::now(),
                expired_time: None,
            };
            if ready_tx.send(proxy).await.is_err() {
                return;
            }
        }
    }
}

/// freeze -> put-back, once per second.
async fn thaw_loop(freeze_list: Arc<FreezeList>, put_back: Arc<PutBack>) {
    let mut tick =
        tokio::time::interval(Duration::from_secs(Config::THAW_SCAN_INTERVAL_SECS));
    loop {
        tick.tick().await;
        let now = Instant::now();

        let mut thawed = Vec::new();
        {
            let mut freeze_list = freeze_list.lock();
            let due: Vec<String> = freeze_list
                .iter()
                .filter(|(_, entry)| entry.thaw_at <= now)
                .map(|(url, _)| url.clone())
                .collect();
            for url in due {
                if let Some(entry) = freeze_list.remove(&url) {
                    debug!(url = %url, count = entry.parked.len(), "thawing proxies");
                    thawed.extend(entry.parked);
                }
            }
        }
        if !thawed.is_empty() {
            let mut put_back = put_back.lock();
            for proxy in thawed {
                put_back.push_back(proxy);
            }
        }
    }
}
