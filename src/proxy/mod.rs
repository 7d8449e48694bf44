//! Proxy rotation: provider contract, pool types and the handler-facing
//! disposition helper.

pub mod pool;
pub mod provider;

pub use pool::ProxyPool;

use futures_util::stream::Stream;
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no proxy became available within the acquisition deadline")]
    Timeout,

    #[error("proxy pool busy: every buffered proxy was unusable")]
    Busy,

    #[error("all providers have closed and the pool drained")]
    Drained,
}

/// One item emitted by a provider. `enable_filter` asks the pool to keep at
/// most one live instance per `(url, replica)` pair; providers that hand
/// out the same endpoint forever (tunnels) leave it off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub url: String,
    pub enable_filter: bool,
}

/// A provider is a lazy, unbounded stream of endpoints. Ending the stream
/// removes the provider from the pool.
pub type ProxyStream = Pin<Box<dyn Stream<Item = ProxyEndpoint> + Send>>;

/// A ready-to-use proxy handed to exactly one worker at a time.
///
/// `index` is the replica number: each provider URL is cloned
/// `proxy_parallels` times so that many concurrent uses of the same
/// upstream are possible, and the pool filter keys off `"url:index"`.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub url: String,
    pub index: usize,
    pub create_time: SystemTime,
    /// `None` means the proxy never expires.
    pub expired_time: Option<SystemTime>,
}

impl Proxy {
    pub(crate) fn pool_key(&self) -> String {
        format!("{}:{}", self.url, self.index)
    }

    pub(crate) fn is_expired(&self) -> bool {
        match self.expired_time {
            Some(at) => at < SystemTime::now(),
            None => false,
        }
    }
}

/// What a worker should do with its proxy after the handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyFlag {
    Unset,
    PutBack,
    Forbidden,
    Delete,
    Freeze,
}

/// Handler-facing disposition control. The handler calls at most one of the
/// setters; leaving the flag unset returns the proxy to the pool, unless
/// the handler errored, in which case the reactor downgrades to delete.
#[derive(Debug)]
pub struct ProxyHelper {
    flag: ProxyFlag,
    duration: Duration,
}

impl ProxyHelper {
    pub(crate) fn new() -> Self {
        Self {
            flag: ProxyFlag::Unset,
            duration: Duration::ZERO,
        }
    }

    /// Return the proxy to the pool ahead of new provider output.
    pub fn put_back(&mut self) {
        self.flag = ProxyFlag::PutBack;
    }

    /// Ban the proxy URL for `d`; all replicas are discarded on sight until
    /// the ban lapses.
    pub fn forbid(&mut self, d: Duration) {
        self.flag = ProxyFlag::Forbidden;
        self.duration = d;
    }

    /// Park the proxy URL for `d`; replicas arriving meanwhile are parked
    /// alongside and everything re-enters the pool together after thaw.
    pub fn freeze(&mut self, d: Duration) {
        self.flag = ProxyFlag::Freeze;
        self.duration = d;
    }

    /// Drop this proxy instance.
    pub fn delete(&mut self) {
        self.flag = ProxyFlag::Delete;
    }

    pub(crate) fn flag(&self) -> ProxyFlag {
        self.flag
    }

    pub(crate) fn duration(&self) -> Duration {
        self.duration
    }

    pub(crate) fn is_unset(&self) -> bool {
        self.flag == ProxyFlag::Unset
    }
}
