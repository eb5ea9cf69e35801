//! Worker pool in front of the resource cache.
//!
//! Callers submit a job on a bounded channel and wait on a private oneshot
//! for the answer; whichever worker is idle serves it. Cache reads and
//! inserts happen under one mutex, the network fetch happens outside it.
//! Two workers missing on the same key will both fetch it.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::cache::{Resource, ResourceCache};
use crate::error::FetchError;
use crate::fetch::Fetcher;

struct Job {
    url: String,
    responder: oneshot::Sender<Result<Resource, FetchError>>,
}

struct Shared {
    cache: Mutex<ResourceCache>,
    fetcher: Arc<dyn Fetcher>,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

/// Cheap handle; the workers exit once every clone has been dropped.
#[derive(Clone)]
pub struct FetchDispatcher {
    jobs: mpsc::Sender<Job>,
    shared: Arc<Shared>,
}

impl FetchDispatcher {
    /// Start `nworkers` fetch workers sharing one cache of `capacity` entries.
    pub fn spawn(
        fetcher: Arc<dyn Fetcher>,
        nworkers: usize,
        capacity: NonZeroUsize,
        queue: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(queue.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shared = Arc::new(Shared {
            cache: Mutex::new(ResourceCache::new(capacity)),
            fetcher,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        });

        debug!(
            workers = nworkers,
            capacity = shared.lock_cache().capacity(),
            "fetch dispatcher started"
        );
        for worker in 0..nworkers.max(1) {
            let rx = Arc::clone(&rx);
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    // Hold the receiver lock only while waiting for the next job.
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else { break };
                    trace!(worker, url = %job.url, "fetch job");
                    let result = shared.fetch(&job.url).await;
                    // Caller may have gone away; nothing to do about it.
                    let _ = job.responder.send(result);
                }
                trace!(worker, "fetch worker stopped");
            });
        }

        FetchDispatcher { jobs: tx, shared }
    }

    /// Fetch `url` through the pool, blocking until a worker has served it.
    pub async fn fetch(&self, url: &str) -> Result<Resource, FetchError> {
        let (responder, done) = oneshot::channel();
        let job = Job {
            url: url.to_string(),
            responder,
        };
        self.jobs
            .send(job)
            .await
            .map_err(|_| FetchError::DispatcherClosed)?;
        done.await.map_err(|_| FetchError::DispatcherClosed)?
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub fn cached(&self) -> usize {
        self.shared.lock_cache().len()
    }
}

impl Shared {
    fn lock_cache(&self) -> std::sync::MutexGuard<'_, ResourceCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch(&self, url: &str) -> Result<Resource, FetchError> {
        let cached = self.lock_cache().get(url);
        if let Some(hit) = cached {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        match self.fetcher.fetch(url).await {
            Ok(resource) => {
                let evicted = self.lock_cache().insert(url.to_string(), resource.clone());
                if let Some(evicted) = evicted {
                    debug!("resource cache evicted {}", evicted);
                }
                Ok(resource)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}
