use std::num::NonZeroUsize;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use lru::LruCache;

/// Fetched payload: media type plus raw bytes. Cloning shares the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub mime: String,
    pub data: Arc<[u8]>,
}

impl Resource {
    pub fn new(mime: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Resource {
            mime: mime.into(),
            data: data.into(),
        }
    }

    /// `data:<mime>;base64,<payload>`
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.data))
    }
}

/// Bounded least-recently-used map from resource URL to payload.
///
/// Not synchronized; the dispatcher wraps it in a single mutex.
pub struct ResourceCache {
    inner: LruCache<String, Resource>,
}

impl ResourceCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        ResourceCache {
            inner: LruCache::new(capacity),
        }
    }

    /// Cached payload for `key`, marking it most recently used.
    pub fn get(&mut self, key: &str) -> Option<Resource> {
        self.inner.get(key).cloned()
    }

    /// Insert under `key`. Returns the evicted key, if the cache was full.
    pub fn insert(&mut self, key: String, resource: Resource) -> Option<String> {
        match self.inner.push(key, resource) {
            Some((evicted, _)) if !self.inner.contains(&evicted) => Some(evicted),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }
}
