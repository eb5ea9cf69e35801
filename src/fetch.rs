use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::cache::Resource;
use crate::error::FetchError;

const BASE_BACKOFF_MS: u64 = 500;

/// Anything that can turn an identifier into bytes plus a media type.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Resource, FetchError>;
}

/// Plain HTTP GET with a required `Content-Type`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Resource, FetchError> {
        let http = |source| FetchError::Http {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(http)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(media_type)
            .ok_or_else(|| FetchError::MissingContentType {
                url: url.to_string(),
            })?;
        let body = resp.bytes().await.map_err(http)?;
        Ok(Resource::new(mime, body.to_vec()))
    }
}

/// Resolves document identifiers: URLs over HTTP (retrying transient
/// failures), everything else from the local filesystem.
pub struct Resolver {
    http: HttpFetcher,
    retries: u32,
}

impl Resolver {
    pub fn new(http: HttpFetcher, retries: u32) -> Self {
        Resolver { http, retries }
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<Resource, FetchError> {
        let mut attempt = 0;
        loop {
            match self.http.fetch(url).await {
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    let backoff = Duration::from_millis(BASE_BACKOFF_MS * 2u64.pow(attempt));
                    attempt += 1;
                    warn!(
                        "{} (attempt {}/{}), backing off {:.1}s",
                        e,
                        attempt,
                        self.retries,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl Fetcher for Resolver {
    async fn fetch(&self, id: &str) -> Result<Resource, FetchError> {
        if is_url(id) {
            return self.fetch_with_retry(id).await;
        }
        let data = tokio::fs::read(id).await.map_err(|source| FetchError::Io {
            path: id.to_string(),
            source,
        })?;
        Ok(Resource::new(guess_mime(Path::new(id)), data))
    }
}

pub fn is_url(id: &str) -> bool {
    id.starts_with("http://") || id.starts_with("https://")
}

/// Media type without parameters: `text/html; charset=utf-8` -> `text/html`.
fn media_type(header: &str) -> Option<String> {
    let mt = header.split(';').next()?.trim().to_ascii_lowercase();
    if mt.is_empty() || !mt.contains('/') {
        None
    } else {
        Some(mt)
    }
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html" | "htm") => "text/html",
        Some("json" | "jsonl") => "application/json",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}
