//! HTTP transport contract. Only the contract is owned by this crate; the
//! facade (out of scope) may inject any implementation. `ReqwestTransport`
//! is shipped as the default so the crate is usable and testable standalone.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Raw response: status code, body bytes, and response headers lower-cased
/// by key so callers can look up `etag`/`last-modified` case-insensitively.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }
}

/// Thread-safe HTTP transport with hot-swappable timeouts.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, headers: &HashMap<String, String>) -> Result<HttpResponse>;
    async fn post(
        &self,
        url: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<HttpResponse>;

    /// Swap the connect/read timeouts used by subsequent calls.
    fn set_timeouts(&self, connect: Duration, read: Duration);
}

/// Default transport backed by `reqwest`. Timeouts are held in an
/// `arc_swap::ArcSwap` so they can be updated without rebuilding the
/// underlying client or taking a lock on the hot path.
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeouts: arc_swap::ArcSwap<(Duration, Duration)>,
}

impl ReqwestTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        ReqwestTransport {
            client: reqwest::Client::new(),
            timeouts: arc_swap::ArcSwap::from_pointee((connect_timeout, read_timeout)),
        }
    }

    fn to_response(status: reqwest::StatusCode, headers: &reqwest::header::HeaderMap, body: Vec<u8>) -> HttpResponse {
        let mut map = HashMap::with_capacity(headers.len());
        for (name, value) in headers.iter() {
            if let Ok(v) = value.to_str() {
                map.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }
        HttpResponse {
            status: status.as_u16(),
            body,
            headers: map,
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(10))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, headers: &HashMap<String, String>) -> Result<HttpResponse> {
        let (connect, read) = *self.timeouts.load().as_ref();
        let mut builder = self.client.get(url).timeout(connect + read);
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let hdrs = resp.headers().clone();
        let body = resp.bytes().await?.to_vec();
        Ok(Self::to_response(status, &hdrs, body))
    }

    async fn post(
        &self,
        url: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<HttpResponse> {
        let (connect, read) = *self.timeouts.load().as_ref();
        let mut builder = self
            .client
            .post(url)
            .timeout(connect + read)
            .body(body.to_vec());
        for (k, v) in headers {
            builder = builder.header(k, v);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let hdrs = resp.headers().clone();
        let respbody = resp.bytes().await?.to_vec();
        Ok(Self::to_response(status, &hdrs, respbody))
    }

    fn set_timeouts(&self, connect: Duration, read: Duration) {
        self.timeouts.store(std::sync::Arc::new((connect, read)));
    }
}

/// Transport wrapper that fails every call with a network error. Used by
/// offline mode so fetchers don't need their own offline branch.
pub struct OfflineTransport;

#[async_trait]
impl HttpTransport for OfflineTransport {
    async fn get(&self, _url: &str, _headers: &HashMap<String, String>) -> Result<HttpResponse> {
        Err(Error::network("offline mode: request suppressed"))
    }

    async fn post(
        &self,
        _url: &str,
        _body: &[u8],
        _headers: &HashMap<String, String>,
    ) -> Result<HttpResponse> {
        Err(Error::network("offline mode: request suppressed"))
    }

    fn set_timeouts(&self, _connect: Duration, _read: Duration) {}
}
