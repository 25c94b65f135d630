//! `OriginSource`: the abstraction over the remote origin.
//!
//! A single `reqwest`-backed implementation covers both variants described
//! by the design — a plain HTTP source with optional proxy/user-agent, and
//! a header-augmented source for authenticated origins — by making the
//! extra-header map mandatory-but-checked in the latter's constructor
//! rather than forking the type. Cancellation is a `CancellationToken`
//! (teacher's oneshot-cancel-channel idea, expressed with the token type
//! tokio_util already gives us) threaded into the byte stream so a reader
//! that drops the stream or calls `cancel()` unblocks promptly either way.
//! The token is reissued at the start of every `fetch()`, so a cancel only
//! reaches whatever call is in flight at that moment and never sticks
//! around to poison fetches made later on the same source.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{CacheConfig, CacheError};
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use tokio::sync::OnceCell;
use tokio_stream::StreamExt as TokioStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Result of a successful `HEAD`.
#[derive(Debug, Clone)]
pub struct HeadInfo {
    pub total_size: u64,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
}

#[async_trait]
pub trait OriginSource: Send + Sync {
    async fn head(&self) -> Result<HeadInfo, CacheError>;
    async fn fetch(&self, start: u64, end: u64) -> Result<BoxStream<'static, Result<Bytes, CacheError>>, CacheError>;
    fn cancel(&self);
    async fn dispose(&self);
}

/// `reqwest`-backed `OriginSource`. Constructed per-resource by the manager.
pub struct HttpOriginSource {
    client: reqwest::Client,
    url: String,
    user_agent: Option<String>,
    extra_headers: HeaderMap,
    // Reissued at the start of every fetch() so cancelling one in-flight
    // request (a player seek, a disconnect) can't poison later fetches on
    // the same source — only dispose() is meant to be terminal.
    cancel: Mutex<CancellationToken>,
    head_cache: OnceCell<HeadInfo>,
}

impl HttpOriginSource {
    /// Plain variant: proxy and user-agent are optional, extra headers may
    /// be empty.
    pub fn new(url: impl Into<String>, config: &CacheConfig) -> Result<Self, CacheError> {
        Self::build(url.into(), config, HeaderMap::new())
    }

    /// Header-augmented variant for authenticated origins: `extra_headers`
    /// must be non-empty, since an "authenticated origin" with no headers
    /// is a caller mistake, not a valid configuration.
    pub fn with_headers(
        url: impl Into<String>,
        config: &CacheConfig,
        extra_headers: std::collections::HashMap<String, String>,
    ) -> Result<Self, CacheError> {
        if extra_headers.is_empty() {
            return Err(CacheError::BadArgument(
                "header-augmented origin source requires at least one header".into(),
            ));
        }
        let mut headers = HeaderMap::new();
        for (k, v) in extra_headers {
            let name = HeaderName::try_from(k.as_str())
                .map_err(|_| CacheError::BadArgument(format!("invalid header name: {k}")))?;
            let value = HeaderValue::from_str(&v)
                .map_err(|_| CacheError::BadArgument(format!("invalid header value for {k}")))?;
            headers.insert(name, value);
        }
        Self::build(url.into(), config, headers)
    }

    fn build(url: String, config: &CacheConfig, mut extra_headers: HeaderMap) -> Result<Self, CacheError> {
        for (k, v) in &config.origin.extra_headers {
            let name = HeaderName::try_from(k.as_str())
                .map_err(|_| CacheError::BadArgument(format!("invalid header name: {k}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|_| CacheError::BadArgument(format!("invalid header value for {k}")))?;
            extra_headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .connect_timeout(Duration::from_secs(15));

        if let Some(proxy_cfg) = &config.origin.proxy {
            let mut proxy_url = proxy_cfg.url.clone();
            if matches!(proxy_cfg.kind, common::config::ProxyKind::Socks5) && !proxy_url.starts_with("socks5://") {
                proxy_url = format!("socks5://{proxy_url}");
            }
            let mut proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| CacheError::BadArgument(format!("invalid proxy url: {e}")))?;
            if let Some(creds) = &proxy_cfg.credentials {
                proxy = proxy.basic_auth(&creds.username, &creds.password);
            }
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| CacheError::BadArgument(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            url,
            user_agent: config.origin.user_agent.clone(),
            extra_headers,
            cancel: Mutex::new(CancellationToken::new()),
            head_cache: OnceCell::new(),
        })
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, &self.url);
        if let Some(ua) = &self.user_agent {
            req = req.header(reqwest::header::USER_AGENT, ua);
        }
        req = req.headers(self.extra_headers.clone());
        req
    }
}

#[async_trait]
impl OriginSource for HttpOriginSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn head(&self) -> Result<HeadInfo, CacheError> {
        if let Some(cached) = self.head_cache.get() {
            return Ok(cached.clone());
        }

        let resp = self
            .request(reqwest::Method::HEAD)
            .send()
            .await
            .map_err(|e| CacheError::OriginUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CacheError::OriginUnavailable(format!(
                "HEAD returned {}",
                resp.status()
            )));
        }

        let total_size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| CacheError::OriginUnavailable("missing Content-Length".into()))?;

        let mime_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let file_name = resp
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition_filename);

        let info = HeadInfo {
            total_size,
            mime_type,
            file_name,
        };

        // best-effort: another concurrent head() may have won the race, in
        // which case we keep using whichever landed first.
        let _ = self.head_cache.set(info.clone());
        Ok(info)
    }

    #[instrument(skip(self), fields(url = %self.url, start, end))]
    async fn fetch(&self, start: u64, end: u64) -> Result<BoxStream<'static, Result<Bytes, CacheError>>, CacheError> {
        let range_value = format!("bytes={start}-{end}");
        let resp = self
            .request(reqwest::Method::GET)
            .header(RANGE, range_value)
            .send()
            .await
            .map_err(|e| CacheError::OriginStreamError(e.to_string()))?;

        if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(CacheError::OriginStreamError(format!(
                "expected 206, origin returned {}",
                resp.status()
            )));
        }

        // Fresh token per fetch: a cancel aborts this call (and any other
        // concurrently in-flight ones) without affecting fetches started
        // afterward.
        let cancel = {
            let mut current = self.cancel.lock().unwrap();
            *current = CancellationToken::new();
            current.clone()
        };
        let stream = resp
            .bytes_stream()
            .map(|item| item.map_err(|e| CacheError::OriginStreamError(e.to_string())))
            .take_until(cancel.cancelled_owned());

        Ok(Box::pin(stream))
    }

    fn cancel(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    async fn dispose(&self) {
        self.cancel.lock().unwrap().cancel();
    }
}

/// Parses `filename=...` out of a `Content-Disposition` header value,
/// handling both the quoted and bare (unescaped) forms.
fn parse_content_disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        let rest = part.strip_prefix("filename=").or_else(|| part.strip_prefix("filename*=UTF-8''"))?;
        let rest = rest.trim();
        let name = rest.trim_matches('"');
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }
    None
}

/// Builds the right `OriginSource` variant for a URL, given the shared
/// `CacheConfig`. Plain HTTP unless `extra_headers` is non-empty, in which
/// case the header-augmented constructor is used (so a config with headers
/// set always goes through the "authenticated origin" path and its
/// validation).
pub fn build_origin_source(url: &str, config: &CacheConfig) -> Result<Arc<dyn OriginSource>, CacheError> {
    if config.origin.extra_headers.is_empty() {
        Ok(Arc::new(HttpOriginSource::new(url, config)?))
    } else {
        Ok(Arc::new(HttpOriginSource::with_headers(
            url,
            config,
            config.origin.extra_headers.clone(),
        )?))
    }
}
