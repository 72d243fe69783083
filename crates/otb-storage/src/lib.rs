//! HTTP session + persistence contracts for Over The Board.

pub mod postgres;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use otb_core::Site;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

pub use postgres::PgStore;
pub use store::{EntityStore, MemoryStore, StoreError, WipeScope};

pub const CRATE_NAME: &str = "otb-storage";

pub const DEFAULT_USER_AGENT: &str =
    "OverTheBoardBot/1.0 (+https://github.com/Emersh0w/Over-The-Board)";
pub const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7";
pub const DEFAULT_REFERER: &str = "https://www.cbx.org.br/";
pub const JSON_ACCEPT: &str = "application/json, text/javascript, */*; q=0.01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status.as_u16() {
        429 | 500 | 502 | 503 | 504 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Connection-level failures, including a body that was cut off mid-stream.
pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    /// Three attempts in total: 1s then 2s between them.
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub referer: Option<String>,
    pub backoff: BackoffPolicy,
    /// Sent on every request after the fixed headers above.
    pub extra_headers: Vec<(String, String)>,
    /// Caps requests in flight on one session. `None` leaves it unbounded.
    pub max_in_flight: Option<usize>,
}

impl Default for HttpSessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept: DEFAULT_ACCEPT.to_string(),
            accept_language: DEFAULT_ACCEPT_LANGUAGE.to_string(),
            referer: Some(DEFAULT_REFERER.to_string()),
            backoff: BackoffPolicy::default(),
            extra_headers: Vec::new(),
            max_in_flight: None,
        }
    }
}

impl HttpSessionConfig {
    /// JSON endpoints that only answer what looks like an XHR from `referer`.
    pub fn xhr(referer: impl Into<String>) -> Self {
        Self {
            accept: JSON_ACCEPT.to_string(),
            referer: Some(referer.into()),
            extra_headers: vec![("X-Requested-With".to_string(), "XMLHttpRequest".to_string())],
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {message}")]
    Json { url: String, message: String },
    #[error("request limiter closed")]
    LimiterClosed,
}

/// The three request shapes a scraping run needs. Implemented by [`HttpSession`] and by
/// scripted fakes in tests.
#[async_trait]
pub trait FormTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<String, FetchError>;

    /// POSTs `application/x-www-form-urlencoded` fields in the given order.
    async fn post_form(&self, url: &str, fields: &[(String, String)]) -> Result<String, FetchError>;

    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError>;
}

/// Opens a fresh transport for one sync invocation against `site`.
pub trait SessionFactory: Send + Sync {
    fn open(&self, site: Site) -> anyhow::Result<Arc<dyn FormTransport>>;
}

/// Cookie-carrying reqwest client with fixed headers, timeouts and retry/backoff.
#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    in_flight: Option<Arc<Semaphore>>,
}

impl HttpSession {
    pub fn new(config: HttpSessionConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_str(&config.accept).context("invalid Accept header")?,
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language)
                .context("invalid Accept-Language header")?,
        );
        if let Some(referer) = &config.referer {
            headers.insert(
                header::REFERER,
                HeaderValue::from_str(referer).context("invalid Referer header")?,
            );
        }
        for (name, value) in &config.extra_headers {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes()).with_context(|| format!("invalid header name {name}"))?,
                HeaderValue::from_str(value).with_context(|| format!("invalid value for header {name}"))?,
            );
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
            in_flight: config
                .max_in_flight
                .map(|limit| Arc::new(Semaphore::new(limit.max(1)))),
        })
    }

    async fn send_text<F>(&self, method: &'static str, url: &str, build: F) -> Result<String, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let _permit = match &self.in_flight {
            Some(limit) => Some(limit.acquire().await.map_err(|_| FetchError::LimiterClosed)?),
            None => None,
        };

        let span = info_span!("http_request", method, url);
        async {
            let mut attempt = 0usize;
            loop {
                let started = Instant::now();
                let (disposition, err) = match build(&self.client).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            match resp.text().await {
                                Ok(body) => {
                                    debug!(
                                        status = status.as_u16(),
                                        elapsed_ms = started.elapsed().as_millis() as u64,
                                        bytes = body.len(),
                                        "http response"
                                    );
                                    return Ok(body);
                                }
                                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
                            }
                        } else {
                            (
                                classify_status(status),
                                FetchError::HttpStatus {
                                    status: status.as_u16(),
                                    url: final_url,
                                },
                            )
                        }
                    }
                    Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
                };

                if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl FormTransport for HttpSession {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        self.send_text("GET", url, |client| client.get(url)).await
    }

    async fn post_form(&self, url: &str, fields: &[(String, String)]) -> Result<String, FetchError> {
        self.send_text("POST", url, |client| client.post(url).form(fields))
            .await
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let body = self
            .send_text("GET", url, |client| client.get(url).query(query))
            .await?;
        serde_json::from_str(&body).map_err(|err| FetchError::Json {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

/// Builds one [`HttpSession`] (own cookie jar, own form state) per call, with the
/// headers of the site it will talk to.
#[derive(Debug, Clone, Default)]
pub struct HttpSessionFactory {
    default: HttpSessionConfig,
    per_site: HashMap<Site, HttpSessionConfig>,
}

impl HttpSessionFactory {
    pub fn new(default: HttpSessionConfig) -> Self {
        Self {
            default,
            per_site: HashMap::new(),
        }
    }

    pub fn with_site(mut self, site: Site, config: HttpSessionConfig) -> Self {
        self.per_site.insert(site, config);
        self
    }

    pub fn config_for(&self, site: Site) -> &HttpSessionConfig {
        self.per_site.get(&site).unwrap_or(&self.default)
    }
}

impl SessionFactory for HttpSessionFactory {
    fn open(&self, site: Site) -> anyhow::Result<Arc<dyn FormTransport>> {
        let session = HttpSession::new(self.config_for(site).clone())
            .with_context(|| format!("opening {} session", site.as_str()))?;
        Ok(Arc::new(session))
    }
}
