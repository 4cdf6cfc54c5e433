//! Feed retrieval through an ordered chain of transport strategies.
//!
//! Each strategy (relay or direct request) gets its own deadline. The first strategy whose
//! body decodes as CSV wins; every failure before it is kept so callers can tell which
//! layer broke.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use sheetsync_core::Row;
use sheetsync_csv::DecodeError;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "sheetsync-fetch";

/// Query parameter appended to every attempted url so caches never answer with a stale snapshot.
pub const CACHE_BUST_PARAM: &str = "_ts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    /// `base_url?{target_param}={encoded target}`
    Relay { base_url: String, target_param: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Raw,
    /// Body is a JSON object whose `field` holds the payload text.
    Json { field: String },
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub name: String,
    pub route: Route,
    pub envelope: Envelope,
    pub timeout: Duration,
}

impl StrategyConfig {
    pub fn relay(
        name: impl Into<String>,
        base_url: impl Into<String>,
        target_param: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            route: Route::Relay {
                base_url: base_url.into(),
                target_param: target_param.into(),
            },
            envelope: Envelope::Raw,
            timeout,
        }
    }

    pub fn direct(timeout: Duration) -> Self {
        Self {
            name: "direct".to_string(),
            route: Route::Direct,
            envelope: Envelope::Raw,
            timeout,
        }
    }

    pub fn with_json_envelope(mut self, field: impl Into<String>) -> Self {
        self.envelope = Envelope::Json {
            field: field.into(),
        };
        self
    }
}

/// The stock fallback order: raw relay, JSON-envelope relay, fast-failing relay, direct.
pub fn default_strategies() -> Vec<StrategyConfig> {
    vec![
        StrategyConfig::relay(
            "primary relay",
            "https://corsproxy.io/",
            "url",
            Duration::from_secs(25),
        ),
        StrategyConfig::relay(
            "envelope relay",
            "https://api.allorigins.win/get",
            "url",
            Duration::from_secs(25),
        )
        .with_json_envelope("contents"),
        StrategyConfig::relay(
            "fallback relay",
            "https://api.codetabs.com/v1/proxy",
            "quest",
            Duration::from_secs(15),
        ),
        StrategyConfig::direct(Duration::from_secs(5)),
    ]
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub user_agent: Option<String>,
    pub strategies: Vec<StrategyConfig>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            strategies: default_strategies(),
        }
    }
}

/// Why a single strategy attempt failed. Always recovered by moving to the next strategy.
#[derive(Debug, Error)]
pub enum TransportFailure {
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid relay envelope: {0}")]
    Envelope(String),
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Error)]
#[error("[{strategy}] {error}")]
pub struct AttemptFailure {
    pub strategy: String,
    pub error: TransportFailure,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("all fetch strategies exhausted after {} attempts; last error: {}", .attempts.len(), last_detail(.attempts))]
    AllStrategiesExhausted { attempts: Vec<AttemptFailure> },
}

impl FetchError {
    pub fn attempts(&self) -> &[AttemptFailure] {
        match self {
            Self::AllStrategiesExhausted { attempts } => attempts,
        }
    }
}

fn last_detail(attempts: &[AttemptFailure]) -> String {
    attempts
        .last()
        .map(ToString::to_string)
        .unwrap_or_else(|| "no fetch strategies configured".to_string())
}

/// One transport method for retrieving a feed body.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Hard deadline for one attempt; the in-flight request is dropped when it elapses.
    fn timeout(&self) -> Duration;

    async fn attempt(&self, url: &str) -> Result<String, TransportFailure>;
}

/// Reqwest-backed strategy covering both relayed and direct requests.
#[derive(Debug, Clone)]
pub struct HttpStrategy {
    config: StrategyConfig,
    client: reqwest::Client,
}

impl HttpStrategy {
    pub fn new(config: StrategyConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    pub fn request_url(&self, target: &str) -> Result<Url, TransportFailure> {
        let parsed = match &self.config.route {
            Route::Direct => Url::parse(target),
            Route::Relay {
                base_url,
                target_param,
            } => Url::parse_with_params(base_url, &[(target_param.as_str(), target)]),
        };
        parsed.map_err(|err| TransportFailure::InvalidUrl {
            url: target.to_string(),
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl FetchStrategy for HttpStrategy {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    async fn attempt(&self, url: &str) -> Result<String, TransportFailure> {
        let request_url = self.request_url(url)?;
        let resp = self.client.get(request_url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportFailure::Status {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        let body = resp.text().await?;
        match &self.config.envelope {
            Envelope::Raw => Ok(body),
            Envelope::Json { field } => unwrap_envelope(&body, field),
        }
    }
}

/// Pull the payload text out of a relay's JSON envelope.
///
/// An embedded `status.http_code` outside 2xx is reported as a status failure, since such
/// relays answer 200 even when the upstream request failed.
pub fn unwrap_envelope(body: &str, field: &str) -> Result<String, TransportFailure> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|err| TransportFailure::Envelope(format!("body is not JSON: {err}")))?;

    if let Some(code) = value
        .get("status")
        .and_then(|s| s.get("http_code"))
        .and_then(|c| c.as_u64())
    {
        if !(200..300).contains(&code) {
            let url = value
                .get("status")
                .and_then(|s| s.get("url"))
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string();
            return Err(TransportFailure::Status {
                status: u16::try_from(code).unwrap_or(u16::MAX),
                url,
            });
        }
    }

    value
        .get(field)
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| TransportFailure::Envelope(format!("missing string field `{field}`")))
}

/// Appends a strictly increasing [`CACHE_BUST_PARAM`] value to urls.
#[derive(Debug)]
pub struct CacheBuster {
    next: AtomicU64,
}

impl Default for CacheBuster {
    fn default() -> Self {
        Self::starting_at(Utc::now().timestamp_millis().max(0) as u64)
    }
}

impl CacheBuster {
    pub fn starting_at(seed: u64) -> Self {
        Self {
            next: AtomicU64::new(seed),
        }
    }

    pub fn apply(&self, url: &str) -> Result<String, TransportFailure> {
        let mut parsed = Url::parse(url).map_err(|err| TransportFailure::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        let stamp = self.next.fetch_add(1, Ordering::SeqCst);
        parsed
            .query_pairs_mut()
            .append_pair(CACHE_BUST_PARAM, &stamp.to_string());
        Ok(parsed.into())
    }
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub rows: Vec<Row>,
    /// Name of the strategy that produced `rows`.
    pub strategy: String,
    /// Failed attempts that preceded the successful one, in order.
    pub failures: Vec<AttemptFailure>,
}

pub struct FetchChain {
    strategies: Vec<Arc<dyn FetchStrategy>>,
    cache_buster: CacheBuster,
}

impl FetchChain {
    pub fn new(strategies: Vec<Arc<dyn FetchStrategy>>) -> Self {
        Self {
            strategies,
            cache_buster: CacheBuster::default(),
        }
    }

    pub fn from_config(config: &FetchConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        let strategies = config
            .strategies
            .iter()
            .cloned()
            .map(|s| Arc::new(HttpStrategy::new(s, client.clone())) as Arc<dyn FetchStrategy>)
            .collect();
        Ok(Self::new(strategies))
    }

    pub fn with_cache_buster(mut self, cache_buster: CacheBuster) -> Self {
        self.cache_buster = cache_buster;
        self
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Try each strategy in order until one returns a body that decodes as CSV.
    pub async fn fetch(&self, url: &str) -> Result<FetchOutcome, FetchError> {
        let mut failures = Vec::new();

        for strategy in &self.strategies {
            let span = info_span!("fetch_attempt", strategy = strategy.name(), url);
            let result = self.attempt_decode(strategy.as_ref(), url).instrument(span).await;

            match result {
                Ok(rows) => {
                    info!(
                        strategy = strategy.name(),
                        rows = rows.len(),
                        prior_failures = failures.len(),
                        "feed fetched"
                    );
                    return Ok(FetchOutcome {
                        rows,
                        strategy: strategy.name().to_string(),
                        failures,
                    });
                }
                Err(error) => {
                    warn!(strategy = strategy.name(), url, %error, "fetch strategy failed");
                    failures.push(AttemptFailure {
                        strategy: strategy.name().to_string(),
                        error,
                    });
                }
            }
        }

        Err(FetchError::AllStrategiesExhausted { attempts: failures })
    }

    async fn attempt_decode(
        &self,
        strategy: &dyn FetchStrategy,
        url: &str,
    ) -> Result<Vec<Row>, TransportFailure> {
        let target = self.cache_buster.apply(url)?;
        let deadline = strategy.timeout();
        let body = tokio::time::timeout(deadline, strategy.attempt(&target))
            .await
            .map_err(|_| TransportFailure::Timeout { after: deadline })??;
        Ok(sheetsync_csv::decode(&body)?)
    }
}
