use crate::config::{RetryConfig, ScraperConfig};
use crate::error::FetchError;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

/// Backoff schedule: `base * multiplier^n`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Sleeps between attempts; one fewer than `max_attempts`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let (base, multiplier, cap) = (self.base_delay, self.multiplier.max(1.0), self.max_delay);
        (0..self.max_attempts.saturating_sub(1) as i32).map(move |n| {
            let delay = base.mul_f64(multiplier.powi(n));
            delay.min(cap)
        })
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            multiplier: cfg.multiplier,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

pub struct HttpClient {
    inner: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig, retry: &RetryConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Accept cookies so session-based pages work
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            policy: RetryPolicy::from(retry),
        })
    }

    /// Fetch a URL as text, retrying transient failures with backoff.
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt = 0u32;
        let max_attempts = self.policy.max_attempts;

        RetryIf::spawn(
            self.policy.delays(),
            || {
                attempt += 1;
                debug!("GET {} (attempt {}/{})", url, attempt, max_attempts);
                self.get_once(url)
            },
            |e: &FetchError| {
                let retry = e.is_transient();
                if retry {
                    warn!("Retrying after: {}", e);
                }
                retry
            },
        )
        .await
    }

    async fn get_once(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .inner
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                url: url.to_string(),
                status,
            });
        }

        resp.text().await.map_err(|e| FetchError::from_reqwest(url, e))
    }
}
