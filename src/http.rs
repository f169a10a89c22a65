//! Retrying HTTP fetcher shared by the lister, resolver, and catalog loader.
//!
//! Every upstream request goes through [`HttpFetcher::get`], which runs an
//! explicit bounded retry loop and returns a tagged [`FetchOutcome`] instead
//! of an error. Callers convert the outcome into a [`HarvestError`] with the
//! identifiers they know about (guide id, planner id).
//!
//! Retry strategy:
//! - HTTP 429 or 5xx → retry with exponential backoff
//! - HTTP 4xx (not 429) → fail immediately
//! - Network error → retry
//!
//! A `Retry-After` header (delta-seconds or HTTP date) on a retryable
//! response replaces the computed backoff for that attempt, capped at
//! [`RetryPolicy::retry_after_cap`].

use std::sync::Arc;
use std::time::Duration;

use build_harvest_core::HarvestError;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::HttpConfig;

/// Retry and backoff parameters for one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of requests issued before giving up (at least 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_after_cap: Duration,
}

impl From<&HttpConfig> for RetryPolicy {
    fn from(http: &HttpConfig) -> Self {
        Self {
            max_attempts: http.max_retries.max(1),
            base_delay: Duration::from_millis(http.base_delay_ms),
            max_delay: Duration::from_millis(http.max_delay_ms),
            retry_after_cap: Duration::from_secs(http.retry_after_cap_secs),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff after the `attempt`-th failed request (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Delay before the next attempt. A server hint wins over backoff.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.retry_after_cap),
            None => self.backoff(attempt),
        }
    }
}

/// Parse a `Retry-After` header value: delta-seconds or an HTTP date.
///
/// Dates in the past yield a zero delay. Unparseable values yield `None`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Result of a retrying fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { body: String, attempts: u32 },
    /// Every attempt failed with a retryable condition.
    Exhausted {
        last_status: Option<u16>,
        attempts: u32,
        message: String,
    },
    /// A non-retryable client error ended the loop early.
    Rejected {
        status: u16,
        attempts: u32,
        message: String,
    },
}

impl FetchOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            FetchOutcome::Success { attempts, .. }
            | FetchOutcome::Exhausted { attempts, .. }
            | FetchOutcome::Rejected { attempts, .. } => *attempts,
        }
    }

    /// Convert into the body, or an upstream error attributed to the given ids.
    pub fn into_body(
        self,
        url: &str,
        guide_id: Option<&str>,
        planner_id: Option<&str>,
    ) -> Result<String, HarvestError> {
        let guide_id = guide_id.map(str::to_string);
        let planner_id = planner_id.map(str::to_string);
        match self {
            FetchOutcome::Success { body, .. } => Ok(body),
            FetchOutcome::Exhausted {
                last_status: Some(429),
                attempts,
                ..
            } => Err(HarvestError::UpstreamRateLimited {
                guide_id,
                planner_id,
                url: url.to_string(),
                status: 429,
                attempts,
            }),
            FetchOutcome::Exhausted {
                last_status,
                attempts,
                message,
            } => Err(HarvestError::UpstreamUnavailable {
                guide_id,
                planner_id,
                url: url.to_string(),
                status: last_status,
                attempts,
                retryable: true,
                message,
            }),
            FetchOutcome::Rejected {
                status,
                attempts,
                message,
            } => Err(HarvestError::UpstreamUnavailable {
                guide_id,
                planner_id,
                url: url.to_string(),
                status: Some(status),
                attempts,
                retryable: false,
                message,
            }),
        }
    }
}

/// Slowest request budget a [`RateLimiter`] accepts: one request per hour.
pub const MIN_REQUESTS_PER_SECOND: f64 = 1.0 / 3600.0;

/// Minimum spacing between request starts against one endpoint.
///
/// Shared through an `Arc` by every worker that talks to the endpoint.
/// Only the caller that takes a slot waits for it; nothing else is paused.
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// Returns `Ok(None)` when `requests_per_second` is zero (no limit).
    pub fn per_second(requests_per_second: f64) -> Result<Option<Self>, HarvestError> {
        if requests_per_second == 0.0 {
            return Ok(None);
        }
        if !(requests_per_second >= MIN_REQUESTS_PER_SECOND && requests_per_second.is_finite()) {
            return Err(HarvestError::Config(format!(
                "requests_per_second must be 0 or at least one per hour, got {}",
                requests_per_second
            )));
        }
        let interval = Duration::try_from_secs_f64(1.0 / requests_per_second).map_err(|e| {
            HarvestError::Config(format!("requests_per_second {}: {}", requests_per_second, e))
        })?;
        Ok(Some(Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next free request slot.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// HTTP GET client with bounded retries and optional request spacing.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
}

impl HttpFetcher {
    pub fn new(http: &HttpConfig) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(http.timeout_secs))
            .user_agent(http.user_agent.clone())
            .build()
            .map_err(|e| HarvestError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            policy: RetryPolicy::from(http),
            limiter: None,
        })
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `GET url?query` with retries. Never returns an error; see [`FetchOutcome`].
    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> FetchOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_status = None;
        let mut last_message = String::new();

        for attempt in 1..=max_attempts {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }

            let mut retry_after = None;
            match self.client.get(url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        match response.text().await {
                            Ok(body) => {
                                return FetchOutcome::Success {
                                    body,
                                    attempts: attempt,
                                }
                            }
                            Err(e) => {
                                last_status = Some(status.as_u16());
                                last_message = format!("failed to read response body: {}", e);
                            }
                        }
                    } else if status.as_u16() == 429 || status.is_server_error() {
                        // Rate limited or server error: retry
                        retry_after = response
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| parse_retry_after(v, Utc::now()));
                        let body_text = response.text().await.unwrap_or_default();
                        last_status = Some(status.as_u16());
                        last_message = format!("HTTP {}: {}", status, snippet(&body_text, 200));
                    } else {
                        let body_text = response.text().await.unwrap_or_default();
                        return FetchOutcome::Rejected {
                            status: status.as_u16(),
                            attempts: attempt,
                            message: format!("HTTP {}: {}", status, snippet(&body_text, 200)),
                        };
                    }
                }
                Err(e) => {
                    last_status = None;
                    last_message = e.to_string();
                }
            }

            if attempt < max_attempts {
                let delay = self.policy.delay_for(attempt, retry_after);
                debug!(
                    url,
                    attempt,
                    status = ?last_status,
                    delay_ms = delay.as_millis() as u64,
                    "retrying upstream request"
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!(url, attempts = max_attempts, status = ?last_status, "upstream retries exhausted");
        FetchOutcome::Exhausted {
            last_status,
            attempts: max_attempts,
            message: last_message,
        }
    }
}

/// First `max` characters of `s`, with an ellipsis when truncated.
pub(crate) fn snippet(s: &str, max: usize) -> String {
    let mut out: String = s.chars().take(max).collect();
    if s.chars().count() > max {
        out.push('…');
    }
    out
}
