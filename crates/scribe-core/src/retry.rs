//! Retry policy for outbound HTTP calls, independent of pool mechanics.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::transport::{HttpResponse, TransportError};

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff: `base * 2^attempt`, capped at `max_delay`, plus a
/// uniformly random jitter in `[0, jitter]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Self {
            base,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: base / 2,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (0 for the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX);
        let exp = self.base.saturating_mul(factor).min(self.max_delay);
        exp + random_jitter(self.jitter)
    }
}

fn random_jitter(cap: Duration) -> Duration {
    let cap_ms = cap.as_millis() as u64;
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=cap_ms))
}

/// Decides whether a completed HTTP exchange should be retried.
pub type RetryPredicate = fn(&HttpResponse) -> bool;

/// 429, any 5xx, or an exhausted vendor rate-limit bucket on a failed response.
pub fn default_retryable(resp: &HttpResponse) -> bool {
    if resp.is_success() {
        return false;
    }
    resp.status == 429 || (500..600).contains(&resp.status) || resp.rate_limit_exhausted()
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("api error: status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("network error: {source}")]
    Network {
        #[source]
        source: TransportError,
    },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Api { .. } => ErrorKind::ApiError,
            FetchError::Network { .. } => ErrorKind::NetworkError,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Api { status, .. } => Some(*status),
            FetchError::Network { .. } => None,
        }
    }
}

/// Successful exchange plus the number of retries it took.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub response: HttpResponse,
    pub retries: u32,
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
    retryable: RetryPredicate,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            retryable: default_retryable,
        }
    }

    pub fn with_predicate(mut self, retryable: RetryPredicate) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn should_retry(&self, resp: &HttpResponse) -> bool {
        (self.retryable)(resp)
    }

    /// Computed backoff for `attempt`, never shorter than the server hint.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let computed = self.backoff.delay(attempt);
        match hint {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    pub async fn execute<F, Fut>(&self, op: F) -> Result<RetryOutcome, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<HttpResponse, TransportError>>,
    {
        self.execute_with_sleep(op, tokio::time::sleep).await
    }

    /// [`execute`](Self::execute) with an injectable sleep.
    pub async fn execute_with_sleep<F, Fut, S, SFut>(
        &self,
        mut op: F,
        mut sleep: S,
    ) -> Result<RetryOutcome, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<HttpResponse, TransportError>>,
        S: FnMut(Duration) -> SFut,
        SFut: Future<Output = ()>,
    {
        let mut attempt: u32 = 0;
        loop {
            let hint = match op().await {
                Ok(resp) if !self.should_retry(&resp) => {
                    if resp.is_success() {
                        return Ok(RetryOutcome {
                            response: resp,
                            retries: attempt,
                        });
                    }
                    debug!(status = resp.status, "non-retryable http status");
                    return Err(FetchError::Api {
                        status: resp.status,
                        body: resp.text(),
                    });
                }
                Ok(resp) => {
                    if attempt >= self.max_retries {
                        warn!(
                            status = resp.status,
                            retries = attempt,
                            "http retries exhausted"
                        );
                        return Err(FetchError::Api {
                            status: resp.status,
                            body: resp.text(),
                        });
                    }
                    resp.retry_after()
                }
                Err(err) => {
                    if attempt >= self.max_retries {
                        warn!(%err, retries = attempt, "transport retries exhausted");
                        return Err(FetchError::Network { source: err });
                    }
                    debug!(%err, attempt, "transport error; will retry");
                    None
                }
            };
            let delay = self.delay_for(attempt, hint);
            warn!(
                attempt = attempt + 1,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "retrying http request"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}
