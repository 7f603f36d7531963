//! Boundary to the external annotation service plus the retry loop around it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, warn};

use crate::error::ServiceError;
use crate::taxonomy::Taxonomy;

/// Anything that can classify one chunk of text.
///
/// Implementations return the model's payload untouched; shape checking and
/// taxonomy validation happen in [`crate::parser`].
#[async_trait]
pub trait AnnotationClient: Send + Sync {
    /// Short label recorded in outputs, e.g. `openai:gpt-5`.
    fn source(&self) -> &str;

    async fn submit(&self, chunk_text: &str, taxonomy: &Taxonomy) -> Result<Value, ServiceError>;
}

fn default_retryable(err: &ServiceError) -> bool {
    err.is_retryable()
}

/// Exponential backoff with jitter, passed explicitly into every dispatch.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    pub multiplier: f64,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Upper bound of the random fraction added to each delay (0.1 = up to +10%).
    pub jitter: f64,
    #[serde(rename = "call_timeout_secs", with = "duration_secs")]
    pub call_timeout: Duration,
    #[serde(skip, default = "default_retryable_fn")]
    pub retryable: fn(&ServiceError) -> bool,
}

fn default_retryable_fn() -> fn(&ServiceError) -> bool {
    default_retryable
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(750),
            multiplier: 1.75,
            max_delay: Duration::from_millis(5000),
            jitter: 0.1,
            call_timeout: Duration::from_secs(120),
            retryable: default_retryable,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn backoff(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            retries: 0,
            previous: Duration::ZERO,
        }
    }
}

/// Delay sequence for one dispatch. Delays never decrease and never exceed
/// `max_delay`.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a RetryPolicy,
    retries: i32,
    previous: Duration,
}

impl Backoff<'_> {
    /// Next wait. A server `Retry-After` hint can raise it, up to the cap.
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        let policy = self.policy;
        let multiplier = policy.multiplier.max(1.0);
        let jitter = if policy.jitter.is_finite() {
            policy.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let factor = 1.0 + rand::thread_rng().gen_range(0.0..=jitter);
        let secs = policy.base_delay.as_secs_f64() * multiplier.powi(self.retries) * factor;
        let mut delay = if secs.is_finite() && secs < policy.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs.max(0.0))
        } else {
            policy.max_delay
        };
        if let Some(hint) = hint {
            delay = delay.max(hint.min(policy.max_delay));
        }

        let delay = delay.min(policy.max_delay).max(self.previous);
        self.previous = delay;
        self.retries = self.retries.saturating_add(1);
        delay
    }
}

/// Concurrency ceiling shared by every dispatch against one service.
#[derive(Debug, Clone)]
pub struct ServiceLimiter {
    semaphore: Arc<Semaphore>,
}

impl ServiceLimiter {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Refuses every future dispatch. Calls already holding a permit finish.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, ServiceError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::fatal("dispatch cancelled before the request was sent"))
    }
}

/// Submits one chunk, retrying rate-limited and transient failures.
///
/// The limiter permit covers a single attempt; it is released before any
/// backoff sleep so a waiting chunk never holds up another chunk's dispatch.
#[tracing::instrument(skip_all, fields(chunk_chars = chunk_text.chars().count()))]
pub async fn request_annotations(
    client: &dyn AnnotationClient,
    chunk_text: &str,
    taxonomy: &Taxonomy,
    policy: &RetryPolicy,
    limiter: &ServiceLimiter,
) -> Result<Value, ServiceError> {
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let outcome = {
            let _permit = limiter.acquire().await?;
            match tokio::time::timeout(policy.call_timeout, client.submit(chunk_text, taxonomy))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ServiceError::transient(format!(
                    "call timed out after {}ms",
                    policy.call_timeout.as_millis()
                ))),
            }
        };

        let err = match outcome {
            Ok(payload) => {
                debug!(attempt, "annotation service answered");
                return Ok(payload);
            }
            Err(err) => err,
        };

        if !(policy.retryable)(&err) {
            warn!(attempt, kind = %err.kind, "non-retryable service error: {}", err.message);
            return Err(err);
        }
        if attempt >= policy.max_attempts {
            error!(attempt, kind = %err.kind, "exhausted retries: {}", err.message);
            return Err(err);
        }

        let delay = backoff.next_delay(err.retry_after);
        warn!(
            attempt,
            kind = %err.kind,
            delay_ms = delay.as_millis() as u64,
            "retrying after service error: {}",
            err.message
        );
        tokio::time::sleep(delay).await;
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
