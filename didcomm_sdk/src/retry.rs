use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Policy for retrying outbound delivery with exponential backoff.
///
/// Retries are bounded both by `max_retries` and by the total wall-clock
/// time `max_elapsed` spent on one delivery.
///
/// # Example
///
/// ```
/// use didcomm_sdk::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_retries: 3,
///     initial_delay: Duration::from_millis(100),
///     multiplier: 2.0,
///     max_delay: Duration::from_secs(1),
///     max_elapsed: Duration::from_secs(10),
/// };
///
/// assert_eq!(policy.next_timeout(1), Some(Duration::from_millis(200)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Initial delay before the first retry.
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Multiplier for the delay after each retry.
    pub multiplier: f64,
    /// Maximum delay allowed between retries.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Maximum total time spent retrying one delivery.
    #[serde(with = "millis")]
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate the timeout duration for the next retry attempt.
    ///
    /// Returns `None` if the `retry_count` has reached or exceeded `max_retries`.
    /// Otherwise, returns `Some(duration)` where duration is calculated as:
    /// `min(initial_delay * multiplier^retry_count, max_delay)`
    pub fn next_timeout(&self, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_retries {
            return None;
        }

        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(retry_count as i32);
        let delay = Duration::from_secs_f64(delay);

        Some(std::cmp::min(delay, self.max_delay))
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            retries: 0,
            started: Instant::now(),
        }
    }
}

/// Tracks the retries of one operation
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
    started: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BackoffStep {
    Retry,
    Exhausted,
    Cancelled,
}

impl Backoff {
    /// Number of attempts made so far, assuming one attempt per step
    pub fn attempts(&self) -> usize {
        self.retries as usize + 1
    }

    /// The delay before the next retry, or `None` when either bound is reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.next_timeout(self.retries)?;

        if self.started.elapsed() + delay > self.policy.max_elapsed {
            return None;
        }

        self.retries += 1;

        Some(delay)
    }

    /// Wait for the next retry unless the budget is exhausted or `cancel` fires
    pub async fn wait(&mut self, cancel: &CancellationToken) -> BackoffStep {
        let Some(delay) = self.next_delay() else {
            return BackoffStep::Exhausted;
        };

        tokio::select! {
            _ = cancel.cancelled() => BackoffStep::Cancelled,
            _ = tokio::time::sleep(delay) => BackoffStep::Retry,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(60),
        };

        assert_eq!(policy.next_timeout(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_timeout(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_timeout(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_timeout(3), None);
    }

    #[test]
    fn test_max_delay() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            multiplier: 10.0,
            max_delay: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(60),
        };

        assert_eq!(policy.next_timeout(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_timeout(1), Some(Duration::from_secs(5))); // Capped
    }

    #[test]
    fn test_max_elapsed() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_secs(4),
            multiplier: 1.0,
            max_delay: Duration::from_secs(4),
            max_elapsed: Duration::from_secs(10),
        };

        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.attempts(), 2);

        // a single delay exceeding the budget
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(11),
            max_delay: Duration::from_secs(11),
            ..policy
        };
        assert_eq!(policy.backoff().next_delay(), None);
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(policy.backoff().wait(&cancel).await, BackoffStep::Cancelled);
        assert_eq!(RetryPolicy::none().backoff().wait(&cancel).await, BackoffStep::Exhausted);
    }

    #[test]
    fn test_serde_in_millis() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{ "max_retries": 1, "initial_delay": 250 }"#).unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, RetryPolicy::default().max_delay);
    }
}
