//! Reconnect with exponential backoff.
//!
//! Registration is idempotent on the relay, so reconnecting is just
//! connecting again: the new session's backlog carries everything raised
//! while the client was away.

use std::time::Duration;

use rand::Rng;

use crate::client::{ClientError, Identity, RelayClient, Session};

/// Backoff parameters for [`connect_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Give up after this many attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// The un-jittered delay after failed attempt number `attempt` (1-based):
    /// `initial_delay * 2^(attempt - 1)`, capped at `max_delay`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let pow = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_delay
            .saturating_mul(pow)
            .min(self.max_delay)
    }

    /// [`base_delay`](Self::base_delay) with up to ±10% jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay(attempt).as_millis()).unwrap_or(u64::MAX);
        let window = (base_ms / 10).max(1);
        let offset = rand::rng().random_range(0..=window * 2);
        Duration::from_millis(base_ms.saturating_sub(window).saturating_add(offset))
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Connects and registers, retrying transient failures with backoff.
///
/// # Errors
///
/// Returns the last error once `max_attempts` is reached, or immediately
/// for errors that reconnecting cannot fix (e.g. a rejected registration).
pub async fn connect_with_retry(
    url: &str,
    identity: &Identity,
    policy: &ReconnectPolicy,
) -> Result<Session, ClientError> {
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        match RelayClient::connect(url, identity.clone()).await {
            Ok(session) => {
                if attempt > 1 {
                    tracing::info!(user_id = %identity.user_id, attempt, "reconnected to relay");
                }
                return Ok(session);
            }
            Err(e) if e.is_transient() && !policy.exhausted(attempt) => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    user_id = %identity.user_id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "relay connect failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::warn!(user_id = %identity.user_id, attempt, error = %e, "giving up on relay");
                return Err(e);
            }
        }
    }
}
