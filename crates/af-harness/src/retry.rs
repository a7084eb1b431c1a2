use std::time::Duration;

use af_core::config::RunnerConfig;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// The wait was interrupted by its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

// ---------------------------------------------------------------------------
// BackoffPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff: attempt `n` (0-indexed) waits
/// `initial * multiplier^n`, optionally capped at `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            multiplier,
            max: None,
        }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_ms),
            multiplier: config.backoff_multiplier,
            max: config.max_backoff_ms.map(Duration::from_millis),
        }
    }

    /// Wait before the retry that follows failed attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let ceiling = self.max.unwrap_or(Duration::MAX);
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(ceiling),
            Err(_) => ceiling,
        }
    }

    /// The first `count` delays of the sequence.
    pub fn delays(&self, count: u32) -> Vec<Duration> {
        (0..count).map(|attempt| self.delay_for(attempt)).collect()
    }
}

/// Sleep for `delay` unless `token` is cancelled first.
pub async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> Result<(), Cancelled> {
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!(?delay, "backoff interrupted by cancellation");
            Err(Cancelled)
        }
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
