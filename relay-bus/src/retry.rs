// Delivery retry - exponential backoff with jitter for relayed commands

use reduction_core::config::RelayConfig;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Why a delivery gave up
#[derive(Debug)]
pub enum DeliveryFailure {
    /// The target refused the command; retrying cannot help
    Rejected {
        /// Final error
        error: reduction_core::Error,
        /// Attempts made
        attempts: u32,
    },
    /// Transient failures outlasted the retry budget
    Exhausted {
        /// Last error seen
        error: reduction_core::Error,
        /// Attempts made
        attempts: u32,
    },
}

impl DeliveryFailure {
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryFailure::Rejected { attempts, .. } | DeliveryFailure::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Final error
    pub fn error(&self) -> &reduction_core::Error {
        match self {
            DeliveryFailure::Rejected { error, .. } | DeliveryFailure::Exhausted { error, .. } => error,
        }
    }

    /// Whether resubmitting later may succeed
    pub fn reprocessable(&self) -> bool {
        matches!(self, DeliveryFailure::Exhausted { .. })
    }

    /// Metric label
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryFailure::Rejected { .. } => "rejected",
            DeliveryFailure::Exhausted { .. } => "exhausted",
        }
    }
}

/// Backoff schedule for command delivery
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay_ms: u64,
    max_delay_ms: u64,
    backoff_multiplier: f64,
    jitter_factor: f64,
}

impl From<&RelayConfig> for RetryPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let spread = capped * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * spread * 2.0;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Retries allowed after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of retries
    pub async fn execute<F, Fut, T>(&self, operation: F, label: &str) -> Result<T, DeliveryFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = reduction_core::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(label, attempt, "Delivery succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_transient() => {
                    warn!(label, %error, "Command rejected");
                    return Err(DeliveryFailure::Rejected {
                        error,
                        attempts: attempt + 1,
                    });
                }
                Err(error) if attempt >= self.max_retries => {
                    warn!(label, %error, attempts = attempt + 1, "Retries exhausted");
                    return Err(DeliveryFailure::Exhausted {
                        error,
                        attempts: attempt + 1,
                    });
                }
                Err(error) => {
                    let delay = self.delay(attempt);
                    debug!(label, %error, attempt = attempt + 1, ?delay, "Delivery failed, retrying");
                    crate::metrics::DELIVERY_RETRIES.with_label_values(&[label]).inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
