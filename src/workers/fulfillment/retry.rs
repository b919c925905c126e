use rand::Rng;
use std::time::Duration;

/// Exponential backoff shared by fulfillment and refund retries.
///
/// Attempt `n` waits `base * 2^(n-1)`, capped at `max_delay`, scaled by a
/// random factor in `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.max_attempts = std::env::var("RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.max_attempts);
        cfg.base_delay = Duration::from_secs(
            std::env::var("RETRY_BASE_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.base_delay.as_secs()),
        );
        cfg.max_delay = Duration::from_secs(
            std::env::var("RETRY_MAX_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(cfg.max_delay.as_secs()),
        );
        cfg.jitter = std::env::var("RETRY_JITTER")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|j| (0.0..1.0).contains(j))
            .unwrap_or(cfg.jitter);
        cfg
    }

    /// Delay before `attempt + 1`, without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor)
    }

    pub fn is_exhausted(&self, attempts: i32) -> bool {
        attempts >= 0 && attempts as u32 >= self.max_attempts
    }
}
