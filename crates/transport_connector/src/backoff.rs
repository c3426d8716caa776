use common::PipelineConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delay with bounded jitter.
///
/// `delay(n) = min(base * 2^n + jitter, cap)` where `jitter` is drawn from
/// `[0, base * jitter_ratio]`. Because the jitter never exceeds `base`, each
/// delay is at least the previous one until the cap is reached.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter_ratio: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            cap: cap.max(base),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.backoff_base(), config.backoff_cap(), config.backoff_jitter)
    }

    /// Pick up reloaded parameters without losing the failure count
    pub fn reconfigure(&mut self, config: &PipelineConfig) {
        self.base = config.backoff_base();
        self.cap = config.backoff_cap().max(self.base);
        self.jitter_ratio = config.backoff_jitter.clamp(0.0, 1.0);
    }

    /// Consecutive failures recorded since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt; records one more failure
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let exponential = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        let max_jitter = self.base.mul_f64(self.jitter_ratio);
        let jitter = if max_jitter.is_zero() {
            Duration::ZERO
        } else {
            max_jitter.mul_f64(rng.gen_range(0.0..=1.0))
        };

        self.attempt = self.attempt.saturating_add(1);
        exponential.saturating_add(jitter).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
