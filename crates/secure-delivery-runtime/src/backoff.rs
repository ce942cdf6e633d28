use rand::Rng;
use secure_delivery::DeliveryConfig;
use std::time::Duration;

/// Exponential backoff between job attempts, with +/-25% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Backoff {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(config.min_backoff_ms, config.max_backoff_ms)
    }

    /// Un-jittered delay after the `attempt`-th failure (1-based).
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.min_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_ms)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        server_override_ms: Option<u64>,
        rng: &mut R,
    ) -> Duration {
        if let Some(ms) = server_override_ms {
            return Duration::from_millis(ms);
        }
        let base = self.base_delay_ms(attempt) as f64;
        let jittered = (base * rng.gen_range(0.75..=1.25)) as u64;
        Duration::from_millis(jittered.min(self.max_ms))
    }

    pub fn delay(&self, attempt: u32, server_override_ms: Option<u64>) -> Duration {
        self.delay_with_rng(attempt, server_override_ms, &mut rand::thread_rng())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}
