//! Async retry with exponential backoff and multiplicative jitter.

use std::time::Duration;

use rand::Rng;

/// A backoff policy: `delay(n) = clamp(base * multiplier^(n-1), max) * jitter`
/// where `jitter` is drawn uniformly from `[0.7, 1.3]`, floored at 1 ms.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// `{max_attempts: 3, base_delay_ms: 100, max_delay_ms: 5000, multiplier: 2.0}`
    pub const fn default_policy() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(100), max_delay: Duration::from_millis(5000), multiplier: 2.0 }
    }

    /// `{max_attempts: 5, base_delay_ms: 2000, max_delay_ms: 30000, multiplier: 2.0}`
    pub const fn advertising_policy() -> Self {
        Self { max_attempts: 5, base_delay: Duration::from_millis(2000), max_delay: Duration::from_millis(30000), multiplier: 2.0 }
    }

    /// The un-jittered delay before attempt `n` (1-indexed), i.e.
    /// `min(max_delay, base_delay * multiplier^(n-1))`.
    fn base_for_attempt(&self, n: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(n as i32 - 1);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Draws a jittered delay for attempt `n` (1-indexed), floored at 1 ms.
    pub fn delay(&self, n: u32) -> Duration {
        let base = self.base_for_attempt(n);
        let jitter = rand::thread_rng().gen_range(0.7..=1.3);
        let jittered = base.as_secs_f64() * jitter;
        Duration::from_secs_f64(jittered).max(Duration::from_millis(1))
    }

    /// The inclusive `[min, max]` bounds attempt `n`'s delay must fall
    /// within, for testing.
    pub fn delay_bounds(&self, n: u32) -> (Duration, Duration) {
        let base = self.base_for_attempt(n).as_secs_f64();
        let lo = (base * 0.7).max(0.001);
        let hi = base * 1.3;
        (Duration::from_secs_f64(lo), Duration::from_secs_f64(hi))
    }
}

/// Runs `op` up to `policy.max_attempts` times, sleeping a jittered backoff
/// between attempts, stopping early once `op` returns `Ok` or a
/// non-retryable error (as judged by `retryable`).
pub async fn retry_async<T, E, F, Fut>(policy: RetryPolicy, mut retryable: impl FnMut(&E) -> bool, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_attempts && retryable(&e) => {
                tokio::time::sleep(policy.delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_falls_within_jitter_bounds() {
        let policy = RetryPolicy::default_policy();
        for n in 1..=5 {
            let (lo, hi) = policy.delay_bounds(n);
            for _ in 0..100 {
                let d = policy.delay(n);
                assert!(d >= lo && d <= hi, "delay {d:?} outside [{lo:?}, {hi:?}] for attempt {n}");
            }
        }
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy = RetryPolicy::default_policy();
        let (_, hi) = policy.delay_bounds(10);
        assert!(hi <= Duration::from_secs_f64(5.0 * 1.3));
    }

    #[tokio::test]
    async fn retry_async_stops_on_success() {
        let mut calls = 0;
        let result: Result<i32, &str> = retry_async(RetryPolicy::default_policy(), |_| true, || {
            calls += 1;
            async move { if calls < 3 { Err("not ready") } else { Ok(42) } }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_async_gives_up_on_non_retryable() {
        let mut calls = 0;
        let result: Result<i32, &str> = retry_async(RetryPolicy::default_policy(), |_| false, || {
            calls += 1;
            async move { Err("permission denied") }
        })
        .await;
        assert_eq!(result, Err("permission denied"));
        assert_eq!(calls, 1);
    }
}
