use rand::Rng;
use std::time::Duration;

/// Shortest delay a nacked job waits before it becomes available again.
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Expected delay before jitter: `base * 2^(max(attempts, 1) - 1)`.
pub fn base_delay(base: Duration, attempts: i32) -> Duration {
    let exponent = attempts.max(1) - 1;
    // 2^31 seconds already exceeds any sensible retry window
    let factor = 2f64.powi(exponent.min(31));
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Delay for a nack after `attempts` lease acquisitions.
///
/// `jitter` is a factor in `[0, 1]`; the base delay is scaled by a uniform
/// sample from `1 ± jitter`. The result is never shorter than
/// [`MIN_RETRY_DELAY`].
pub fn retry_delay(base: Duration, jitter: f64, attempts: i32) -> Duration {
    let sample = if jitter > 0.0 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    } else {
        0.0
    };
    apply_jitter(base_delay(base, attempts), jitter, sample)
}

fn apply_jitter(backoff: Duration, jitter: f64, sample: f64) -> Duration {
    let backoff = backoff.as_secs_f64();
    let delay = backoff + backoff * jitter.clamp(0.0, 1.0) * sample;
    Duration::from_secs_f64(delay.max(MIN_RETRY_DELAY.as_secs_f64()))
}
