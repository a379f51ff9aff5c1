use std::time::Duration;

use crate::config::BackoffConfig;

/// Computes the delay to wait before the `attempt`-th reconnect/resubscribe
/// try (0-indexed: `attempt == 0` is the first retry after the initial
/// failure).
///
/// `base = min(max_delay, min_delay * factor^attempt)`, then up to
/// `jitter` fraction of `base` is added on top, uniformly at random. The
/// result always lies in `[min_delay, max_delay * (1 + jitter)]`.
pub fn next_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let factor = config.factor.powi(attempt.min(62) as i32);
    let base = (config.min_delay.as_secs_f64() * factor).min(config.max_delay.as_secs_f64());
    let base = base.max(config.min_delay.as_secs_f64());

    let jitter_span = base * config.jitter;
    let jitter = if jitter_span > 0.0 {
        rand::random::<f64>() * jitter_span
    } else {
        0.0
    };

    Duration::from_secs_f64(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> BackoffConfig {
        BackoffConfig {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(20),
            factor: 2.0,
            jitter: 0.5,
        }
    }

    #[test]
    fn grows_with_attempt_and_respects_bounds() {
        let cfg = config();
        for attempt in 0..20 {
            let delay = next_delay(&cfg, attempt);
            assert!(delay >= cfg.min_delay);
            let upper = cfg.max_delay.mul_f64(1.0 + cfg.jitter);
            assert!(delay <= upper, "attempt {attempt} produced {delay:?}");
        }
    }

    #[test]
    fn saturates_for_large_attempt_counts() {
        let cfg = config();
        let delay = next_delay(&cfg, u32::MAX);
        assert!(delay <= cfg.max_delay.mul_f64(1.0 + cfg.jitter));
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let mut cfg = config();
        cfg.jitter = 0.0;
        assert_eq!(next_delay(&cfg, 0), cfg.min_delay);
        assert_eq!(next_delay(&cfg, 1), Duration::from_millis(200));
        assert_eq!(next_delay(&cfg, 2), Duration::from_millis(400));
    }
}
