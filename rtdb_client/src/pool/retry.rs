//! Jittered exponential backoff, grounded on `RetryPolicy.get_retry_delay`
//! in `examples/original_source/src/spacetimedb_sdk/connection_pool.py`,
//! satisfying spec §8 scenario S5's delay bounds.

use rand::Rng;

use crate::config::RetryConfig;
use crate::time::Duration;

/// Computes the backoff delay for a given (zero-based) retry attempt
/// against `config`. Jitter multiplies the exponential delay by a factor
/// in `[0.75, 1.25)`, matching the Python original's `0.75 + random() * 0.5`.
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config.exponential_base.powi(attempt as i32);
    let base_secs = config.base_delay.as_secs_f64() * exp;
    let capped_secs = base_secs.min(config.max_delay.as_secs_f64());
    let delay_secs = if config.jitter {
        let jitter_factor = rand::thread_rng().gen_range(0.75..1.25);
        capped_secs * jitter_factor
    } else {
        capped_secs
    };
    Duration::from_secs_f64(delay_secs).min(config.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn delay_grows_exponentially_without_jitter() {
        let c = config();
        assert_eq!(retry_delay(&c, 0).as_secs_f64(), 1.0);
        assert_eq!(retry_delay(&c, 1).as_secs_f64(), 2.0);
        assert_eq!(retry_delay(&c, 2).as_secs_f64(), 4.0);
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let c = config();
        assert_eq!(retry_delay(&c, 20).as_secs_f64(), 60.0);
    }

    #[test]
    fn jitter_stays_within_quarter_bounds() {
        let mut c = config();
        c.jitter = true;
        for attempt in 0..4 {
            let nominal = c.base_delay.as_secs_f64() * c.exponential_base.powi(attempt as i32);
            let nominal = nominal.min(c.max_delay.as_secs_f64());
            let d = retry_delay(&c, attempt).as_secs_f64();
            assert!(d >= nominal * 0.75 - 1e-9 && d < nominal * 1.25 + 1e-9, "attempt {attempt}: {d} vs {nominal}");
        }
    }
}
