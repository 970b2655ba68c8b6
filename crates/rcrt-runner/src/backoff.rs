/*!
 * Capped exponential backoff with jitter.
 */

use rand::Rng;
use std::time::Duration;

const BASE_MS: u64 = 500;
const CAP_MS: u64 = 30_000;
const JITTER: f64 = 0.2;

/// Delay for the given attempt (0-based): 0.5s doubling to a 30s cap,
/// jittered +/-20%.
pub fn delay(attempt: u32) -> Duration {
    let exp = BASE_MS.saturating_mul(1u64 << attempt.min(10));
    let capped = exp.min(CAP_MS) as f64;
    let factor = 1.0 + rand::thread_rng().gen_range(-JITTER..=JITTER);
    Duration::from_millis((capped * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        for _ in 0..50 {
            let first = delay(0);
            assert!(first >= Duration::from_millis(400));
            assert!(first <= Duration::from_millis(600));

            let capped = delay(20);
            assert!(capped >= Duration::from_millis(24_000));
            assert!(capped <= Duration::from_millis(36_000));
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let d = delay(u32::MAX);
        assert!(d <= Duration::from_millis(36_000));
    }
}
