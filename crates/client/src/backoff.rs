use std::time::Duration;

use rand::Rng;

/// 指数退避，带随机抖动
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// 0.0 ..= 1.0，延迟在 `[d * (1 - jitter), d * (1 + jitter)]` 内随机
    jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    /// `jitter` 被限制在 0.0 ..= 1.0，NaN 视为不抖动；`max` 不小于 `base`
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, 1.0)
        };
        Self {
            base,
            max: max.max(base),
            jitter,
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// 无抖动的名义延迟
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(factor).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_delay_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 0.0);
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn out_of_range_jitter_is_clamped() {
        let wild = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 7.5);
        assert_eq!(wild.jitter(), 1.0);
        for attempt in 0..10 {
            assert!(wild.delay(attempt) <= wild.max());
        }

        let nan = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), f64::NAN);
        assert_eq!(nan.jitter(), 0.0);
        assert_eq!(nan.delay(2), Duration::from_millis(400));

        let negative = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), -1.0);
        assert_eq!(negative.jitter(), 0.0);

        let inverted = Backoff::new(Duration::from_secs(2), Duration::from_secs(1), 0.0);
        assert_eq!(inverted.max(), Duration::from_secs(2));
        assert_eq!(inverted.base(), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::new(Duration::from_millis(1000), Duration::from_secs(60), 0.5);
        for _ in 0..100 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1500));
        }
    }
}
