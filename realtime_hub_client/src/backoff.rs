//! 重连退避策略。

use rand::Rng;
use std::time::Duration;

/// 指数退避：`delay(n) = min(max_delay, base_delay * 2^n)`，再叠加 `±jitter_ratio` 比例的随机抖动。
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 连续失败达到此次数后放弃
    pub max_attempts: u32,
    /// 取值 0.0 ~ 1.0
    pub jitter_ratio: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter_ratio: 0.2,
        }
    }
}

impl Backoff {
    /// 第 `attempt` 次重试 (从 0 开始) 之前的等待时间。
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_sample(attempt, rand::thread_rng().gen_range(-1.0..=1.0))
    }

    /// `sample` 为 -1.0 ~ 1.0 的抖动采样值。
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exp = base * 2f64.powi(attempt.min(62) as i32);
        let capped = exp.min(max);
        let jitter = capped * self.jitter_ratio.clamp(0.0, 1.0) * sample.clamp(-1.0, 1.0);
        let secs = (capped + jitter).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_attempts: 5,
            jitter_ratio: 0.5,
        }
    }

    fn assert_millis(d: Duration, expected: u64) {
        let diff = (d.as_secs_f64() * 1000.0 - expected as f64).abs();
        assert!(diff < 0.001, "期望 {}ms，实际为 {:?}", expected, d);
    }

    #[test]
    fn test_exponential_growth_and_cap() {
        let b = backoff();
        assert_millis(b.delay_with_sample(0, 0.0), 100);
        assert_millis(b.delay_with_sample(1, 0.0), 200);
        assert_millis(b.delay_with_sample(3, 0.0), 800);
        assert_millis(b.delay_with_sample(10, 0.0), 2_000);
        assert_millis(b.delay_with_sample(u32::MAX, 0.0), 2_000);
    }

    #[test]
    /// 测试抖动范围：上下浮动不超过 jitter_ratio，且不会为负。
    fn test_jitter_bounds() {
        let b = backoff();
        assert_millis(b.delay_with_sample(0, 1.0), 150);
        assert_millis(b.delay_with_sample(0, -1.0), 50);
        let wild = Backoff { jitter_ratio: 7.0, ..backoff() };
        assert_eq!(wild.delay_with_sample(0, -1.0), Duration::ZERO);
        for attempt in 0..8 {
            let d = b.delay(attempt).as_secs_f64();
            let nominal = b.delay_with_sample(attempt, 0.0).as_secs_f64();
            assert!(d <= nominal * 1.5 + 1e-6);
            assert!(d >= nominal * 0.5 - 1e-6);
        }
    }

    #[test]
    fn test_exhausted() {
        let b = backoff();
        assert!(!b.exhausted(4));
        assert!(b.exhausted(5));
    }
}
