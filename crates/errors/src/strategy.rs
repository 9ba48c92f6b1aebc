//! 重试策略

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 指数退避重试策略
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    /// 最大重试次数（不含首次调用）
    pub max_retries: u32,
    /// 初始延迟
    pub initial_delay: Duration,
    /// 最大延迟
    pub max_delay: Duration,
    /// 退避乘数
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    /// 是否使用 full jitter
    #[serde(default)]
    pub jitter: bool,
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryStrategy {
    /// 创建新的重试策略（乘数 2.0，启用 jitter）
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// 设置退避乘数
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// 计算第 n 次重试的延迟：`min(initial * multiplier^n, max)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);

        if !delay_ms.is_finite() || delay_ms >= max_ms {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}
