//! 断路器
//!
//! Closed -> Open -> HalfOpen 状态机，失败按滑动时间窗计数。
//! 所有状态检查与变更都在同一把锁内完成，锁不会跨越被保护操作的 await。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcpgw_errors::{AppError, AppResult, ErrorCategory};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 断路器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 断路器配置
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// 时间窗内触发打开的失败次数
    pub failure_threshold: u32,
    /// 失败计数的滑动时间窗
    pub failure_window: Duration,
    /// 打开后进入半开前的冷却时间
    pub recovery_timeout: Duration,
    /// 半开状态下关闭断路器所需的成功次数
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

/// 只读的指标快照
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub rejections: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_state_change: DateTime<Utc>,
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    rejection_count: u64,
    failure_timestamps: Vec<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    /// 单调时钟，用于冷却判断
    state_changed_at: Instant,
    /// 墙上时钟，仅用于指标展示
    last_state_change: DateTime<Utc>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            rejection_count: 0,
            failure_timestamps: Vec::new(),
            last_failure_time: None,
            state_changed_at: Instant::now(),
            last_state_change: Utc::now(),
        }
    }

    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        self.failure_timestamps
            .retain(|ts| now.saturating_duration_since(*ts) < window);
        self.failure_count = self.failure_timestamps.len() as u32;
    }
}

/// 断路器
///
/// 克隆得到的实例共享同一个状态。
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name: String = name.into();
        metrics::gauge!("circuit_breaker_state", "breaker" => name.clone())
            .set(CircuitState::Closed.gauge_value());
        Self {
            name: Arc::from(name),
            config,
            state: Arc::new(Mutex::new(CircuitBreakerState::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// 执行受保护的操作
    pub async fn execute<F, Fut, T>(&self, operation: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        // 1. 检查状态
        self.acquire_permission()?;

        // 2. 执行操作
        let result = operation().await;

        // 3. 记录结果
        match &result {
            Ok(_) => self.on_success(),
            Err(e) if counts_as_failure(e) => self.on_failure(e),
            Err(e) => debug!(
                breaker = %self.name,
                category = %e.category(),
                "Caller-side error, not counted as a breaker failure"
            ),
        }

        result
    }

    /// 当前状态（不会触发 Open -> HalfOpen 转换）
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// 下一次调用是否会被拒绝：打开且恢复时间未到
    pub fn is_rejecting(&self) -> bool {
        let state = self.state.lock();
        state.state == CircuitState::Open
            && state.state_changed_at.elapsed() < self.config.recovery_timeout
    }

    /// 强制关闭并清零所有计数
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let from = state.state;
        let rejections_before = state.rejection_count;
        *state = CircuitBreakerState::new();
        drop(state);

        self.record_transition(from, CircuitState::Closed);
        info!(
            breaker = %self.name,
            from = %from,
            rejections_before,
            "Circuit breaker reset"
        );
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.lock();
        CircuitBreakerMetrics {
            state: state.state,
            failures: state.failure_count,
            successes: state.success_count,
            rejections: state.rejection_count,
            last_failure_time: state.last_failure_time,
            last_state_change: state.last_state_change,
        }
    }

    fn acquire_permission(&self) -> AppResult<()> {
        let mut state = self.state.lock();

        if state.state == CircuitState::Open {
            let elapsed = state.state_changed_at.elapsed();
            if elapsed >= self.config.recovery_timeout {
                self.transition(&mut state, CircuitState::HalfOpen);
                state.success_count = 0;
            } else {
                state.rejection_count += 1;
                let retry_after = self.config.recovery_timeout.saturating_sub(elapsed);
                metrics::counter!("circuit_breaker_rejections_total", "breaker" => self.name.to_string())
                    .increment(1);
                debug!(
                    breaker = %self.name,
                    rejections = state.rejection_count,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Circuit breaker is open, rejecting call"
                );
                return Err(AppError::circuit_open(
                    &self.name,
                    retry_after.as_millis() as u64,
                ));
            }
        }

        Ok(())
    }

    fn on_success(&self) {
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed => {
                // 只记住连续失败，成功后清空时间窗
                state.failure_timestamps.clear();
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed);
                    state.failure_timestamps.clear();
                    state.failure_count = 0;
                    state.success_count = 0;
                }
            }
            CircuitState::Open => {
                // 打开前已放行的调用迟到的成功
            }
        }
    }

    fn on_failure(&self, err: &AppError) {
        let mut state = self.state.lock();
        state.last_failure_time = Some(Utc::now());

        match state.state {
            CircuitState::Closed => {
                state.prune(self.config.failure_window);
                state.failure_timestamps.push(Instant::now());
                state.failure_count = state.failure_timestamps.len() as u32;

                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = state.failure_count,
                        threshold = self.config.failure_threshold,
                        error = %err,
                        "Failure threshold reached"
                    );
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.success_count = 0;
                warn!(breaker = %self.name, error = %err, "Probe failed in HALF_OPEN");
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "Failure recorded while circuit is already OPEN");
            }
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.state_changed_at = Instant::now();
        state.last_state_change = Utc::now();
        self.record_transition(from, to);

        match to {
            CircuitState::Open => {
                warn!(breaker = %self.name, from = %from, "Circuit breaker transitioned to OPEN")
            }
            _ => info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed"),
        }
    }

    fn record_transition(&self, from: CircuitState, to: CircuitState) {
        metrics::gauge!("circuit_breaker_state", "breaker" => self.name.to_string())
            .set(to.gauge_value());
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.to_string(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

/// 调用方自身的错误不代表下游不健康，不计入失败
fn counts_as_failure(err: &AppError) -> bool {
    !matches!(
        err.category(),
        ErrorCategory::Authentication
            | ErrorCategory::Authorization
            | ErrorCategory::Validation
            | ErrorCategory::NotFound
            | ErrorCategory::CircuitBreaker
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: u32, window_ms: u64, recovery_ms: u64, success: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_millis(window_ms),
            recovery_timeout: Duration::from_millis(recovery_ms),
            success_threshold: success,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> AppResult<()> {
        cb.execute(|| async { Err(AppError::network("boom")) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> AppResult<()> {
        cb.execute(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("test", config(3, 10_000, 1_000, 1));

        for _ in 0..2 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().failures, 3);
        assert!(cb.metrics().last_failure_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failures_do_not_count() {
        let cb = CircuitBreaker::new("test", config(2, 1_000, 1_000, 1));

        let _ = fail(&cb).await;
        tokio::time::advance(Duration::from_millis(1_500)).await;
        let _ = fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_failure_window() {
        let cb = CircuitBreaker::new("test", config(3, 10_000, 1_000, 1));

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let cb = CircuitBreaker::new("test", config(1, 10_000, 1_000, 1));
        let _ = fail(&cb).await;

        let calls = AtomicU32::new(0);
        for expected in 1..=3u64 {
            let err = cb
                .execute(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
                .await
                .unwrap_err();
            assert_eq!(err.category(), ErrorCategory::CircuitBreaker);
            assert_eq!(cb.metrics().rejections, expected);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", config(1, 10_000, 100, 2));
        let _ = fail(&cb).await;

        tokio::time::advance(Duration::from_millis(150)).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.metrics().successes, 1);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().successes, 0);

        // 冷却从重新打开时开始计算
        assert!(succeed(&cb).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_errors_are_not_failures() {
        let cb = CircuitBreaker::new("test", config(1, 10_000, 1_000, 1));
        let _ = cb
            .execute(|| async { Err::<(), _>(AppError::authentication("invalid_grant")) })
            .await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_zeroes_everything() {
        let cb = CircuitBreaker::new("test", config(1, 10_000, 60_000, 1));
        let _ = fail(&cb).await;
        let _ = succeed(&cb).await;
        assert!(cb.is_open());

        cb.reset();
        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Closed);
        assert_eq!(metrics.failures, 0);
        assert_eq!(metrics.successes, 0);
        assert_eq!(metrics.rejections, 0);
        succeed(&cb).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_open_once() {
        let cb = CircuitBreaker::new("test", config(2, 10_000, 60_000, 1));
        let (a, b, c) = tokio::join!(fail(&cb), fail(&cb), fail(&cb));
        assert!(a.is_err() && b.is_err() && c.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    /// threshold 2 / window 10s / recovery 100ms / success 2
    #[tokio::test(start_paused = true)]
    async fn test_trip_and_recover_scenario() {
        let cb = CircuitBreaker::new("scenario", config(2, 10_000, 100, 2));
        let calls = Arc::new(AtomicU32::new(0));

        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_rejecting());

        let counter = calls.clone();
        let err = cb
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::CircuitBreaker);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!cb.is_rejecting());

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().failures, 0);
        assert_eq!(cb.metrics().successes, 0);
    }
}
