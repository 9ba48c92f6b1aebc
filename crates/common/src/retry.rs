//! 分类重试执行器
//!
//! 带上限的指数退避（可选 full jitter），可重试判定顺序：
//! 1. 调用方提供的谓词（若有）总是优先
//! 2. 否则按错误分类：可重试状态码、连接类错误、类别默认标志

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use mcpgw_errors::{
    AppError, AppResult, DEFAULT_RETRYABLE_STATUSES, ErrorCategory, RetryStrategy,
    is_connection_error,
};
use rand::Rng;
use tokio::time::Instant;
use tracing::{info, warn};

/// 重试谓词：`(错误, 已重试次数) -> 是否重试`
pub type RetryPredicate = Arc<dyn Fn(&AppError, u32) -> bool + Send + Sync>;

/// 重试观察者：`(第几次重试, 错误, 选定延迟)`，不得 panic
pub type RetryObserver = Arc<dyn Fn(u32, &AppError, Duration) + Send + Sync>;

/// 断路器状态探针：返回 `true` 表示断路器打开
pub type CircuitProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// 重试策略 + 判定规则
#[derive(Clone)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    retryable_statuses: Vec<u16>,
    predicate: Option<RetryPredicate>,
    observer: Option<RetryObserver>,
    deadline: Option<Instant>,
    circuit_probe: Option<CircuitProbe>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryStrategy::default())
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("strategy", &self.strategy)
            .field("retryable_statuses", &self.retryable_statuses)
            .field("custom_predicate", &self.predicate.is_some())
            .field("deadline", &self.deadline)
            .field("circuit_aware", &self.circuit_probe.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self {
            strategy,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            predicate: None,
            observer: None,
            deadline: None,
            circuit_probe: None,
        }
    }

    /// 身份提供方操作专用策略
    ///
    /// 从不重试认证/授权错误和 `invalid_grant`：调用方必须重新认证。
    pub fn for_identity_provider(strategy: RetryStrategy) -> Self {
        let policy = Self::new(strategy);
        let statuses = policy.retryable_statuses.clone();
        policy.with_predicate(move |err, _| is_identity_retryable(err, &statuses))
    }

    pub fn with_retryable_statuses(mut self, statuses: impl Into<Vec<u16>>) -> Self {
        self.retryable_statuses = statuses.into();
        self
    }

    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&AppError, u32) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_observer<O>(mut self, observer: O) -> Self
    where
        O: Fn(u32, &AppError, Duration) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// 截止时间之后不再重试，无论剩余次数与谓词结果
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// 每次尝试前询问断路器；打开时立即失败且不调用操作
    pub fn with_circuit_probe<C>(mut self, probe: C) -> Self
    where
        C: Fn() -> bool + Send + Sync + 'static,
    {
        self.circuit_probe = Some(Arc::new(probe));
        self
    }

    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }

    /// 判断是否应该进行第 `attempt + 1` 次重试
    pub fn should_retry(&self, err: &AppError, attempt: u32) -> bool {
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(err, attempt),
            None => default_is_retryable(err, &self.retryable_statuses),
        }
    }

    /// 本次重试实际等待的时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.strategy.delay_for_attempt(attempt);
        if self.strategy.jitter {
            full_jitter(delay)
        } else {
            delay
        }
    }

    fn is_circuit_open(&self) -> bool {
        self.circuit_probe.as_ref().is_some_and(|probe| probe())
    }

    fn notify(&self, attempt: u32, err: &AppError, delay: Duration) {
        if let Some(observer) = &self.observer {
            if catch_unwind(AssertUnwindSafe(|| observer(attempt, err, delay))).is_err() {
                warn!(attempt, "Retry observer panicked, ignoring");
            }
        }
    }
}

/// 默认的可重试判定
///
/// 调用方错误与断路器拒绝永不重试；带状态码的错误看状态码是否在可重试集合中；
/// 连接重置/超时/拒绝按名称或消息匹配；其余回落到类别默认标志。
pub fn default_is_retryable(err: &AppError, retryable_statuses: &[u16]) -> bool {
    if matches!(
        err.category(),
        ErrorCategory::Authentication
            | ErrorCategory::Authorization
            | ErrorCategory::Validation
            | ErrorCategory::Configuration
            | ErrorCategory::CircuitBreaker
    ) {
        return false;
    }
    if let Some(status) = err.http_status() {
        return retryable_statuses.contains(&status);
    }
    if err.code().is_some_and(is_connection_error) || is_connection_error(err.message()) {
        return true;
    }
    err.is_retryable()
}

/// 身份提供方操作的可重试判定
pub fn is_identity_retryable(err: &AppError, retryable_statuses: &[u16]) -> bool {
    if matches!(
        err.category(),
        ErrorCategory::Authentication | ErrorCategory::Authorization
    ) {
        return false;
    }
    let invalid_grant = err
        .code()
        .is_some_and(|c| c.eq_ignore_ascii_case("invalid_grant"))
        || err.message().to_lowercase().contains("invalid_grant");
    !invalid_grant && default_is_retryable(err, retryable_statuses)
}

/// Full jitter：在 `[0, delay]` 内均匀取值
pub fn full_jitter(delay: Duration) -> Duration {
    let max_ms = delay.as_millis().min(u64::MAX as u128) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// 带重试的异步操作执行器
///
/// # 参数
/// - `policy`: 重试策略与判定规则
/// - `operation_name`: 操作名称（用于日志与指标）
/// - `operation`: 要执行的异步操作
///
/// # 返回
/// 成功时返回 Ok(T)；遇到不可重试错误或重试次数耗尽时返回最后一次的错误
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let max_retries = policy.strategy.max_retries;
    let mut attempt: u32 = 0;

    loop {
        if policy.is_circuit_open() {
            warn!(
                operation = operation_name,
                attempt = attempt + 1,
                "Circuit open, skipping attempt"
            );
            return Err(AppError::circuit_open(operation_name, 0));
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_retries,
                        error = %e,
                        "Operation failed, no more retries"
                    );
                    return Err(e);
                }
                if !policy.should_retry(&e, attempt) {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        category = %e.category(),
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                attempt += 1;
                policy.notify(attempt, &e, delay);
                metrics::counter!("retry_attempts_total", "operation" => operation_name.to_string())
                    .increment(1);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn strategy(max_retries: u32) -> RetryStrategy {
        RetryStrategy::new(max_retries, Duration::from_millis(10), Duration::from_millis(100))
            .with_jitter(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_first_attempt() {
        let policy = RetryPolicy::new(strategy(3));
        let result = with_retry(&policy, "test", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failures() {
        let policy = RetryPolicy::new(strategy(3));
        let counter = AtomicU32::new(0);

        let result = with_retry(&policy, "test", || {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(AppError::network("connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_last_error() {
        let policy = RetryPolicy::new(strategy(2));
        let counter = AtomicU32::new(0);

        let result: AppResult<()> = with_retry(&policy, "test", || {
            let count = counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(AppError::timeout(format!("timed out #{}", count))) }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.message(), "timed out #2");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_aborts_after_first_attempt() {
        let policy = RetryPolicy::new(strategy(5));
        let counter = AtomicU32::new(0);

        let result: AppResult<()> = with_retry(&policy, "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::validation("bad input")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_based_classification() {
        let counter = AtomicU32::new(0);
        let policy = RetryPolicy::new(strategy(2));
        let _: AppResult<()> = with_retry(&policy, "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::unknown("upstream").with_http_status(503)) }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        let counter = AtomicU32::new(0);
        let _: AppResult<()> = with_retry(&policy, "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::network("bad gateway").with_http_status(501)) }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_error_by_code() {
        let counter = AtomicU32::new(0);
        let policy = RetryPolicy::new(strategy(1));
        let _: AppResult<()> = with_retry(&policy, "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::unknown("socket error").with_code("ECONNREFUSED")) }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate_wins() {
        let policy = RetryPolicy::new(strategy(2)).with_predicate(|_, _| true);
        let counter = AtomicU32::new(0);

        let _: AppResult<()> = with_retry(&policy, "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::validation("normally never retried")) }
        })
        .await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_attempts_and_delays() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let policy = RetryPolicy::new(strategy(3))
            .with_observer(move |attempt, _, delay| sink.lock().push((attempt, delay)));

        let _: AppResult<()> =
            with_retry(&policy, "test", || async { Err(AppError::network("down")) }).await;

        assert_eq!(
            *seen.lock(),
            vec![
                (1, Duration::from_millis(10)),
                (2, Duration::from_millis(20)),
                (3, Duration::from_millis(40)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_observer_is_contained() {
        let policy = RetryPolicy::new(strategy(1)).with_observer(|_, _, _| panic!("boom"));
        let counter = AtomicU32::new(0);

        let result: AppResult<()> = with_retry(&policy, "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::network("down")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_full_jitter_bounds() {
        let delay = Duration::from_millis(250);
        for _ in 0..1000 {
            assert!(full_jitter(delay) <= delay);
        }
        assert_eq!(full_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_provider_variant() {
        let policy = RetryPolicy::for_identity_provider(strategy(3));

        for err in [
            AppError::authentication("expired"),
            AppError::authorization("nope"),
            AppError::network("refresh failed").with_code("invalid_grant"),
            AppError::unknown("error=invalid_grant").with_http_status(500),
        ] {
            let counter = AtomicU32::new(0);
            let _: AppResult<()> = with_retry(&policy, "refresh", || {
                counter.fetch_add(1, Ordering::SeqCst);
                let err = err.clone();
                async move { Err(err) }
            })
            .await;
            assert_eq!(counter.load(Ordering::SeqCst), 1, "{}", err);
        }

        let counter = AtomicU32::new(0);
        let _: AppResult<()> = with_retry(&policy, "refresh", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::network("connection reset")) }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries() {
        let policy = RetryPolicy::new(
            RetryStrategy::new(10, Duration::from_millis(100), Duration::from_secs(10))
                .with_jitter(false),
        )
        .with_deadline(Instant::now() + Duration::from_millis(150));
        let counter = AtomicU32::new(0);

        let _: AppResult<()> = with_retry(&policy, "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(AppError::network("down")) }
        })
        .await;

        // t=0 失败 → 等 100ms → t=100 失败 → 等 200ms → t=300 失败，已过截止时间
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_aware_skips_operation() {
        let policy = RetryPolicy::new(strategy(3)).with_circuit_probe(|| true);
        let counter = AtomicU32::new(0);

        let result: AppResult<()> = with_retry(&policy, "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_eq!(result.unwrap_err().category(), ErrorCategory::CircuitBreaker);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
