//! 可取消的周期任务
//!
//! 后台清理（会话过期、黑名单过期、限流计数）统一使用该任务：
//! 构造时启动，关闭时取消。正在执行的一轮会执行完毕后再退出。

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 周期任务句柄，drop 时自动取消
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// 启动周期任务，首次执行在一个周期之后
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                debug!(task = %task_name, "Periodic task tick");
                tick().await;
            }
            info!(task = %task_name, "Periodic task stopped");
        });

        debug!(task = %name, period_ms = period.as_millis() as u64, "Periodic task started");
        Self {
            name,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 发出取消信号，不等待退出
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 取消并等待任务退出
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_each_period() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(60), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        task.shutdown().await;
        assert!(task.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ticks_after_shutdown() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        task.shutdown().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let task = PeriodicTask::spawn("test", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(task);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
