//! 后台任务调度
//!
//! SchedulePolicy 以「初始延迟 + 周期」声明下次运行时间；staggered 把另一波任务的偏移
//! 声明为相对基准波的周期比例，而不是两个各自手调的 sleep。
//! 每个周期任务在单独的 tokio task 中「运行到完成 → 再等待一个周期」，不会与自身重叠；
//! 全部任务由同一个 CancellationToken 停止。

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 运行时间策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl SchedulePolicy {
    pub fn new(initial_delay: Duration, period: Duration) -> Self {
        Self {
            initial_delay,
            period,
        }
    }

    /// 立即开始，之后每个周期运行
    pub fn every(period: Duration) -> Self {
        Self::new(Duration::ZERO, period)
    }

    /// 相对 base 错开 fraction 个 base 周期开始，之后按自己的 period 运行
    pub fn staggered(base: &SchedulePolicy, period: Duration, fraction: f64) -> Self {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.5
        };
        Self::new(base.initial_delay + base.period.mul_f64(fraction), period)
    }

    /// 首次运行时间
    pub fn first_run(&self, start: Instant) -> Instant {
        start + self.initial_delay
    }

    /// 一次运行结束后的下次运行时间
    pub fn next_after(&self, finished: Instant) -> Instant {
        finished + self.period
    }
}

/// 后台任务调度器
pub struct TaskScheduler {
    token: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 与调度器同生命周期的取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    fn track(&self, name: &str, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push((name.to_string(), handle)),
            Err(poisoned) => poisoned.into_inner().push((name.to_string(), handle)),
        }
    }

    /// 周期任务：每次运行到完成后等待一个周期；job panic 只记录日志，不终止调度
    pub fn spawn_periodic<F, Fut>(&self, name: &str, policy: SchedulePolicy, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut next = policy.first_run(Instant::now());
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep_until(next) => {}
                }
                tracing::debug!(task = %task_name, "scheduled run");
                let run = AssertUnwindSafe(job()).catch_unwind();
                tokio::select! {
                    _ = token.cancelled() => break,
                    outcome = run => {
                        if outcome.is_err() {
                            tracing::error!(task = %task_name, "scheduled task panicked");
                        }
                    }
                }
                next = policy.next_after(Instant::now());
            }
            tracing::debug!(task = %task_name, "scheduled task stopped");
        });
        self.track(name, handle);
    }

    /// 一次性延迟任务
    pub fn spawn_once<Fut>(&self, name: &str, delay: Duration, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            tracing::debug!(task = %task_name, "delayed run");
            tokio::select! {
                _ = token.cancelled() => {}
                outcome = AssertUnwindSafe(job).catch_unwind() => {
                    if outcome.is_err() {
                        tracing::error!(task = %task_name, "delayed task panicked");
                    }
                }
            }
        });
        self.track(name, handle);
    }

    /// 停止全部任务，最多等待 timeout
    pub async fn stop(&self, timeout: Duration) {
        self.token.cancel();
        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for (name, handle) in tasks {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!(task = %name, "scheduled task did not stop in time");
            }
        }
    }
}
