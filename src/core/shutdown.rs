//! 优雅关闭
//!
//! ShutdownManager 监听 Ctrl+C / SIGTERM，记录第一个关闭原因并取消全局 token；
//! ShutdownCoordinator 按登记顺序逐个运行关闭阶段，每个阶段有独立时限，
//! 某个阶段失败或超时不会跳过后面的阶段。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::task_scheduler::TaskScheduler;
use crate::pool::ResourcePool;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 输入结束或 :quit
    InputClosed,
}

/// 关闭信号：只记录第一个原因
pub struct ShutdownManager {
    token: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: watch::channel(None).0,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 返回是否由本次调用触发
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if first {
            tracing::info!(reason = ?reason, "shutdown requested");
        }
        self.token.cancel();
        first
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// 把 Ctrl+C（以及 unix 上的 SIGTERM）接到 trigger
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        manager.trigger(ShutdownReason::Interrupt);
                    }
                }
                _ = manager.wait() => {}
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let manager = Arc::clone(self);
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = sigterm.recv() => {
                                manager.trigger(ShutdownReason::Terminate);
                            }
                            _ = manager.wait() => {}
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "SIGTERM handler not installed"),
            }
        }
    }
}

/// 一个关闭阶段
#[async_trait::async_trait]
pub trait ShutdownStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<()>;
}

/// 单个阶段的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Done,
    Failed(String),
    TimedOut,
}

pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    stages: Vec<Box<dyn ShutdownStage>>,
    stage_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            stages: Vec::new(),
            stage_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn stage(mut self, stage: impl ShutdownStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    /// 依次运行全部阶段，返回每个阶段的结果
    pub async fn run(&self) -> Vec<(&'static str, StageOutcome)> {
        let mut report = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.stage_timeout, stage.run()).await {
                Ok(Ok(())) => StageOutcome::Done,
                Ok(Err(e)) => StageOutcome::Failed(format!("{:#}", e)),
                Err(_) => StageOutcome::TimedOut,
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &outcome {
                StageOutcome::Done => tracing::info!(stage = stage.name(), elapsed_ms, "shutdown stage done"),
                StageOutcome::Failed(e) => {
                    tracing::warn!(stage = stage.name(), elapsed_ms, error = %e, "shutdown stage failed")
                }
                StageOutcome::TimedOut => tracing::warn!(stage = stage.name(), elapsed_ms, "shutdown stage timed out"),
            }
            report.push((stage.name(), outcome));
        }
        report
    }
}

/// 停止后台调度（健康检查、预热）
pub struct StopScheduler {
    scheduler: Arc<TaskScheduler>,
    wait: Duration,
}

impl StopScheduler {
    pub fn new(scheduler: Arc<TaskScheduler>, wait: Duration) -> Self {
        Self { scheduler, wait }
    }
}

#[async_trait::async_trait]
impl ShutdownStage for StopScheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.scheduler.stop(self.wait).await;
        Ok(())
    }
}

/// 排空并关闭资源池
pub struct DrainPool {
    pool: Arc<ResourcePool>,
    drain_timeout: Duration,
}

impl DrainPool {
    pub fn new(pool: Arc<ResourcePool>, drain_timeout: Duration) -> Self {
        Self { pool, drain_timeout }
    }
}

#[async_trait::async_trait]
impl ShutdownStage for DrainPool {
    fn name(&self) -> &'static str {
        "pool"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.pool.shutdown(self.drain_timeout).await;
        let leaked: usize = self.pool.status().iter().map(|s| s.in_use).sum();
        if leaked > 0 {
            anyhow::bail!("{} handle(s) still in use after drain", leaked);
        }
        Ok(())
    }
}

/// 运行 app 直到它结束或收到关闭信号，然后运行协调器
pub async fn run_until_shutdown<Fut>(coordinator: &ShutdownCoordinator, app: Fut) -> Option<ShutdownReason>
where
    Fut: Future<Output = ()>,
{
    let manager = Arc::clone(coordinator.manager());
    manager.install_signal_handlers();
    tokio::select! {
        _ = app => manager.trigger(ShutdownReason::InputClosed),
        _ = manager.wait() => false,
    };
    coordinator.run().await;
    manager.reason()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::mock::MockEngineFactory;
    use crate::pool::{AcquireMode, ResourceKind};

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_triggered());
        assert!(manager.trigger(ShutdownReason::Terminate));
        assert!(!manager.trigger(ShutdownReason::Interrupt));
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Terminate));
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl ShutdownStage for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn run(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stuck_stage_does_not_skip_pool_drain() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = Arc::new(ResourcePool::new().with_engine(Arc::new(factory.clone()), 1));
        pool.warm_up(ResourceKind::Sandbox).await.unwrap();

        let coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()))
            .with_stage_timeout(Duration::from_millis(50))
            .stage(Stuck)
            .stage(DrainPool::new(Arc::clone(&pool), Duration::from_millis(50)));
        let report = coordinator.run().await;

        assert_eq!(
            report,
            vec![("stuck", StageOutcome::TimedOut), ("pool", StageOutcome::Done)]
        );
        assert!(pool.is_closed());
        assert_eq!(factory.shutdowns(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_reports_leaked_handle() {
        let pool = Arc::new(
            ResourcePool::new().with_engine(Arc::new(MockEngineFactory::new(ResourceKind::Sandbox)), 1),
        );
        let handle = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();

        let coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()))
            .stage(DrainPool::new(Arc::clone(&pool), Duration::from_millis(50)));
        let report = coordinator.run().await;
        assert!(matches!(report[0].1, StageOutcome::Failed(_)));
        pool.release(handle);
    }
}
