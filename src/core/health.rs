//! 后台健康监控
//!
//! 两波周期检查由 TaskScheduler 驱动、相互错开：
//! - 轻量波：资源池状态与已启动引擎的探活、工具注册统计
//! - 重量波：模型后端可达性探测
//! 每次检查整体替换一个 Arc<HealthSnapshot>（watch::send_replace），读者永远看到完整快照；
//! 两波在发布锁内基于上一份快照组合，互不覆盖对方的部分。不参与请求路径，也不修改对话。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::core::task_scheduler::{SchedulePolicy, TaskScheduler};
use crate::llm::LlmClient;
use crate::pool::{ResourcePool, ResourceStatus};
use crate::tools::{RegistrationFailure, ToolRegistry};

/// 模型后端可达性
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    /// None 表示尚未探测
    pub reachable: Option<bool>,
    pub latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

/// 工具注册统计（注册期失败，与单次调用失败无关）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolTally {
    pub registered: usize,
    pub names: Vec<String>,
    pub failed: Vec<RegistrationFailure>,
}

/// 只读健康快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub taken_at: DateTime<Utc>,
    /// 每次发布递增
    pub sequence: u64,
    pub pool: Vec<ResourceStatus>,
    pub pool_checked_at: Option<DateTime<Utc>>,
    pub backend: BackendStatus,
    pub tools: ToolTally,
}

impl HealthSnapshot {
    fn initial(backend_name: &str) -> Self {
        Self {
            taken_at: Utc::now(),
            sequence: 0,
            pool: Vec::new(),
            pool_checked_at: None,
            backend: BackendStatus {
                name: backend_name.to_string(),
                reachable: None,
                latency_ms: None,
                last_error: None,
                checked_at: None,
            },
            tools: ToolTally::default(),
        }
    }

    /// 后端未确认不可达、已启动的引擎都存活、没有工具注册失败
    pub fn is_healthy(&self) -> bool {
        self.backend.reachable != Some(false)
            && self.pool.iter().all(|s| s.alive != Some(false))
            && self.tools.failed.is_empty()
    }
}

pub struct HealthMonitor {
    pool: Arc<ResourcePool>,
    client: Arc<dyn LlmClient>,
    registry: Arc<ToolRegistry>,
    check_timeout: Duration,
    tx: watch::Sender<Arc<HealthSnapshot>>,
    publish: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        pool: Arc<ResourcePool>,
        client: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        check_timeout: Duration,
    ) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(HealthSnapshot::initial(client.name())));
        Self {
            pool,
            client,
            registry,
            check_timeout,
            tx,
            publish: Mutex::new(()),
        }
    }

    /// 当前快照（无锁读取，不等待进行中的检查）
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<HealthSnapshot>> {
        self.tx.subscribe()
    }

    async fn publish_with(&self, update: impl FnOnce(&mut HealthSnapshot)) -> Arc<HealthSnapshot> {
        let _guard = self.publish.lock().await;
        let mut next = HealthSnapshot::clone(&self.tx.borrow());
        update(&mut next);
        next.sequence += 1;
        next.taken_at = Utc::now();
        let next = Arc::new(next);
        self.tx.send_replace(Arc::clone(&next));
        next
    }

    fn tally(&self) -> ToolTally {
        ToolTally {
            registered: self.registry.len(),
            names: self.registry.tool_names(),
            failed: self.registry.failures().to_vec(),
        }
    }

    /// 轻量波：资源池状态 + 已启动引擎探活 + 工具统计
    pub async fn run_cheap_cycle(&self) -> Arc<HealthSnapshot> {
        let mut pool = self.pool.status();
        for status in pool.iter_mut() {
            status.alive = self.pool.ping(status.kind).await.ok().flatten();
            if status.alive == Some(false) {
                tracing::warn!(kind = %status.kind, "engine failed liveness check");
            }
        }
        let tools = self.tally();
        let checked_at = Utc::now();
        let snapshot = self
            .publish_with(move |s| {
                s.pool = pool;
                s.pool_checked_at = Some(checked_at);
                s.tools = tools;
            })
            .await;
        tracing::debug!(sequence = snapshot.sequence, "health: cheap cycle published");
        snapshot
    }

    /// 重量波：模型后端可达性
    pub async fn run_expensive_cycle(&self) -> Arc<HealthSnapshot> {
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(self.check_timeout, self.client.health_check()).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let (reachable, last_error) = match outcome {
            Ok(Ok(())) => (true, None),
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some(format!("health check timed out after {}ms", self.check_timeout.as_millis()))),
        };
        if !reachable {
            tracing::warn!(backend = %self.client.name(), error = ?last_error, "model backend unreachable");
        }
        let name = self.client.name().to_string();
        let snapshot = self
            .publish_with(move |s| {
                s.backend = BackendStatus {
                    name,
                    reachable: Some(reachable),
                    latency_ms: Some(latency_ms),
                    last_error,
                    checked_at: Some(Utc::now()),
                };
            })
            .await;
        tracing::debug!(sequence = snapshot.sequence, "health: expensive cycle published");
        snapshot
    }

    /// 在调度器上启动两波检查
    pub fn start(self: &Arc<Self>, scheduler: &TaskScheduler, cheap: SchedulePolicy, expensive: SchedulePolicy) {
        let monitor = Arc::clone(self);
        scheduler.spawn_periodic("health.cheap", cheap, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                monitor.run_cheap_cycle().await;
            }
        });
        let monitor = Arc::clone(self);
        scheduler.spawn_periodic("health.expensive", expensive, move || {
            let monitor = Arc::clone(&monitor);
            async move {
                monitor.run_expensive_cycle().await;
            }
        });
        tracing::info!(
            cheap_delay_ms = cheap.initial_delay.as_millis() as u64,
            cheap_period_ms = cheap.period.as_millis() as u64,
            expensive_delay_ms = expensive.initial_delay.as_millis() as u64,
            expensive_period_ms = expensive.period.as_millis() as u64,
            "health monitor started"
        );
    }
}
