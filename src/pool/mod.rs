//! 资源池管理器
//!
//! 每种资源（浏览器、沙箱、模型）对应一个 ResourceSlot：
//! - 首次 acquire 时懒启动引擎；启动在后台任务中进行，结果经 watch 通道发布，
//!   并发调用方共享同一次启动，各自只等到自己的期限
//! - 容量由 Semaphore 限定，每个句柄是引擎上的一个逻辑子会话
//! - 句柄 release 归还容量；reclaim 丢弃会话并检查引擎，失活则退役、下次 acquire 重建；
//!   abandon 只丢弃会话（调用方超时），引擎仍在忙不代表损坏
//! - shutdown 幂等：拒绝新请求，有界等待在用句柄归还后关闭所有引擎

mod worker;

#[cfg(feature = "browser")]
pub mod browser;
pub mod mock;
pub mod model;
pub mod sandbox;

pub use worker::{Engine, EngineFactory, EngineFault, EngineWorker, SessionId};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

/// 池化资源类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Browser,
    Sandbox,
    /// 常驻内存的推理模型（OCR 等）
    Model,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Browser, ResourceKind::Sandbox, ResourceKind::Model];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Browser => "browser",
            ResourceKind::Sandbox => "sandbox",
            ResourceKind::Model => "model",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("no {0} capacity available")]
    Exhausted(ResourceKind),

    #[error("{kind} engine failed to start: {reason}")]
    StartupFailed { kind: ResourceKind, reason: String },

    /// 启动仍在进行，但调用方的等待期限已到
    #[error("{kind} engine not ready after {waited_ms}ms")]
    StartupTimedOut { kind: ResourceKind, waited_ms: u64 },

    #[error("resource pool is shut down")]
    ShutDown,

    #[error("no engine registered for {0}")]
    UnknownKind(ResourceKind),

    #[error("session error: {0}")]
    Session(String),
}

/// 容量耗尽时的行为，由调用方意图决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// 立即返回 Exhausted（延迟敏感的工具）
    FailFast,
    /// 最多等待给定时长（后台维护）
    Wait(Duration),
}

/// 某类资源的状态快照（不触碰引擎）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub kind: ResourceKind,
    pub started: bool,
    pub in_use: usize,
    pub capacity: usize,
    pub startups: u64,
    pub startup_failures: u64,
    pub acquired: u64,
    pub released: u64,
    pub reclaimed: u64,
    pub exhausted: u64,
    /// 最近一次探活结果；仅由健康检查填写
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alive: Option<bool>,
}

#[derive(Default)]
struct SlotCounters {
    startups: AtomicU64,
    startup_failures: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    reclaimed: AtomicU64,
    exhausted: AtomicU64,
}

/// 读取引擎捕获的输出文件；非 UTF-8 字节替换为 U+FFFD
pub(crate) fn read_captured(path: &std::path::Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "captured output unreadable");
            String::new()
        }
    }
}

pub(crate) fn truncate_output(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("\n...[truncated]");
    out
}

/// 一代引擎的启动状态
#[derive(Clone)]
enum Startup {
    Pending,
    Ready(Arc<EngineWorker>),
    Failed(String),
}

/// 一代引擎；启动失败或退役后整体替换
struct Generation {
    state: watch::Receiver<Startup>,
}

impl Generation {
    fn ready_worker(&self) -> Option<Arc<EngineWorker>> {
        match &*self.state.borrow() {
            Startup::Ready(worker) => Some(Arc::clone(worker)),
            _ => None,
        }
    }
}

struct ResourceSlot {
    kind: ResourceKind,
    factory: Arc<dyn EngineFactory>,
    capacity: usize,
    permits: Arc<Semaphore>,
    engine: Mutex<Option<Arc<Generation>>>,
    /// 置位后新启动完成的引擎立即停止
    closed: AtomicBool,
    counters: SlotCounters,
}

impl ResourceSlot {
    fn new(factory: Arc<dyn EngineFactory>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind: factory.kind(),
            factory,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            engine: Mutex::new(None),
            closed: AtomicBool::new(false),
            counters: SlotCounters::default(),
        }
    }

    fn generation_guard(&self) -> std::sync::MutexGuard<'_, Option<Arc<Generation>>> {
        match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn current_generation(&self) -> Option<Arc<Generation>> {
        self.generation_guard().clone()
    }

    /// 当前一代；没有则创建并在后台启动，调用方取消等待不会中断启动
    fn generation(self: &Arc<Self>) -> Arc<Generation> {
        let mut guard = self.generation_guard();
        if let Some(generation) = guard.as_ref() {
            return Arc::clone(generation);
        }
        let (tx, rx) = watch::channel(Startup::Pending);
        let generation = Arc::new(Generation { state: rx });
        *guard = Some(Arc::clone(&generation));
        drop(guard);

        let slot = Arc::clone(self);
        tokio::spawn(async move {
            let state = match slot.launch().await {
                Ok(worker) => Startup::Ready(worker),
                Err(reason) => Startup::Failed(reason),
            };
            tx.send_replace(state.clone());
            // 启动期间池已关闭：没人会再关闭它
            if let Startup::Ready(worker) = state {
                if slot.closed.load(Ordering::SeqCst) {
                    worker.stop();
                }
            }
        });
        generation
    }

    /// 仅当仍是当前这一代时才替换，避免并发调用方重复替换
    fn replace_generation(&self, stale: &Arc<Generation>) -> bool {
        let mut guard = self.generation_guard();
        match guard.as_ref() {
            Some(current) if Arc::ptr_eq(current, stale) => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    fn started_worker(&self) -> Option<Arc<EngineWorker>> {
        self.current_generation()
            .and_then(|generation| generation.ready_worker())
            .filter(|worker| worker.is_alive())
    }

    async fn launch(&self) -> Result<Arc<EngineWorker>, String> {
        self.counters.startups.fetch_add(1, Ordering::SeqCst);
        tracing::info!(kind = %self.kind, "starting engine");
        let started = std::time::Instant::now();
        match EngineWorker::spawn(Arc::clone(&self.factory)).await {
            Ok(worker) => {
                tracing::info!(
                    kind = %self.kind,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "engine ready"
                );
                Ok(worker)
            }
            Err(reason) => {
                self.counters.startup_failures.fetch_add(1, Ordering::SeqCst);
                tracing::error!(kind = %self.kind, reason = %reason, "engine startup failed");
                Err(reason)
            }
        }
    }

    /// 取得已启动的引擎；未启动则懒启动，并发调用方只会触发一次启动。
    /// 最多等待 limit，超时返回 StartupTimedOut，启动本身继续进行
    async fn engine(self: &Arc<Self>, limit: Duration) -> Result<Arc<EngineWorker>, PoolError> {
        let deadline = Instant::now() + limit;
        for _ in 0..2 {
            let generation = self.generation();
            let mut state = generation.state.clone();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match tokio::time::timeout(
                remaining,
                state.wait_for(|s| !matches!(s, Startup::Pending)),
            )
            .await
            {
                Ok(Ok(current)) => (*current).clone(),
                Ok(Err(_)) => Startup::Failed("engine startup task ended without a result".to_string()),
                Err(_) => {
                    tracing::warn!(kind = %self.kind, waited_ms = limit.as_millis() as u64, "engine still starting, caller gave up");
                    return Err(PoolError::StartupTimedOut {
                        kind: self.kind,
                        waited_ms: limit.as_millis() as u64,
                    });
                }
            };
            match outcome {
                Startup::Ready(worker) if worker.is_alive() => return Ok(worker),
                Startup::Failed(reason) => {
                    self.replace_generation(&generation);
                    return Err(PoolError::StartupFailed {
                        kind: self.kind,
                        reason,
                    });
                }
                _ => {
                    tracing::warn!(kind = %self.kind, "engine worker exited, restarting lazily");
                    self.replace_generation(&generation);
                }
            }
        }
        Err(PoolError::StartupFailed {
            kind: self.kind,
            reason: "engine exited immediately after startup".to_string(),
        })
    }

    /// 退役指定引擎（若它仍是当前一代）；下次 acquire 重建
    fn retire(&self, worker: &Arc<EngineWorker>) {
        if let Some(generation) = self.current_generation() {
            let is_current = generation
                .ready_worker()
                .is_some_and(|current| Arc::ptr_eq(&current, worker));
            if is_current && self.replace_generation(&generation) {
                tracing::warn!(kind = %self.kind, "retiring unhealthy engine");
            }
        }
        worker.stop();
    }

    fn status(&self) -> ResourceStatus {
        let c = &self.counters;
        ResourceStatus {
            kind: self.kind,
            started: self.started_worker().is_some(),
            in_use: self.capacity.saturating_sub(self.permits.available_permits()),
            capacity: self.capacity,
            startups: c.startups.load(Ordering::SeqCst),
            startup_failures: c.startup_failures.load(Ordering::SeqCst),
            acquired: c.acquired.load(Ordering::SeqCst),
            released: c.released.load(Ordering::SeqCst),
            reclaimed: c.reclaimed.load(Ordering::SeqCst),
            exhausted: c.exhausted.load(Ordering::SeqCst),
            alive: None,
        }
    }
}

/// 引擎是否可用：正在执行命令（且未超过 busy_limit）即视为存活，
/// 空闲时须在 ping_timeout 内应答
async fn responsive(worker: &EngineWorker, ping_timeout: Duration, busy_limit: Duration) -> bool {
    if !worker.is_alive() {
        return false;
    }
    let busy = |w: &EngineWorker| w.busy_for().is_some_and(|d| d < busy_limit);
    if busy(worker) {
        return true;
    }
    // ping 排在一条刚开始的命令之后时，超时也不算失活
    worker.ping(ping_timeout).await || busy(worker)
}

/// 资源池：显式构造、注入到编排器与健康监控，进程退出前显式 shutdown
pub struct ResourcePool {
    slots: HashMap<ResourceKind, Arc<ResourceSlot>>,
    closed: AtomicBool,
    ping_timeout: Duration,
    startup_timeout: Duration,
    busy_limit: Duration,
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("kinds", &self.kinds())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourcePool {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            closed: AtomicBool::new(false),
            ping_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(60),
            busy_limit: Duration::from_secs(300),
        }
    }

    /// 注册一种资源的引擎工厂与最大并发子会话数
    pub fn with_engine(mut self, factory: Arc<dyn EngineFactory>, capacity: usize) -> Self {
        let slot = ResourceSlot::new(factory, capacity);
        self.slots.insert(slot.kind, Arc::new(slot));
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// acquire / warm_up 等待引擎启动的默认上限
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// 一条命令执行超过该时长后，忙碌不再视为存活
    pub fn with_busy_limit(mut self, limit: Duration) -> Self {
        self.busy_limit = limit;
        self
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<_> = self.slots.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn slot(&self, kind: ResourceKind) -> Result<&Arc<ResourceSlot>, PoolError> {
        self.slots.get(&kind).ok_or(PoolError::UnknownKind(kind))
    }

    /// 取得一个就绪的子会话句柄
    pub async fn acquire(
        &self,
        kind: ResourceKind,
        mode: AcquireMode,
    ) -> Result<PooledHandle, PoolError> {
        self.acquire_within(kind, mode, self.startup_timeout).await
    }

    /// 同 acquire，但等待引擎启动最多 startup_limit（调用方有自己的期限时使用）
    pub async fn acquire_within(
        &self,
        kind: ResourceKind,
        mode: AcquireMode,
        startup_limit: Duration,
    ) -> Result<PooledHandle, PoolError> {
        if self.is_closed() {
            return Err(PoolError::ShutDown);
        }
        let slot = self.slot(kind)?;

        let permit = match mode {
            AcquireMode::FailFast => match Arc::clone(&slot.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    slot.counters.exhausted.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(kind = %kind, "pool exhausted (fail fast)");
                    return Err(PoolError::Exhausted(kind));
                }
                Err(TryAcquireError::Closed) => return Err(PoolError::ShutDown),
            },
            AcquireMode::Wait(limit) => {
                match tokio::time::timeout(limit, Arc::clone(&slot.permits).acquire_owned()).await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(PoolError::ShutDown),
                    Err(_) => {
                        slot.counters.exhausted.fetch_add(1, Ordering::SeqCst);
                        tracing::debug!(kind = %kind, wait_ms = limit.as_millis() as u64, "pool exhausted (wait)");
                        return Err(PoolError::Exhausted(kind));
                    }
                }
            }
        };
        if self.is_closed() {
            return Err(PoolError::ShutDown);
        }

        let worker = slot.engine(startup_limit.min(self.startup_timeout)).await?;
        let session = match worker.open_session().await {
            Ok(session) => session,
            Err(err) => {
                if !worker.is_alive() {
                    slot.retire(&worker);
                }
                return Err(err);
            }
        };
        slot.counters.acquired.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(kind = %kind, session, "resource acquired");

        Ok(PooledHandle {
            kind,
            session,
            worker,
            slot: Arc::clone(slot),
            permit: Some(permit),
            ping_timeout: self.ping_timeout,
            busy_limit: self.busy_limit,
            settled: false,
        })
    }

    /// 归还句柄，子会话关闭、容量可复用
    pub fn release(&self, handle: PooledHandle) {
        handle.release();
    }

    /// 句柄所在资源疑似损坏：丢弃子会话并探活，失活则退役引擎
    pub async fn reclaim(&self, handle: PooledHandle) {
        handle.reclaim().await;
    }

    /// 调用方超时：丢弃子会话，不探活不退役
    pub fn abandon(&self, handle: PooledHandle) {
        handle.abandon();
    }

    /// 预热：启动引擎但不占用容量
    pub async fn warm_up(&self, kind: ResourceKind) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::ShutDown);
        }
        self.slot(kind)?.engine(self.startup_timeout).await.map(|_| ())
    }

    /// 重新启动上次启动失败、目前也未运行的引擎；返回成功启动的类别
    pub async fn reload_failed(&self) -> Vec<ResourceKind> {
        let mut reloaded = Vec::new();
        for status in self.status() {
            if self.is_closed() {
                break;
            }
            let pending = self
                .slots
                .get(&status.kind)
                .and_then(|slot| slot.current_generation())
                .is_some_and(|generation| matches!(*generation.state.borrow(), Startup::Pending));
            if status.started || status.startup_failures == 0 || pending {
                continue;
            }
            tracing::info!(kind = %status.kind, failures = status.startup_failures, "reloading failed engine");
            match self.warm_up(status.kind).await {
                Ok(()) => reloaded.push(status.kind),
                Err(err) => tracing::warn!(kind = %status.kind, error = %err, "engine reload failed"),
            }
        }
        reloaded
    }

    /// 各类资源的状态（不启动、不探活）
    pub fn status(&self) -> Vec<ResourceStatus> {
        self.kinds()
            .into_iter()
            .filter_map(|kind| self.slots.get(&kind).map(|slot| slot.status()))
            .collect()
    }

    /// 探活已启动的引擎；未启动返回 None
    pub async fn ping(&self, kind: ResourceKind) -> Result<Option<bool>, PoolError> {
        let slot = self.slot(kind)?;
        match slot.started_worker() {
            Some(worker) => Ok(Some(
                responsive(&worker, self.ping_timeout, self.busy_limit).await,
            )),
            None => Ok(None),
        }
    }

    /// 关闭资源池：幂等；有界等待在用句柄归还后关闭全部引擎
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("resource pool shutting down");

        for slot in self.slots.values() {
            slot.closed.store(true, Ordering::SeqCst);
        }
        let drains = self.slots.values().map(|slot| {
            let slot = Arc::clone(slot);
            let ping_timeout = self.ping_timeout;
            async move {
                let drained = tokio::time::timeout(
                    drain_timeout,
                    Arc::clone(&slot.permits).acquire_many_owned(slot.capacity as u32),
                )
                .await;
                match drained {
                    Ok(_) => {}
                    Err(_) => tracing::warn!(
                        kind = %slot.kind,
                        in_use = slot.status().in_use,
                        "drain timed out, tearing down with handles still in use"
                    ),
                }
                slot.permits.close();
                if let Some(worker) = slot.current_generation().and_then(|g| g.ready_worker()) {
                    worker.shutdown(ping_timeout).await;
                }
            }
        });
        futures_util::future::join_all(drains).await;
        tracing::info!("resource pool shut down");
    }
}

/// 一个子会话的独占租约；release / reclaim 消耗句柄，直接 Drop 视为回收
pub struct PooledHandle {
    kind: ResourceKind,
    session: SessionId,
    worker: Arc<EngineWorker>,
    slot: Arc<ResourceSlot>,
    permit: Option<OwnedSemaphorePermit>,
    ping_timeout: Duration,
    busy_limit: Duration,
    settled: bool,
}

impl fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("kind", &self.kind)
            .field("session", &self.session)
            .finish()
    }
}

impl PooledHandle {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// 在本子会话上执行一条命令（命令格式由引擎定义）
    pub async fn run(&self, command: Value) -> Result<String, EngineFault> {
        self.worker.execute(self.session, command).await
    }

    fn settle(&mut self) {
        self.settled = true;
        self.worker.close_session(self.session);
        self.permit.take();
    }

    pub fn release(mut self) {
        self.settle();
        self.slot.counters.released.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(kind = %self.kind, session = self.session, "resource released");
    }

    pub async fn reclaim(mut self) {
        self.settle();
        self.slot.counters.reclaimed.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(kind = %self.kind, session = self.session, "resource reclaimed");
        if !responsive(&self.worker, self.ping_timeout, self.busy_limit).await {
            self.slot.retire(&self.worker);
        }
    }

    /// 调用方放弃等待：会话关闭请求排在进行中的命令之后，引擎保持原样
    pub fn abandon(mut self) {
        self.settle();
        self.slot.counters.reclaimed.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(kind = %self.kind, session = self.session, "resource abandoned after caller timeout");
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if !self.settled {
            self.settle();
            self.slot.counters.reclaimed.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(kind = %self.kind, session = self.session, "resource handle dropped without release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockEngineFactory;
    use super::*;
    use serde_json::json;

    fn pool_with(factory: &MockEngineFactory, capacity: usize) -> ResourcePool {
        ResourcePool::new()
            .with_engine(Arc::new(factory.clone()), capacity)
            .with_ping_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_acquire_starts_engine_lazily() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = pool_with(&factory, 2);
        assert_eq!(factory.launches(), 0);
        assert!(!pool.status()[0].started);

        let handle = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();
        assert_eq!(factory.launches(), 1);
        let out = handle.run(json!({"op": "echo", "text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
        pool.release(handle);

        let status = pool.status()[0].clone();
        assert!(status.started);
        assert_eq!(status.in_use, 0);
        assert_eq!(status.acquired, 1);
        assert_eq!(status.released, 1);
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = pool_with(&factory, 1);
        let err = pool
            .acquire(ResourceKind::Browser, AcquireMode::FailFast)
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::UnknownKind(ResourceKind::Browser));
    }

    #[tokio::test]
    async fn test_wait_mode_times_out_as_exhausted() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = pool_with(&factory, 1);
        let held = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();
        let err = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::Wait(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::Exhausted(ResourceKind::Sandbox));
        pool.release(held);
        assert_eq!(pool.status()[0].exhausted, 1);
    }

    #[tokio::test]
    async fn test_dropped_handle_counts_as_reclaimed() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = pool_with(&factory, 1);
        let handle = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();
        drop(handle);
        let status = pool.status()[0].clone();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.reclaimed, 1);
        assert!(pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_reclaim_broken_engine_restarts_lazily() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = pool_with(&factory, 1);
        let handle = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();
        let fault = handle.run(json!({"op": "crash"})).await.unwrap_err();
        assert!(matches!(fault, EngineFault::Broken(_)));
        pool.reclaim(handle).await;
        assert!(!pool.status()[0].started);

        let handle = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();
        assert_eq!(factory.launches(), 2);
        pool.release(handle);
    }

    #[tokio::test]
    async fn test_reclaim_healthy_engine_keeps_it() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = pool_with(&factory, 1);
        let handle = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();
        pool.reclaim(handle).await;
        assert!(pool.status()[0].started);
        let handle = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();
        assert_eq!(factory.launches(), 1);
        pool.release(handle);
    }

    #[tokio::test]
    async fn test_warm_up_and_ping() {
        let factory = MockEngineFactory::new(ResourceKind::Browser);
        let pool = pool_with(&factory, 1);
        assert_eq!(pool.ping(ResourceKind::Browser).await.unwrap(), None);
        pool.warm_up(ResourceKind::Browser).await.unwrap();
        assert_eq!(pool.ping(ResourceKind::Browser).await.unwrap(), Some(true));
        assert_eq!(pool.status()[0].in_use, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_startup_is_bounded_by_caller_limit() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox)
            .with_startup_delay(Duration::from_millis(600));
        let pool = pool_with(&factory, 2);

        let started = Instant::now();
        let err = pool
            .acquire_within(ResourceKind::Sandbox, AcquireMode::FailFast, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::StartupTimedOut { kind: ResourceKind::Sandbox, .. }));
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(pool.status()[0].in_use, 0);

        // 启动仍在后台进行，下一个调用方接上同一次启动
        let handle = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();
        assert_eq!(factory.launches(), 1);
        pool.release(handle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_startup_finishing_after_shutdown_is_stopped() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox)
            .with_startup_delay(Duration::from_millis(200));
        let pool = pool_with(&factory, 1);
        let err = pool
            .acquire_within(ResourceKind::Sandbox, AcquireMode::FailFast, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::StartupTimedOut { .. }));

        pool.shutdown(Duration::from_millis(50)).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(factory.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_reload_failed_restarts_only_failed_kinds() {
        let broken = MockEngineFactory::new(ResourceKind::Model).failing();
        let idle = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = ResourcePool::new()
            .with_engine(Arc::new(broken.clone()), 1)
            .with_engine(Arc::new(idle.clone()), 1);

        assert!(matches!(
            pool.warm_up(ResourceKind::Model).await,
            Err(PoolError::StartupFailed { .. })
        ));
        assert!(pool.reload_failed().await.is_empty());
        assert_eq!(broken.launches(), 2);

        broken.set_fail_startup(false);
        assert_eq!(pool.reload_failed().await, vec![ResourceKind::Model]);
        assert_eq!(broken.launches(), 3);
        // 从未失败的类别保持懒启动
        assert_eq!(idle.launches(), 0);
        assert!(pool.reload_failed().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_busy_engine_counts_as_alive() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = Arc::new(pool_with(&factory, 2));
        let handle = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();
        let slow = tokio::spawn(async move {
            let out = handle.run(json!({"op": "sleep", "ms": 500})).await;
            (handle, out)
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.ping(ResourceKind::Sandbox).await.unwrap(), Some(true));

        let (handle, out) = slow.await.unwrap();
        assert!(out.is_ok());
        pool.abandon(handle);
        let status = pool.status()[0].clone();
        assert!(status.started);
        assert_eq!(status.reclaimed, 1);
        assert_eq!(factory.launches(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_command_past_busy_limit_is_not_alive() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = Arc::new(pool_with(&factory, 1).with_busy_limit(Duration::from_millis(50)));
        let handle = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap();
        let slow = tokio::spawn(async move {
            let _ = handle.run(json!({"op": "sleep", "ms": 600})).await;
            handle
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.ping(ResourceKind::Sandbox).await.unwrap(), Some(false));
        pool.release(slow.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_rejects_acquire() {
        let factory = MockEngineFactory::new(ResourceKind::Sandbox);
        let pool = pool_with(&factory, 2);
        pool.warm_up(ResourceKind::Sandbox).await.unwrap();
        pool.shutdown(Duration::from_millis(100)).await;
        pool.shutdown(Duration::from_millis(100)).await;
        let err = pool
            .acquire(ResourceKind::Sandbox, AcquireMode::FailFast)
            .await
            .unwrap_err();
        assert_eq!(err, PoolError::ShutDown);
        assert_eq!(factory.shutdowns(), 1);
    }
}
