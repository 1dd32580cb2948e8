//! 引擎工作线程
//!
//! 不可跨线程共享的引擎（浏览器、沙箱等）固定运行在一个专用 OS 线程上，
//! 所有调用方通过 mpsc 请求 + oneshot 应答与之通信，不直接持有引擎对象。
//! 工作线程执行命令期间记录开始时刻，探活据此区分「忙」与「卡死」。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::{PoolError, ResourceKind};

/// 引擎内的逻辑子会话 ID（浏览器 tab、沙箱工作目录等）
pub type SessionId = u64;

/// 单条命令的执行失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineFault {
    /// 会话或引擎已损坏，句柄应被回收而非归还
    #[error("resource broken: {0}")]
    Broken(String),
    /// 命令本身失败，资源仍可复用
    #[error("{0}")]
    Failed(String),
}

/// 昂贵的有状态引擎；只在其工作线程上被访问，因此无需 Send / Sync
pub trait Engine {
    fn open_session(&mut self) -> Result<SessionId, String>;

    fn close_session(&mut self, session: SessionId);

    fn execute(&mut self, session: SessionId, command: &Value) -> Result<String, EngineFault>;

    /// 轻量存活检查
    fn ping(&mut self) -> bool;

    fn shutdown(&mut self);
}

/// 在工作线程上启动引擎（可能耗时数秒）
pub trait EngineFactory: Send + Sync {
    fn kind(&self) -> ResourceKind;

    fn launch(&self) -> Result<Box<dyn Engine>, String>;
}

enum EngineRequest {
    Open(oneshot::Sender<Result<SessionId, String>>),
    Close(SessionId),
    Execute {
        session: SessionId,
        command: Value,
        reply: oneshot::Sender<Result<String, EngineFault>>,
    },
    Ping(oneshot::Sender<bool>),
    Shutdown(Option<oneshot::Sender<()>>),
}

/// 工作线程当前是否在执行命令
struct Activity {
    epoch: Instant,
    /// 0 表示空闲，否则为开始时刻（相对 epoch 的毫秒数加一）
    busy_since_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            busy_since_ms: AtomicU64::new(0),
        }
    }

    fn busy_for(&self) -> Option<Duration> {
        match self.busy_since_ms.load(Ordering::SeqCst) {
            0 => None,
            since => {
                let now = self.epoch.elapsed().as_millis() as u64;
                Some(Duration::from_millis(now.saturating_sub(since - 1)))
            }
        }
    }

    fn enter(&self) -> BusyGuard<'_> {
        let since = self.epoch.elapsed().as_millis() as u64 + 1;
        self.busy_since_ms.store(since, Ordering::SeqCst);
        BusyGuard(self)
    }
}

/// 命令结束（含 panic 展开）时清除忙碌标记
struct BusyGuard<'a>(&'a Activity);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.busy_since_ms.store(0, Ordering::SeqCst);
    }
}

/// 引擎工作线程的句柄；克隆 Arc 即可在多个任务间共享
pub struct EngineWorker {
    kind: ResourceKind,
    tx: mpsc::UnboundedSender<EngineRequest>,
    activity: Arc<Activity>,
}

impl std::fmt::Debug for EngineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineWorker")
            .field("kind", &self.kind)
            .field("alive", &self.is_alive())
            .field("busy", &self.busy_for().is_some())
            .finish()
    }
}

impl EngineWorker {
    /// 创建工作线程并在其上启动引擎；引擎就绪或启动失败后返回
    pub async fn spawn(factory: Arc<dyn EngineFactory>) -> Result<Arc<Self>, String> {
        let kind = factory.kind();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let activity = Arc::new(Activity::new());

        let thread_activity = Arc::clone(&activity);
        std::thread::Builder::new()
            .name(format!("{kind}-engine"))
            .spawn(move || run_engine(factory, rx, ready_tx, thread_activity))
            .map_err(|e| format!("failed to spawn engine thread: {e}"))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Arc::new(Self { kind, tx, activity })),
            Ok(Err(reason)) => Err(reason),
            Err(_) => Err("engine thread exited during startup".to_string()),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// 工作线程是否仍在接收请求
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// 正在执行的命令已持续多久；空闲时为 None
    pub fn busy_for(&self) -> Option<Duration> {
        self.activity.busy_for()
    }

    pub async fn open_session(&self) -> Result<SessionId, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Open(reply))
            .map_err(|_| PoolError::Session(format!("{} engine is not running", self.kind)))?;
        rx.await
            .map_err(|_| PoolError::Session(format!("{} engine stopped", self.kind)))?
            .map_err(PoolError::Session)
    }

    /// 同步发送关闭请求（Drop 路径也可调用）
    pub fn close_session(&self, session: SessionId) {
        let _ = self.tx.send(EngineRequest::Close(session));
    }

    pub async fn execute(&self, session: SessionId, command: Value) -> Result<String, EngineFault> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Execute {
                session,
                command,
                reply,
            })
            .map_err(|_| EngineFault::Broken(format!("{} engine is not running", self.kind)))?;
        rx.await
            .map_err(|_| EngineFault::Broken(format!("{} engine stopped", self.kind)))?
    }

    /// 在 timeout 内应答 true 才算存活
    pub async fn ping(&self, timeout: Duration) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EngineRequest::Ping(reply)).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(true)))
    }

    /// 请求关闭引擎并等待确认（最多 timeout）
    pub async fn shutdown(&self, timeout: Duration) {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(EngineRequest::Shutdown(Some(ack))).is_err() {
            return;
        }
        if tokio::time::timeout(timeout, rx).await.is_err() {
            tracing::warn!(kind = %self.kind, "engine did not acknowledge shutdown in time");
        }
    }

    /// 不等待确认的关闭（用于退役引擎）
    pub fn stop(&self) {
        let _ = self.tx.send(EngineRequest::Shutdown(None));
    }
}

fn run_engine(
    factory: Arc<dyn EngineFactory>,
    mut rx: mpsc::UnboundedReceiver<EngineRequest>,
    ready: oneshot::Sender<Result<(), String>>,
    activity: Arc<Activity>,
) {
    let kind = factory.kind();
    let mut engine = match factory.launch() {
        Ok(engine) => {
            let _ = ready.send(Ok(()));
            engine
        }
        Err(reason) => {
            let _ = ready.send(Err(reason));
            return;
        }
    };
    tracing::debug!(kind = %kind, "engine worker running");

    while let Some(request) = rx.blocking_recv() {
        match request {
            EngineRequest::Open(reply) => {
                let _ = reply.send(engine.open_session());
            }
            EngineRequest::Close(session) => engine.close_session(session),
            EngineRequest::Execute {
                session,
                command,
                reply,
            } => {
                let result = {
                    let _busy = activity.enter();
                    engine.execute(session, &command)
                };
                let _ = reply.send(result);
            }
            EngineRequest::Ping(reply) => {
                let _ = reply.send(engine.ping());
            }
            EngineRequest::Shutdown(ack) => {
                engine.shutdown();
                tracing::debug!(kind = %kind, "engine worker stopped");
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return;
            }
        }
    }

    // 所有发送端已释放
    engine.shutdown();
}
