//! Mock 引擎（用于测试与无外部依赖的本地运行）
//!
//! 命令格式：`{"op": "echo" | "sleep" | "crash" | "fail" | "panic", ...}`
//! - echo：返回 text 字段
//! - sleep：阻塞工作线程 ms 毫秒
//! - crash：标记引擎损坏，返回 Broken，之后 ping 失败
//! - fail：返回 Failed（资源仍可复用）
//! - panic：工作线程 panic（模拟引擎进程崩溃）

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::{Engine, EngineFactory, EngineFault, ResourceKind, SessionId};

#[derive(Default)]
struct MockState {
    launches: AtomicUsize,
    shutdowns: AtomicUsize,
    open_sessions: AtomicUsize,
    max_open_sessions: AtomicUsize,
    fail_startup: AtomicBool,
}

/// 可配置的 mock 引擎工厂；Clone 共享计数器，测试保留一份即可观察
#[derive(Clone)]
pub struct MockEngineFactory {
    kind: ResourceKind,
    startup_delay: Duration,
    state: Arc<MockState>,
}

impl MockEngineFactory {
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            startup_delay: Duration::ZERO,
            state: Arc::new(MockState::default()),
        }
    }

    /// 模拟耗时启动
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// 启动总是失败
    pub fn failing(self) -> Self {
        self.state.fail_startup.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_startup(&self, fail: bool) {
        self.state.fail_startup.store(fail, Ordering::SeqCst);
    }

    /// launch 被调用的次数（含失败）
    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.state.shutdowns.load(Ordering::SeqCst)
    }

    /// 当前所有引擎上打开的子会话数
    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    pub fn max_open_sessions(&self) -> usize {
        self.state.max_open_sessions.load(Ordering::SeqCst)
    }
}

impl EngineFactory for MockEngineFactory {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn launch(&self) -> Result<Box<dyn Engine>, String> {
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        if !self.startup_delay.is_zero() {
            std::thread::sleep(self.startup_delay);
        }
        if self.state.fail_startup.load(Ordering::SeqCst) {
            return Err(format!("mock {} engine refused to start", self.kind));
        }
        Ok(Box::new(MockEngine {
            state: Arc::clone(&self.state),
            sessions: HashSet::new(),
            next_session: 1,
            healthy: true,
        }))
    }
}

struct MockEngine {
    state: Arc<MockState>,
    sessions: HashSet<SessionId>,
    next_session: SessionId,
    healthy: bool,
}

impl Engine for MockEngine {
    fn open_session(&mut self) -> Result<SessionId, String> {
        if !self.healthy {
            return Err("mock engine is broken".to_string());
        }
        let id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(id);
        let open = self.state.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open_sessions.fetch_max(open, Ordering::SeqCst);
        Ok(id)
    }

    fn close_session(&mut self, session: SessionId) {
        if self.sessions.remove(&session) {
            self.state.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn execute(&mut self, session: SessionId, command: &Value) -> Result<String, EngineFault> {
        if !self.healthy {
            return Err(EngineFault::Broken("mock engine is broken".to_string()));
        }
        if !self.sessions.contains(&session) {
            return Err(EngineFault::Broken(format!("unknown session {session}")));
        }
        match command.get("op").and_then(|v| v.as_str()).unwrap_or("echo") {
            "echo" => Ok(command
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()),
            "sleep" => {
                let ms = command.get("ms").and_then(|v| v.as_u64()).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                Ok(format!("slept {ms}ms"))
            }
            "crash" => {
                self.healthy = false;
                Err(EngineFault::Broken("mock engine crashed".to_string()))
            }
            "fail" => Err(EngineFault::Failed(
                command
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("mock command failed")
                    .to_string(),
            )),
            "panic" => panic!("mock engine panicked"),
            other => Err(EngineFault::Failed(format!("unknown op: {other}"))),
        }
    }

    fn ping(&mut self) -> bool {
        self.healthy
    }

    fn shutdown(&mut self) {
        let open = self.sessions.len();
        self.sessions.clear();
        self.state.open_sessions.fetch_sub(open, Ordering::SeqCst);
        self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
