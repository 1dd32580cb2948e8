//! 工具执行器（调用层）
//!
//! invoke 总是返回 ActionResult，从不向上抛错：
//! - 未知工具 → UnknownTool 失败结果
//! - 声明了资源的工具先从资源池借子会话，等待引擎启动不超过本轮剩余时间；
//!   失败转为 PoolExhausted / PoolStartupFailed / Timeout 结果
//! - 在超时内执行并捕获 panic；正常结束归还资源，资源损坏或 panic 则回收，
//!   超时只放弃子会话（引擎可能只是在忙）
//! 每次调用输出一条 JSON 审计日志。

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::time::{timeout, Instant};

use crate::core::{AgentError, ErrorKind, RecoveryEngine};
use crate::memory::{ActionRequest, ActionResult};
use crate::pool::{AcquireMode, ResourceKind, ResourcePool};
use crate::tools::registry::panic_message;
use crate::tools::{FaultKind, ToolContext, ToolDescriptor, ToolRegistry};

/// 资源处置方式（写入审计日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    None,
    Released,
    Reclaimed,
    Abandoned,
}

impl Disposition {
    fn as_str(&self) -> &'static str {
        match self {
            Disposition::None => "none",
            Disposition::Released => "released",
            Disposition::Reclaimed => "reclaimed",
            Disposition::Abandoned => "abandoned",
        }
    }
}

/// 工具执行器：持有注册表、资源池与单次调用超时
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    pool: Arc<ResourcePool>,
    timeout: Duration,
    recovery: RecoveryEngine,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, pool: Arc<ResourcePool>, timeout: Duration) -> Self {
        Self {
            registry,
            pool,
            timeout,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.registry.descriptors()
    }

    /// 请求所用工具的资源类别（未知工具无资源）
    pub fn resource_of(&self, name: &str) -> Option<ResourceKind> {
        self.registry.get(name).and_then(|tool| tool.resource())
    }

    /// 一组请求中是否有两个动作争用同一类资源
    pub fn has_resource_conflict(&self, requests: &[ActionRequest]) -> bool {
        let mut seen = Vec::new();
        for kind in requests.iter().filter_map(|r| self.resource_of(&r.name)) {
            if seen.contains(&kind) {
                return true;
            }
            seen.push(kind);
        }
        false
    }

    fn failure(&self, request: &ActionRequest, err: &AgentError) -> ActionResult {
        ActionResult::failure(request, err.kind(), self.recovery.user_message(err))
    }

    /// 执行一个动作请求；deadline 为整轮期限，超时被裁剪到剩余时间
    pub async fn invoke(
        &self,
        request: &ActionRequest,
        conversation_id: &str,
        deadline: Option<Instant>,
    ) -> ActionResult {
        let started = Instant::now();
        let (result, disposition) = self.invoke_inner(request, conversation_id, deadline).await;

        let outcome = match result.failure_kind() {
            None => "ok".to_string(),
            Some(kind) => format!("{kind:?}"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "conversation_id": conversation_id,
            "tool": request.name,
            "call_id": request.id,
            "ok": result.is_success(),
            "outcome": outcome,
            "duration_ms": started.elapsed().as_millis() as u64,
            "args_preview": args_preview(&request.arguments),
            "resource": disposition.as_str(),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }

    async fn invoke_inner(
        &self,
        request: &ActionRequest,
        conversation_id: &str,
        deadline: Option<Instant>,
    ) -> (ActionResult, Disposition) {
        let Some(tool) = self.registry.get(&request.name) else {
            let err = AgentError::UnknownTool(request.name.clone());
            return (self.failure(request, &err), Disposition::None);
        };

        let remaining = |now: Instant| match deadline {
            Some(deadline) => deadline.saturating_duration_since(now),
            None => Duration::MAX,
        };
        let no_time_left = || AgentError::Timeout(format!("no time left to run '{}'", request.name));
        let wait_budget = remaining(Instant::now());
        if wait_budget.is_zero() {
            return (self.failure(request, &no_time_left()), Disposition::None);
        }

        let handle = match tool.resource() {
            Some(kind) => {
                let mode = match tool.acquire_mode() {
                    AcquireMode::FailFast => AcquireMode::FailFast,
                    AcquireMode::Wait(wait) => AcquireMode::Wait(wait.min(wait_budget)),
                };
                match self.pool.acquire_within(kind, mode, wait_budget).await {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        tracing::warn!(tool = %request.name, kind = %kind, error = %err, "resource unavailable");
                        let err = AgentError::from(err);
                        return (self.failure(request, &err), Disposition::None);
                    }
                }
            }
            None => None,
        };

        // 单次超时只计执行时间；整轮期限覆盖等待与执行
        let limit = remaining(Instant::now()).min(self.timeout);
        if limit.is_zero() {
            let disposition = match handle {
                Some(handle) => {
                    self.pool.release(handle);
                    Disposition::Released
                }
                None => Disposition::None,
            };
            return (self.failure(request, &no_time_left()), disposition);
        }

        let ctx = ToolContext {
            conversation_id,
            resource: handle.as_ref(),
        };
        let run = std::panic::AssertUnwindSafe(tool.execute(request.arguments.clone(), &ctx))
            .catch_unwind();
        let outcome = timeout(limit, run).await;

        let (result, disposition) = match outcome {
            Ok(Ok(Ok(output))) => (ActionResult::success(request, output), Disposition::Released),
            Ok(Ok(Err(fault))) => match fault.kind {
                FaultKind::InvalidArgs => (
                    ActionResult::failure(request, ErrorKind::InvalidArguments, fault.message),
                    Disposition::Released,
                ),
                FaultKind::Execution => {
                    let err = AgentError::ToolExecution(fault.message);
                    (self.failure(request, &err), Disposition::Released)
                }
                FaultKind::ResourceBroken => {
                    let err = AgentError::ToolExecution(fault.message);
                    (self.failure(request, &err), Disposition::Reclaimed)
                }
            },
            Ok(Err(panic)) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(tool = %request.name, panic = %msg, "tool panicked");
                let err = AgentError::ToolExecution(format!("'{}' crashed: {}", request.name, msg));
                (self.failure(request, &err), Disposition::Reclaimed)
            }
            Err(_) => {
                tracing::warn!(tool = %request.name, timeout_ms = limit.as_millis() as u64, "tool timed out");
                let err = AgentError::Timeout(format!(
                    "'{}' did not finish within {}ms",
                    request.name,
                    limit.as_millis()
                ));
                (self.failure(request, &err), Disposition::Abandoned)
            }
        };

        let Some(handle) = handle else {
            return (result, Disposition::None);
        };
        match disposition {
            Disposition::Released => self.pool.release(handle),
            Disposition::Reclaimed => self.pool.reclaim(handle).await,
            Disposition::Abandoned => self.pool.abandon(handle),
            Disposition::None => {}
        }
        (result, disposition)
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
