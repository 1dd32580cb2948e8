//! 集成测试共用的工具与编排器装配

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use toolhive::core::{HealthMonitor, Orchestrator, OrchestratorSettings, RetryPolicy};
use toolhive::llm::{LlmClient, ModelGateway};
use toolhive::pool::{ResourceKind, ResourcePool};
use toolhive::tools::{EchoTool, Tool, ToolContext, ToolExecutor, ToolFault, ToolRegistry};

/// 把参数原样作为命令发给借到的沙箱子会话（mock 引擎按 op 字段执行）
pub struct EngineCommandTool;

#[async_trait]
impl Tool for EngineCommandTool {
    fn name(&self) -> &str {
        "engine_cmd"
    }

    fn description(&self) -> &str {
        "Run a raw engine command"
    }

    fn resource(&self) -> Option<ResourceKind> {
        Some(ResourceKind::Sandbox)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext<'_>) -> Result<String, ToolFault> {
        let handle = ctx.resource()?;
        handle.run(args).await.map_err(ToolFault::from)
    }
}

/// 借到资源后直接 panic
pub struct PanickingTool;

#[async_trait]
impl Tool for PanickingTool {
    fn name(&self) -> &str {
        "explode"
    }

    fn description(&self) -> &str {
        "Always panics"
    }

    fn resource(&self) -> Option<ResourceKind> {
        Some(ResourceKind::Sandbox)
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext<'_>) -> Result<String, ToolFault> {
        panic!("handler blew up");
    }
}

pub fn registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(EngineCommandTool);
    registry.register(PanickingTool);
    Arc::new(registry)
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_backoff(Duration::from_millis(5), Duration::from_millis(20))
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub monitor: Arc<HealthMonitor>,
    pub pool: Arc<ResourcePool>,
}

pub fn harness(
    client: Arc<dyn LlmClient>,
    pool: Arc<ResourcePool>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    settings: OrchestratorSettings,
) -> Harness {
    let registry = registry();
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&pool),
        Arc::clone(&client),
        Arc::clone(&registry),
        Duration::from_millis(200),
    ));
    let orchestrator = Orchestrator::new(
        ModelGateway::new(client, retry, attempt_timeout),
        ToolExecutor::new(registry, Arc::clone(&pool), Duration::from_secs(2)),
        Arc::clone(&monitor),
        "You are a test assistant.",
        settings,
    );
    Harness {
        orchestrator,
        monitor,
        pool,
    }
}
