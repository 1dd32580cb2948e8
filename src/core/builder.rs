//! 运行时构建器：统一的初始化逻辑
//!
//! 从 AppConfig 构建模型后端、资源池、工具注册表、健康监控与编排器；
//! 测试可注入自己的后端 / 资源池 / 注册表。CLI 与 Web 共享同一套组件。

use std::sync::Arc;
use std::time::Duration;

use crate::config::{load_system_prompt, AppConfig};
use crate::core::{
    DrainPool, HealthMonitor, Orchestrator, OrchestratorSettings, SchedulePolicy,
    ShutdownCoordinator, ShutdownManager, StopScheduler, TaskScheduler,
};
use crate::llm::{LlmClient, MockLlmClient, ModelGateway, OpenAiClient};
use crate::pool::model::ModelEngineFactory;
use crate::pool::sandbox::SandboxEngineFactory;
use crate::pool::{ResourceKind, ResourcePool};
use crate::tools::{
    tool_call_schema_json, EchoTool, ImageOcrTool, SandboxExecTool, ToolExecutor, ToolRegistry, WebFetchTool,
};

/// 根据配置与环境变量选择模型后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM");
        return Arc::new(MockLlmClient);
    }
    let Ok(api_key) = std::env::var(&cfg.llm.api_key_env) else {
        tracing::warn!("{} not set, using Mock LLM", cfg.llm.api_key_env);
        return Arc::new(MockLlmClient);
    };
    match OpenAiClient::new(
        cfg.llm.base_url.as_deref(),
        &cfg.llm.model,
        Some(&api_key),
        Duration::from_secs(cfg.llm.request_timeout_secs),
    ) {
        Ok(client) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(client)
        }
        Err(e) => {
            tracing::warn!("LLM client init failed ({}), using Mock LLM", e);
            Arc::new(MockLlmClient)
        }
    }
}

/// 按配置登记引擎
pub fn build_pool(cfg: &AppConfig) -> ResourcePool {
    let mut pool = ResourcePool::new()
        .with_ping_timeout(Duration::from_secs(cfg.pool.ping_timeout_secs.max(1)))
        .with_startup_timeout(Duration::from_secs(cfg.pool.startup_timeout_secs.max(1)))
        .with_busy_limit(Duration::from_secs(cfg.pool.busy_limit_secs.max(1)));
    if cfg.tools.sandbox.enabled {
        pool = pool.with_engine(
            Arc::new(SandboxEngineFactory::new(
                cfg.tools.sandbox.root.clone(),
                Duration::from_secs(cfg.tools.tool_timeout_secs),
                cfg.tools.sandbox.max_output_chars,
            )),
            cfg.pool.sandbox_max_sessions,
        );
    }
    if cfg.tools.ocr.enabled {
        let ocr = &cfg.tools.ocr;
        pool = pool.with_engine(
            Arc::new(ModelEngineFactory::new(
                ocr.command.clone(),
                ocr.languages.clone(),
                Duration::from_secs(ocr.inference_timeout_secs.max(1)),
                ocr.max_output_chars,
            )),
            cfg.pool.model_max_sessions,
        );
    }
    #[cfg(feature = "browser")]
    {
        if cfg.tools.browser.enabled {
            pool = pool.with_engine(
                Arc::new(crate::pool::browser::BrowserEngineFactory::new(
                    cfg.tools.browser.max_result_chars,
                )),
                cfg.pool.browser_max_sessions,
            );
        }
    }
    pool
}

/// 构建工具注册表；单个工具初始化失败只记录，不影响其他工具
pub fn build_tool_registry(cfg: &AppConfig) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);

    if cfg.tools.fetch.enabled {
        let fetch = cfg.tools.fetch.clone();
        tools.register_with("web_fetch", move || {
            WebFetchTool::new(
                fetch.allowed_domains,
                Duration::from_secs(fetch.timeout_secs),
                fetch.max_result_chars,
            )
        });
    }
    if cfg.tools.sandbox.enabled {
        tools.register(SandboxExecTool::new(cfg.tools.sandbox.allowed_commands.clone()));
    }
    if cfg.tools.ocr.enabled {
        tools.register(ImageOcrTool::new(Duration::from_secs(cfg.tools.ocr.acquire_wait_secs)));
    }

    #[cfg(feature = "browser")]
    {
        if cfg.tools.browser.enabled {
            tools.register(crate::tools::BrowserTool::new(
                cfg.tools.browser.allowed_domains.clone(),
                Duration::from_secs(cfg.tools.browser.acquire_wait_secs),
            ));
        }
    }

    tools
}

/// 系统提示 + 文本工具调用格式（供不支持原生工具调用的后端）
pub fn build_full_system_prompt(base: &str, tools: &ToolRegistry) -> String {
    if tools.is_empty() {
        return base.to_string();
    }
    format!(
        "{}\n\n## Available tools\n```json\n{}\n```\n\n## Tool call JSON Schema (only if native tool calling is unavailable, output valid JSON matching this)\n```json\n{}\n```",
        base,
        tools.to_schema_json(),
        tool_call_schema_json()
    )
}

/// 运行时构建器
pub struct RuntimeBuilder {
    config: AppConfig,
    client: Option<Arc<dyn LlmClient>>,
    pool: Option<Arc<ResourcePool>>,
    registry: Option<ToolRegistry>,
    system_prompt: Option<String>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            client: None,
            pool: None,
            registry: None,
            system_prompt: None,
        }
    }

    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_pool(mut self, pool: Arc<ResourcePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 覆盖系统提示（不再追加工具说明）
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn build(self) -> AgentRuntime {
        let cfg = self.config;
        let client = self.client.unwrap_or_else(|| create_llm_from_config(&cfg));
        let pool = self.pool.unwrap_or_else(|| Arc::new(build_pool(&cfg)));
        let registry = Arc::new(self.registry.unwrap_or_else(|| build_tool_registry(&cfg)));
        let system_prompt = self
            .system_prompt
            .unwrap_or_else(|| build_full_system_prompt(&load_system_prompt(&cfg), &registry));

        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&pool),
            Arc::clone(&client),
            Arc::clone(&registry),
            Duration::from_secs(cfg.scheduler.check_timeout_secs.max(1)),
        ));
        let gateway = ModelGateway::new(
            client,
            cfg.llm.retry.policy(),
            Duration::from_secs(cfg.llm.request_timeout_secs.max(1)),
        );
        let executor = ToolExecutor::new(
            registry,
            Arc::clone(&pool),
            Duration::from_secs(cfg.tools.tool_timeout_secs.max(1)),
        );
        let settings = OrchestratorSettings {
            max_iterations: cfg.orchestrator.max_iterations,
            turn_timeout: Duration::from_secs(cfg.orchestrator.turn_timeout_secs),
            parallel_actions: cfg.orchestrator.parallel_actions,
            max_history_messages: cfg.orchestrator.max_history_messages,
            max_conversations: cfg.orchestrator.max_conversations.max(1),
            conversation_idle: Duration::from_secs(cfg.orchestrator.conversation_idle_secs),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            gateway,
            executor,
            Arc::clone(&monitor),
            system_prompt,
            settings,
        ));

        AgentRuntime {
            orchestrator,
            pool,
            monitor,
            scheduler: Arc::new(TaskScheduler::new()),
            config: cfg,
        }
    }
}

/// 构建完成的运行时组件
pub struct AgentRuntime {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: Arc<ResourcePool>,
    pub monitor: Arc<HealthMonitor>,
    pub scheduler: Arc<TaskScheduler>,
    config: AppConfig,
}

impl AgentRuntime {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 启动后台任务：两波健康检查、失败引擎重启、空闲对话清理，以及可选的延迟预热
    pub fn start_background(&self) {
        if self.config.scheduler.enabled {
            let (cheap, expensive) = self.config.scheduler.policies();
            self.monitor.start(&self.scheduler, cheap, expensive);
        }
        let initial = Duration::from_secs(self.config.scheduler.initial_delay_secs);
        if self.config.pool.reload_failed_period_secs > 0 {
            let pool = Arc::clone(&self.pool);
            let period = Duration::from_secs(self.config.pool.reload_failed_period_secs);
            self.scheduler.spawn_periodic(
                "pool.reload_failed",
                SchedulePolicy::new(initial, period),
                move || {
                    let pool = Arc::clone(&pool);
                    async move {
                        let reloaded = pool.reload_failed().await;
                        if !reloaded.is_empty() {
                            tracing::info!(kinds = ?reloaded, "failed engines reloaded");
                        }
                    }
                },
            );
        }
        if self.config.orchestrator.conversation_idle_secs > 0 {
            let orchestrator = Arc::clone(&self.orchestrator);
            // 空闲期限的十分之一，至少一分钟
            let period = Duration::from_secs((self.config.orchestrator.conversation_idle_secs / 10).max(60));
            self.scheduler.spawn_periodic(
                "conversations.evict_idle",
                SchedulePolicy::new(period, period),
                move || {
                    let orchestrator = Arc::clone(&orchestrator);
                    async move {
                        orchestrator.evict_idle_conversations();
                    }
                },
            );
        }
        if self.config.pool.warm_up {
            let pool = Arc::clone(&self.pool);
            let delay = Duration::from_secs(self.config.pool.warm_up_delay_secs);
            self.scheduler.spawn_once("pool.warm_up", delay, async move {
                for kind in pool.kinds() {
                    match pool.warm_up(kind).await {
                        Ok(()) => tracing::info!(kind = %kind, "engine warmed up"),
                        Err(e) => tracing::warn!(kind = %kind, error = %e, "engine warm-up failed"),
                    }
                }
            });
        }
    }

    /// 关闭协调器：先停后台调度，再排空资源池
    pub fn shutdown_coordinator(&self, manager: Arc<ShutdownManager>) -> ShutdownCoordinator {
        let drain = Duration::from_secs(self.config.pool.drain_timeout_secs);
        ShutdownCoordinator::new(manager)
            .with_stage_timeout(drain + Duration::from_secs(5))
            .stage(StopScheduler::new(Arc::clone(&self.scheduler), Duration::from_secs(2)))
            .stage(DrainPool::new(Arc::clone(&self.pool), drain))
    }

    /// 直接关闭（不经过信号）
    pub async fn shutdown(&self) {
        self.scheduler.stop(Duration::from_secs(2)).await;
        self.pool
            .shutdown(Duration::from_secs(self.config.pool.drain_timeout_secs))
            .await;
    }

    pub fn has_resource(&self, kind: ResourceKind) -> bool {
        self.pool.kinds().contains(&kind)
    }
}
