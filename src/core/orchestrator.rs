//! 对话编排器
//!
//! 每个入站请求是一轮：按 id 取得（或创建）对话并持有其锁，裁剪历史、追加 user 消息，
//! 再交给单轮状态机。同一对话的轮次串行，不同对话完全并行；编排器本身不持有全局锁。
//! 只有关闭中与请求本身无效会作为错误返回，其余失败都体现在降级回答与 failure 元数据里。

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::core::{AgentError, ErrorKind, HealthMonitor, HealthSnapshot, RecoveryEngine};
use crate::llm::ModelGateway;
use crate::memory::{ConversationStore, Message};
use crate::react::{run_turn, TurnEvent, TurnOutcome, TurnSession};
use crate::tools::ToolExecutor;

/// 入站请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    /// 缺省时生成新的对话 id
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
    /// 来源标记（cli / web / ...）
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl TurnRequest {
    pub fn new(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// 本轮实际调用过的工具
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub tool: String,
    pub input: Value,
}

/// 降级结束时的结构化说明（给运维，不进入回答正文）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResponse {
    pub conversation_id: String,
    pub answer: String,
    pub actions: Vec<ActionSummary>,
    pub iterations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
}

impl TurnResponse {
    fn from_outcome(conversation_id: String, outcome: TurnOutcome) -> Self {
        Self {
            conversation_id,
            answer: outcome.answer,
            actions: outcome
                .actions
                .into_iter()
                .map(|a| ActionSummary {
                    tool: a.name,
                    input: a.arguments,
                })
                .collect(),
            iterations: outcome.iterations,
            failure: outcome
                .failure
                .map(|(kind, detail)| FailureInfo { kind, detail }),
        }
    }
}

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_iterations: usize,
    /// 整轮期限；零表示不设期限
    pub turn_timeout: Duration,
    pub parallel_actions: bool,
    /// 0 表示不裁剪
    pub max_history_messages: usize,
    /// 同时保留的对话数上限；0 表示不限
    pub max_conversations: usize,
    /// 空闲超过该时长的对话由后台任务回收；零表示不回收
    pub conversation_idle: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            turn_timeout: Duration::from_secs(300),
            parallel_actions: false,
            max_history_messages: 200,
            max_conversations: 1000,
            conversation_idle: Duration::from_secs(3600),
        }
    }
}

pub struct Orchestrator {
    gateway: ModelGateway,
    executor: ToolExecutor,
    recovery: RecoveryEngine,
    store: ConversationStore,
    monitor: Arc<HealthMonitor>,
    system_prompt: String,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        gateway: ModelGateway,
        executor: ToolExecutor,
        monitor: Arc<HealthMonitor>,
        system_prompt: impl Into<String>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            gateway,
            executor,
            recovery: RecoveryEngine::new(),
            store: ConversationStore::new().with_max_conversations(settings.max_conversations),
            monitor,
            system_prompt: system_prompt.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// 处理一轮，返回最终回答
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnResponse, AgentError> {
        self.turn(request, None).await
    }

    /// 处理一轮并按顺序推送过程事件；请求被拒绝时也推送一条 TurnFailed
    pub async fn handle_turn_stream(
        &self,
        request: TurnRequest,
        events: UnboundedSender<TurnEvent>,
    ) -> Result<TurnResponse, AgentError> {
        let result = self.turn(request, Some(&events)).await;
        if let Err(err) = &result {
            let _ = events.send(TurnEvent::TurnFailed {
                kind: err.kind(),
                message: self.recovery.user_message(err),
            });
        }
        result
    }

    async fn turn(
        &self,
        request: TurnRequest,
        events: Option<&UnboundedSender<TurnEvent>>,
    ) -> Result<TurnResponse, AgentError> {
        if self.executor.pool().is_closed() {
            return Err(AgentError::ShuttingDown);
        }
        let message = request.message.trim();
        if message.is_empty() {
            return Err(AgentError::InvalidRequest("message is empty".to_string()));
        }
        let conversation_id = request
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let conversation = self.store.get_or_create(&conversation_id);
        let mut conversation = conversation.lock().await;
        // 排队期间可能已开始关闭
        if self.executor.pool().is_closed() {
            return Err(AgentError::ShuttingDown);
        }

        let dropped = conversation.prune_to(self.settings.max_history_messages);
        if dropped > 0 {
            tracing::debug!(conversation_id = %conversation_id, dropped, "pruned conversation history");
        }
        tracing::info!(
            conversation_id = %conversation_id,
            source = request.source.as_deref().unwrap_or("-"),
            has_metadata = request.metadata.is_some(),
            "turn started"
        );
        conversation.push(Message::user_from(message, request.source.clone()));

        let mut session = TurnSession::new(
            &self.gateway,
            &self.executor,
            &self.recovery,
            &self.system_prompt,
        )
        .with_max_iterations(self.settings.max_iterations)
        .with_parallel_actions(self.settings.parallel_actions);
        if !self.settings.turn_timeout.is_zero() {
            session = session.with_deadline(Instant::now() + self.settings.turn_timeout);
        }
        if let Some(tx) = events {
            session = session.with_event_tx(tx);
        }

        let outcome = run_turn(&session, &mut conversation).await;
        drop(conversation);
        self.store.touch(&conversation_id);
        Ok(TurnResponse::from_outcome(conversation_id, outcome))
    }

    /// 对话历史副本；会等待该对话进行中的轮次结束
    pub async fn history(&self, conversation_id: &str) -> Option<Vec<Message>> {
        self.store.snapshot(conversation_id).await
    }

    /// 清空对话；等待该对话进行中的轮次结束
    pub async fn clear(&self, conversation_id: &str) -> bool {
        self.store.clear(conversation_id).await
    }

    /// 回收空闲对话，返回回收数
    pub fn evict_idle_conversations(&self) -> usize {
        if self.settings.conversation_idle.is_zero() {
            return 0;
        }
        let evicted = self.store.evict_idle(self.settings.conversation_idle);
        if evicted > 0 {
            tracing::info!(evicted, remaining = self.store.len(), "evicted idle conversations");
        }
        evicted
    }

    pub fn conversation_count(&self) -> usize {
        self.store.len()
    }

    /// 最近一次健康快照（不等待进行中的检查）
    pub fn health(&self) -> Arc<HealthSnapshot> {
        self.monitor.snapshot()
    }
}
