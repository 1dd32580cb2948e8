//! 单轮对话的过程事件：有序、带类型，可由任意传输层（NDJSON、SSE、终端）渲染

use serde::Serialize;
use serde_json::Value;

use crate::core::ErrorKind;

/// 过程事件（序列化为带 type 字段的 JSON）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    TurnStarted {
        conversation_id: String,
    },
    /// 进入第几轮 Deciding（从 1 开始）
    StepUpdate {
        step: usize,
        max_steps: usize,
    },
    ActionRequested {
        call_id: String,
        tool: String,
        args: Value,
    },
    /// 工具结果（预览，避免过长）
    ActionCompleted {
        call_id: String,
        tool: String,
        ok: bool,
        preview: String,
    },
    /// 最终回复的一小段
    AnswerDelta {
        text: String,
    },
    AnswerComplete {
        answer: String,
    },
    /// 本轮以降级方式结束（回答中已包含自然语言说明）
    TurnFailed {
        kind: ErrorKind,
        message: String,
    },
}
