//! LLM 层：后端抽象、OpenAI 兼容实现、Mock 与模型网关

pub mod gateway;
pub mod mock;
pub mod openai;
pub mod traits;

pub use gateway::{parse_reply, ModelDecision, ModelGateway};
pub use mock::{MockLlmClient, ScriptStep, ScriptedLlmClient};
pub use openai::OpenAiClient;
pub use traits::{BackendError, BackendReply, ChatRequest, LlmClient, RawToolCall};
