//! 记忆层：消息、对话与按 id 存放的对话表

pub mod conversation;

pub use conversation::{
    ActionOutcome, ActionRequest, ActionResult, Conversation, ConversationStore, Message,
};
