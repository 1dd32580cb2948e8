//! 对话层：单轮状态机（Deciding ↔ Acting）与过程事件

pub mod events;
pub mod loop_;

pub use events::TurnEvent;
pub use loop_::{run_turn, TurnOutcome, TurnSession};
