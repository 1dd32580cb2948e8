//! toolhive - 工具调用对话循环与池化资源运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、重试、任务调度、健康监控、关闭、编排
//! - **llm**: 模型后端抽象（OpenAI 兼容 / Mock）与模型网关
//! - **memory**: 消息与对话存储
//! - **observability**: 日志初始化
//! - **pool**: 资源池（引擎工作线程、逻辑子会话、懒启动）
//! - **react**: 单轮状态机与过程事件
//! - **tools**: 工具注册表、执行器与具体工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod pool;
pub mod react;
pub mod tools;

pub use crate::core::{AgentRuntime, Orchestrator, RuntimeBuilder, TurnRequest, TurnResponse};
