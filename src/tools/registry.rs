//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），
//! 可声明依赖的池化资源；由 ToolRegistry 按名注册与查找。
//! 工具自身初始化失败只记录在 failures 中，不影响进程，也不出现在提供给模型的描述里。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::pool::{AcquireMode, EngineFault, PooledHandle, ResourceKind};

/// 提供给模型的工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// 参数不合法（模型可修正后重试）
    InvalidArgs,
    /// 执行失败，资源仍可复用
    Execution,
    /// 借用的资源已损坏，需回收
    ResourceBroken,
}

/// 工具执行失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ToolFault {
    pub kind: FaultKind,
    pub message: String,
}

impl ToolFault {
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::InvalidArgs,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Execution,
            message: message.into(),
        }
    }

    pub fn broken(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::ResourceBroken,
            message: message.into(),
        }
    }
}

impl From<EngineFault> for ToolFault {
    fn from(fault: EngineFault) -> Self {
        match fault {
            EngineFault::Broken(msg) => ToolFault::broken(msg),
            EngineFault::Failed(msg) => ToolFault::execution(msg),
        }
    }
}

/// 单次调用的上下文：所属对话与（若声明了资源）借到的子会话
pub struct ToolContext<'a> {
    pub conversation_id: &'a str,
    pub resource: Option<&'a PooledHandle>,
}

impl<'a> ToolContext<'a> {
    pub fn resource(&self) -> Result<&'a PooledHandle, ToolFault> {
        self.resource
            .ok_or_else(|| ToolFault::execution("tool requires a pooled resource but none was provided"))
    }
}

/// 把 JSON 参数解析为工具自己的参数结构
pub fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolFault> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| ToolFault::invalid_args(format!("invalid arguments: {e}")))
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、依赖资源、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（动作请求中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
        })
    }

    /// 依赖的池化资源；None 表示无需资源
    fn resource(&self) -> Option<ResourceKind> {
        None
    }

    /// 资源耗尽时的行为；工具默认快速失败
    fn acquire_mode(&self) -> AcquireMode {
        AcquireMode::FailFast
    }

    async fn execute(&self, args: Value, ctx: &ToolContext<'_>) -> Result<String, ToolFault>;
}

/// 注册失败记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationFailure {
    pub name: String,
    pub reason: String,
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    failed: Vec<RegistrationFailure>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, keeping the latest");
        }
        self.failed.retain(|f| f.name != name);
    }

    /// 通过初始化函数注册；初始化返回错误或 panic 时记为失败，工具不可用
    pub fn register_with<T, F>(&mut self, name: &str, init: F) -> bool
    where
        T: Tool + 'static,
        F: FnOnce() -> Result<T, String>,
    {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(init));
        let reason = match outcome {
            Ok(Ok(tool)) => {
                self.register(tool);
                return true;
            }
            Ok(Err(reason)) => reason,
            Err(panic) => format!("initialization panicked: {}", panic_message(panic.as_ref())),
        };
        tracing::warn!(tool = %name, reason = %reason, "tool registration failed");
        self.tools.remove(name);
        self.failed.push(RegistrationFailure {
            name: name.to_string(),
            reason,
        });
        false
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 已注册工具名（排序）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 可用工具的描述（按名称排序，不含注册失败的工具）
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn failures(&self) -> &[RegistrationFailure] {
        &self.failed
    }

    /// 生成拼入 system prompt 的 Available tools 段落
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.descriptors()).unwrap_or_else(|_| "[]".to_string())
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_register_and_describe() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert_eq!(registry.tool_names(), vec!["echo".to_string()]);
        let descriptors = registry.descriptors();
        assert_eq!(descriptors[0].name, "echo");
        assert_eq!(descriptors[0].parameters["type"], "object");
    }

    #[test]
    fn test_failed_registration_is_captured() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert!(!registry.register_with::<EchoTool, _>("broken", || Err("missing binary".into())));
        assert!(!registry.register_with::<EchoTool, _>("panicky", || panic!("init exploded")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.failures().len(), 2);
        assert!(registry.failures()[1].reason.contains("init exploded"));
        assert!(registry.descriptors().iter().all(|d| d.name == "echo"));
    }

    #[test]
    fn test_parse_args_reports_invalid_args() {
        #[derive(serde::Deserialize)]
        struct Args {
            #[allow(dead_code)]
            text: String,
        }
        let err = parse_args::<Args>(serde_json::json!({"text": 3})).err().unwrap();
        assert_eq!(err.kind, FaultKind::InvalidArgs);
    }
}
