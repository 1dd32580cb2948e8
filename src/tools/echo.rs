//! Echo 工具（测试用，不依赖资源）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{parse_args, schema_of, Tool, ToolContext, ToolFault};

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的文本
    #[serde(default)]
    text: Option<String>,
}

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EchoArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext<'_>) -> Result<String, ToolFault> {
        let args: EchoArgs = parse_args(args)?;
        Ok(args.text.unwrap_or_else(|| "(empty)".to_string()))
    }
}
