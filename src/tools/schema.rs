//! 工具参数 JSON Schema 生成（schemars）
//!
//! 工具的参数结构派生 JsonSchema，由 schema_of 转成提供给模型的 parameters；
//! tool_call_schema_json 给出文本工具调用格式，拼入 system prompt 供不支持原生调用的后端使用。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 文本工具调用格式：`{"tool": "...", "args": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，如 echo、web_fetch、sandbox_exec、browser
    pub tool: String,
    /// 工具参数，依工具不同而不同
    pub args: HashMap<String, Value>,
}

/// 参数结构的 JSON Schema（去掉 $schema / title 等与模型无关的字段）
pub fn schema_of<T: JsonSchema>() -> Value {
    let mut value = serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object", "properties": {} })
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 返回文本工具调用格式的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Args {
        /// 要回显的文本
        text: String,
        count: Option<u32>,
    }

    #[test]
    fn test_schema_of_lists_required_fields() {
        let schema = schema_of::<Args>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"]["text"].is_object());
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "text"));
        assert!(!required.iter().any(|v| v == "count"));
        assert!(schema.get("$schema").is_none());
    }

    #[test]
    fn test_tool_call_schema_mentions_fields() {
        let schema = tool_call_schema_json();
        assert!(schema.contains("\"tool\""));
        assert!(schema.contains("\"args\""));
    }
}
