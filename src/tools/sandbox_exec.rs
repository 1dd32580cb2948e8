//! 沙箱命令工具：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、python3）；禁止 rm -rf、wget、chmod 777 等子串。
//! 命令经 `sh -c` 执行，能串接或替换命令的 shell 元字符一律拒绝。
//! 命令在借到的沙箱子会话（独立工作目录）中执行，超时由沙箱引擎负责 kill。

use std::collections::HashSet;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::pool::ResourceKind;
use crate::tools::{parse_args, schema_of, Tool, ToolContext, ToolFault};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 串接、管道、替换、重定向、换行
const SHELL_METACHARS: &[char] = &[';', '|', '&', '$', '`', '<', '>', '\n', '\r', '(', ')'];

#[derive(Debug, Deserialize, JsonSchema)]
struct SandboxArgs {
    /// 要执行的命令（首词须在白名单内）
    command: String,
    /// 可选超时（秒），不超过配置上限
    #[serde(default)]
    timeout_secs: Option<u64>,
}

pub struct SandboxExecTool {
    allowed_commands: HashSet<String>,
    description: String,
}

impl SandboxExecTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        let allowed_commands: HashSet<String> =
            allowed_commands.into_iter().map(|s| s.to_lowercase()).collect();
        let mut names: Vec<&str> = allowed_commands.iter().map(String::as_str).collect();
        names.sort();
        let description = format!(
            "Run a shell command inside an isolated per-call sandbox directory. Allowed commands: {}. Args: {{\"command\": \"...\"}}",
            names.join(", ")
        );
        Self {
            allowed_commands,
            description,
        }
    }

    fn check(&self, raw: &str) -> Result<(), ToolFault> {
        let lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(*f)) {
            return Err(ToolFault::invalid_args(format!("Forbidden pattern: {forbidden}")));
        }
        if let Some(c) = raw.chars().find(|c| SHELL_METACHARS.contains(c)) {
            return Err(ToolFault::invalid_args(format!(
                "Shell metacharacter {:?} is not allowed",
                c
            )));
        }
        let name = lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err(ToolFault::invalid_args("Empty command"));
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(ToolFault::invalid_args(format!("Command '{name}' not in allowlist")))
        }
    }
}

#[async_trait]
impl Tool for SandboxExecTool {
    fn name(&self) -> &str {
        "sandbox_exec"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SandboxArgs>()
    }

    fn resource(&self) -> Option<ResourceKind> {
        Some(ResourceKind::Sandbox)
    }

    async fn execute(&self, args: Value, ctx: &ToolContext<'_>) -> Result<String, ToolFault> {
        let args: SandboxArgs = parse_args(args)?;
        let command = args.command.trim();
        self.check(command)?;
        tracing::info!(conversation_id = %ctx.conversation_id, command = %command, "sandbox_exec");

        let handle = ctx.resource()?;
        let mut payload = json!({ "command": command });
        if let Some(secs) = args.timeout_secs {
            payload["timeout_secs"] = json!(secs);
        }
        Ok(handle.run(payload).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FaultKind;

    #[test]
    fn test_allowlist_and_forbidden_patterns() {
        let tool = SandboxExecTool::new(vec!["ls".into(), "echo".into(), "rm".into()]);
        assert!(tool.check("ls -la").is_ok());
        assert!(tool.check("ECHO hi").is_ok());
        assert_eq!(tool.check("cat /etc/passwd").unwrap_err().kind, FaultKind::InvalidArgs);
        assert!(tool.check("rm -rf /").unwrap_err().message.contains("Forbidden"));
        assert!(tool.check("   ").is_err());
    }

    #[test]
    fn test_chained_commands_cannot_escape_allowlist() {
        let tool = SandboxExecTool::new(vec!["ls".into(), "echo".into()]);
        for line in [
            "ls; cat /etc/passwd",
            "ls && python3 -c 'import os'",
            "ls || id",
            "ls | sh",
            "echo $(id)",
            "echo `id`",
            "echo hi > /tmp/x",
            "ls < /etc/shadow",
            "ls\ncat /etc/passwd",
            "ls & id",
        ] {
            let fault = tool.check(line).unwrap_err();
            assert_eq!(fault.kind, FaultKind::InvalidArgs, "{line}");
            assert!(fault.message.contains("metacharacter"), "{line}: {}", fault.message);
        }
        assert!(tool.check("echo 'plain words' here").is_ok());
    }

    #[test]
    fn test_declares_sandbox_resource() {
        let tool = SandboxExecTool::new(vec!["ls".into()]);
        assert_eq!(tool.resource(), Some(ResourceKind::Sandbox));
        assert!(tool.description().contains("ls"));
    }
}
