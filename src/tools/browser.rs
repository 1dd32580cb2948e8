//! Browser 工具：在借到的浏览器子会话（tab）上导航与交互
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! navigate 的 URL 须在域名白名单内；click / type 使用 CSS 选择器。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pool::{AcquireMode, ResourceKind};
use crate::tools::{extract_domain, parse_args, schema_of, Tool, ToolContext, ToolFault};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum BrowserAction {
    Navigate,
    Content,
    Click,
    Type,
    Scroll,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct BrowserArgs {
    /// navigate / content / click / type / scroll
    action: BrowserAction,
    /// navigate 的目标 URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    /// click / type 的 CSS 选择器
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selector: Option<String>,
    /// type 输入的文本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    /// scroll 的像素数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pixels: Option<i64>,
}

pub struct BrowserTool {
    allowed_domains: HashSet<String>,
    acquire_wait: Duration,
}

impl BrowserTool {
    pub fn new(allowed_domains: Vec<String>, acquire_wait: Duration) -> Self {
        Self {
            allowed_domains: allowed_domains.into_iter().map(|s| s.to_lowercase()).collect(),
            acquire_wait,
        }
    }

    fn is_allowed(&self, url: &str) -> Result<(), ToolFault> {
        let domain = extract_domain(url).ok_or_else(|| ToolFault::invalid_args("Invalid or missing URL"))?;
        if self.allowed_domains.contains(&domain) {
            Ok(())
        } else {
            Err(ToolFault::invalid_args(format!("Domain not in allowlist: {domain}")))
        }
    }
}

#[async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> &str {
        "Headless browser for dynamic pages. Each call gets a fresh tab in its own isolated browser context. \
         Actions: navigate {url}, content, click {selector}, type {selector, text}, scroll {pixels}."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<BrowserArgs>()
    }

    fn resource(&self) -> Option<ResourceKind> {
        Some(ResourceKind::Browser)
    }

    fn acquire_mode(&self) -> AcquireMode {
        if self.acquire_wait.is_zero() {
            AcquireMode::FailFast
        } else {
            AcquireMode::Wait(self.acquire_wait)
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext<'_>) -> Result<String, ToolFault> {
        let args: BrowserArgs = parse_args(args)?;
        match args.action {
            BrowserAction::Navigate => {
                let url = args
                    .url
                    .as_deref()
                    .ok_or_else(|| ToolFault::invalid_args("navigate requires url"))?;
                self.is_allowed(url)?;
            }
            BrowserAction::Click | BrowserAction::Type if args.selector.is_none() => {
                return Err(ToolFault::invalid_args("click/type require selector"));
            }
            _ => {}
        }
        let command = serde_json::to_value(&args)
            .map_err(|e| ToolFault::execution(format!("encode command: {e}")))?;
        Ok(ctx.resource()?.run(command).await?)
    }
}
