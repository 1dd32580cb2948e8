//! Web 抓取工具：域名白名单、超时、结果大小限制
//!
//! 仅允许配置中的域名；GET 请求带超时与 User-Agent；
//! HTML 响应经 html2text 提取可读文本，超过 max_result_chars 截断。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Client;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{extract_domain, parse_args, schema_of, truncate_chars, Tool, ToolContext, ToolFault};

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

#[derive(Debug, Deserialize, JsonSchema)]
struct FetchArgs {
    /// 完整 URL（http/https），域名须在白名单内
    url: String,
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 判断内容是否像 HTML
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    let head: String = s.chars().take(512).collect::<String>().to_lowercase();
    head.starts_with("<!") || head.starts_with("<html") || head.contains("<head") || head.contains("<body")
}

fn html_to_text(html: &str) -> String {
    match from_read(html.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => strip_html_tags(html),
    }
}

pub struct WebFetchTool {
    client: Client,
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
}

impl WebFetchTool {
    pub fn new(
        allowed_domains: Vec<String>,
        timeout: Duration,
        max_result_chars: usize,
    ) -> Result<Self, String> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9,zh-CN;q=0.8"));
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .map_err(|e| format!("http client: {e}"))?;
        Ok(Self {
            client,
            allowed_domains: allowed_domains.into_iter().map(|s| s.to_lowercase()).collect(),
            max_result_chars,
        })
    }

    fn is_allowed(&self, url: &str) -> Result<(), ToolFault> {
        let domain = extract_domain(url)
            .ok_or_else(|| ToolFault::invalid_args("Invalid or missing URL (expected http:// or https://)"))?;
        let allowed = self
            .allowed_domains
            .iter()
            .any(|d| domain == *d || domain.ends_with(&format!(".{d}")));
        if allowed {
            Ok(())
        } else {
            Err(ToolFault::invalid_args(format!("Domain not in allowlist: {domain}")))
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a web page or JSON document from an allowlisted domain and return its readable text. Args: {\"url\": \"https://...\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<FetchArgs>()
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext<'_>) -> Result<String, ToolFault> {
        let args: FetchArgs = parse_args(args)?;
        let url = args.url.trim();
        self.is_allowed(url)?;
        tracing::info!(url = %url, "web_fetch");

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolFault::execution(format!("Request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(ToolFault::execution(format!("HTTP {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ToolFault::execution(format!("Read body: {e}")))?;
        let body = body.trim_start_matches('\u{FEFF}');
        let text = if looks_like_html(body) {
            html_to_text(body)
        } else {
            body.to_string()
        };
        Ok(truncate_chars(&text, self.max_result_chars))
    }
}
