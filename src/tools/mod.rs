//! 工具层：Tool trait、注册表、调用层与具体工具

pub mod echo;
pub mod executor;
pub mod fetch;
pub mod image_ocr;
pub mod registry;
pub mod sandbox_exec;
pub mod schema;

#[cfg(feature = "browser")]
pub mod browser;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use fetch::WebFetchTool;
pub use image_ocr::ImageOcrTool;
pub use registry::{
    parse_args, FaultKind, RegistrationFailure, Tool, ToolContext, ToolDescriptor, ToolFault,
    ToolRegistry,
};
pub use sandbox_exec::SandboxExecTool;
pub use schema::{schema_of, tool_call_schema_json};

#[cfg(feature = "browser")]
pub use browser::BrowserTool;

/// 从 URL 提取域名（小写）；仅接受 http / https
pub(crate) fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?;
    let host = host.split(':').next()?;
    (!host.is_empty()).then(|| host.to_lowercase())
}

/// 按字符截断并追加 ...[truncated]
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect::<String>() + "\n...[truncated]"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://Docs.rs/tokio").as_deref(), Some("docs.rs"));
        assert_eq!(extract_domain("http://a.b:8080?x=1").as_deref(), Some("a.b"));
        assert_eq!(extract_domain("https://user@host.io/p").as_deref(), Some("host.io"));
        assert_eq!(extract_domain("file:///etc/passwd"), None);
        assert_eq!(extract_domain("https://"), None);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("短文本", 10), "短文本");
        assert_eq!(truncate_chars("abcdef", 3), "abc\n...[truncated]");
    }
}
