//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TOOLHIVE__*` 覆盖（双下划线表示嵌套，如 `TOOLHIVE__LLM__PROVIDER=mock`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{RetryPolicy, SchedulePolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub pool: PoolSection,
    pub scheduler: SchedulerSection,
    pub tools: ToolsSection,
    pub web: WebSection,
}

/// [app] 段
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 系统提示文件；未设置时依次查找 config/prompts/system.md
    pub system_prompt_file: Option<PathBuf>,
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock；openai 缺少 API Key 时退回 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    pub retry: RetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 60,
            retry: RetrySection::default(),
        }
    }
}

/// [llm.retry] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            multiplier: 2.0,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms)),
            multiplier: if self.multiplier.is_finite() && self.multiplier >= 1.0 {
                self.multiplier
            } else {
                1.0
            },
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 每轮最多 Acting 次数
    pub max_iterations: usize,
    /// 整轮期限（秒）
    pub turn_timeout_secs: u64,
    /// 无资源冲突时同批动作并发执行
    pub parallel_actions: bool,
    /// 对话保留的最多消息条数，0 表示不裁剪
    pub max_history_messages: usize,
    /// 同时保留的对话数上限，超出时淘汰最久未用的空闲对话
    pub max_conversations: usize,
    /// 空闲多久（秒）的对话被定期清理，0 表示不清理
    pub conversation_idle_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            turn_timeout_secs: 300,
            parallel_actions: false,
            max_history_messages: 200,
            max_conversations: 1000,
            conversation_idle_secs: 3600,
        }
    }
}

/// [pool] 段：各类资源的并发子会话上限与生命周期超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub browser_max_sessions: usize,
    pub sandbox_max_sessions: usize,
    pub model_max_sessions: usize,
    /// Wait 模式下等待空闲容量的上限（秒）
    pub acquire_timeout_secs: u64,
    pub drain_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    /// 等待引擎启动完成的上限（秒）
    pub startup_timeout_secs: u64,
    /// 单条命令执行超过该时长（秒）后不再视为忙碌中的存活引擎
    pub busy_limit_secs: u64,
    /// 定期重启启动失败的引擎（秒），0 表示不重试
    pub reload_failed_period_secs: u64,
    /// 启动后延迟预热引擎
    pub warm_up: bool,
    pub warm_up_delay_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            browser_max_sessions: 4,
            sandbox_max_sessions: 4,
            model_max_sessions: 2,
            acquire_timeout_secs: 10,
            drain_timeout_secs: 10,
            ping_timeout_secs: 5,
            startup_timeout_secs: 60,
            busy_limit_secs: 300,
            reload_failed_period_secs: 300,
            warm_up: false,
            warm_up_delay_secs: 5,
        }
    }
}

/// [scheduler] 段：健康检查两波的节奏
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub enabled: bool,
    pub initial_delay_secs: u64,
    pub cheap_period_secs: u64,
    pub expensive_period_secs: u64,
    /// 重量波相对轻量波错开的周期比例
    pub stagger_fraction: f64,
    pub check_timeout_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_secs: 10,
            cheap_period_secs: 60,
            expensive_period_secs: 300,
            stagger_fraction: 0.5,
            check_timeout_secs: 10,
        }
    }
}

impl SchedulerSection {
    /// (轻量波, 重量波)
    pub fn policies(&self) -> (SchedulePolicy, SchedulePolicy) {
        let cheap = SchedulePolicy::new(
            Duration::from_secs(self.initial_delay_secs),
            Duration::from_secs(self.cheap_period_secs.max(1)),
        );
        let expensive = SchedulePolicy::staggered(
            &cheap,
            Duration::from_secs(self.expensive_period_secs.max(1)),
            self.stagger_fraction,
        );
        (cheap, expensive)
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub fetch: FetchSection,
    pub sandbox: SandboxSection,
    pub browser: BrowserSection,
    pub ocr: OcrSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            fetch: FetchSection::default(),
            sandbox: SandboxSection::default(),
            browser: BrowserSection::default(),
            ocr: OcrSection::default(),
        }
    }
}

/// [tools.fetch] 段：抓取 URL 的超时、最大字符数、域名白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 15,
            max_result_chars: 8000,
            allowed_domains: default_allowed_domains(),
        }
    }
}

fn default_allowed_domains() -> Vec<String> {
    [
        "en.wikipedia.org",
        "github.com",
        "raw.githubusercontent.com",
        "stackoverflow.com",
        "docs.rs",
        "crates.io",
        "doc.rust-lang.org",
        "developer.mozilla.org",
        "arxiv.org",
        "news.ycombinator.com",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// [tools.sandbox] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub enabled: bool,
    /// 沙箱根目录，未设置时在系统临时目录下创建
    pub root: Option<PathBuf>,
    /// 允许执行的命令名（仅首词）
    pub allowed_commands: Vec<String>,
    pub max_output_chars: usize,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            enabled: true,
            root: None,
            allowed_commands: ["ls", "cat", "echo", "head", "tail", "wc", "grep", "sort", "uniq", "python3"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_output_chars: 8000,
        }
    }
}

/// [tools.browser] 段（需启用 browser feature）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub enabled: bool,
    pub allowed_domains: Vec<String>,
    pub max_result_chars: usize,
    /// 容量耗尽时等待的秒数，0 表示快速失败
    pub acquire_wait_secs: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_domains: default_allowed_domains(),
            max_result_chars: 8000,
            acquire_wait_secs: 0,
        }
    }
}

/// [tools.ocr] 段：图片文字识别，模型引擎常驻
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrSection {
    pub enabled: bool,
    /// OCR 命令（tesseract 兼容的命令行）
    pub command: String,
    /// 启动时必须已安装的语言模型
    pub languages: Vec<String>,
    pub inference_timeout_secs: u64,
    pub max_output_chars: usize,
    /// 容量耗尽时等待的秒数，0 表示快速失败
    pub acquire_wait_secs: u64,
}

impl Default for OcrSection {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "tesseract".to_string(),
            languages: vec!["eng".to_string(), "chi_sim".to_string()],
            inference_timeout_secs: 60,
            max_output_chars: 8000,
            acquire_wait_secs: 5,
        }
    }
}

/// [web] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub bind: String,
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// 从 config 目录加载配置，环境变量 TOOLHIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TOOLHIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TOOLHIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 系统提示：配置文件 > config/prompts/system.md > 内置默认
pub fn load_system_prompt(cfg: &AppConfig) -> String {
    let configured = cfg.app.system_prompt_file.iter().cloned();
    let defaults = ["config/prompts/system.md", "../config/prompts/system.md"]
        .into_iter()
        .map(PathBuf::from);
    configured
        .chain(defaults)
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            "You are a helpful assistant. Use the available tools when they help; \
             when a tool fails, read the error and either retry differently or explain the limitation."
                .to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.max_iterations, 25);
        assert_eq!(cfg.orchestrator.turn_timeout_secs, 300);
        assert_eq!(cfg.llm.retry.max_attempts, 3);
        assert!(cfg.tools.fetch.allowed_domains.contains(&"docs.rs".to_string()));
        assert_eq!(cfg.orchestrator.max_conversations, 1000);
        assert_eq!(cfg.pool.startup_timeout_secs, 60);
        assert!(!cfg.tools.ocr.enabled);
        assert_eq!(cfg.tools.ocr.languages, vec!["eng", "chi_sim"]);
    }

    #[test]
    fn test_load_partial_file_keeps_field_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[orchestrator]\nmax_iterations = 4\n\n[pool]\nsandbox_max_sessions = 2\n\n[llm.retry]\nmax_attempts = 5"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.orchestrator.max_iterations, 4);
        assert_eq!(cfg.orchestrator.turn_timeout_secs, 300);
        assert_eq!(cfg.pool.sandbox_max_sessions, 2);
        assert_eq!(cfg.pool.browser_max_sessions, 4);
        assert_eq!(cfg.llm.retry.max_attempts, 5);
        assert_eq!(cfg.llm.retry.initial_backoff_ms, 500);
    }

    #[test]
    fn test_scheduler_policies_are_staggered() {
        let section = SchedulerSection::default();
        let (cheap, expensive) = section.policies();
        assert_eq!(cheap.initial_delay, Duration::from_secs(10));
        assert_eq!(expensive.initial_delay, Duration::from_secs(40));
        assert_eq!(expensive.period, Duration::from_secs(300));
    }

    #[test]
    fn test_retry_policy_sanitised() {
        let section = RetrySection {
            max_attempts: 0,
            initial_backoff_ms: 100,
            max_backoff_ms: 10,
            multiplier: f64::NAN,
        };
        let policy = section.policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_backoff, Duration::from_millis(100));
        assert_eq!(policy.multiplier, 1.0);
    }
}
