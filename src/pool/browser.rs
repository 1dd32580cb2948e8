//! Headless Chrome 引擎
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! 一个 Chrome 实例承载所有子会话；每个子会话是独立浏览器上下文中的一个 tab，
//! cookie、存储与缓存互不可见，关闭子会话时整个上下文被销毁。
//! 命令：`{"action": "navigate" | "content" | "click" | "type" | "scroll", ...}`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::protocol::cdp::Target;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;

use super::{Engine, EngineFactory, EngineFault, ResourceKind, SessionId};

pub struct BrowserEngineFactory {
    max_result_chars: usize,
    idle_timeout: Duration,
}

impl BrowserEngineFactory {
    pub fn new(max_result_chars: usize) -> Self {
        Self {
            max_result_chars,
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl EngineFactory for BrowserEngineFactory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Browser
    }

    fn launch(&self) -> Result<Box<dyn Engine>, String> {
        Ok(Box::new(self.start()?))
    }
}

impl BrowserEngineFactory {
    fn start(&self) -> Result<BrowserEngine, String> {
        let options = LaunchOptions::default_builder()
            .headless(true)
            .idle_browser_timeout(self.idle_timeout)
            .build()
            .map_err(|e| format!("invalid launch options: {e}"))?;
        let browser = Browser::new(options).map_err(|e| format!("Chrome launch failed: {e}"))?;
        let version = browser
            .get_version()
            .map_err(|e| format!("Chrome not responding: {e}"))?;
        tracing::info!(product = %version.product, "browser engine started");
        Ok(BrowserEngine {
            browser,
            sessions: HashMap::new(),
            next_session: 1,
            max_result_chars: self.max_result_chars,
        })
    }
}

/// 子会话：隔离上下文及其中唯一的 tab
struct BrowserSession {
    context_id: String,
    tab: Arc<Tab>,
}

struct BrowserEngine {
    browser: Browser,
    sessions: HashMap<SessionId, BrowserSession>,
    next_session: SessionId,
    max_result_chars: usize,
}

fn str_arg<'a>(command: &'a Value, key: &str) -> Result<&'a str, EngineFault> {
    command
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineFault::Failed(format!("missing {key}")))
}

impl BrowserEngine {
    fn page_text(&self, tab: &Tab) -> Result<String, EngineFault> {
        let html = tab
            .get_content()
            .map_err(|e| EngineFault::Failed(format!("read page failed: {e}")))?;
        let text = html2text::from_read(html.as_bytes(), 120).unwrap_or(html);
        let title = tab.get_title().unwrap_or_default();
        let out = format!("# {}\nURL: {}\n\n{}", title, tab.get_url(), text.trim());
        if out.chars().count() > self.max_result_chars {
            Ok(out.chars().take(self.max_result_chars).collect::<String>() + "\n...[truncated]")
        } else {
            Ok(out)
        }
    }

    /// tab 操作失败时区分：浏览器本身无响应则视为损坏
    fn classify(&self, context: &str, err: impl std::fmt::Display) -> EngineFault {
        if self.browser.get_version().is_err() {
            EngineFault::Broken(format!("{context}: browser unresponsive: {err}"))
        } else {
            EngineFault::Failed(format!("{context}: {err}"))
        }
    }
}

impl Engine for BrowserEngine {
    fn open_session(&mut self) -> Result<SessionId, String> {
        let context = self
            .browser
            .new_context()
            .map_err(|e| format!("create browser context failed: {e}"))?;
        let context_id = context.get_id().to_string();
        let tab = context
            .new_tab()
            .map_err(|e| format!("open tab failed: {e}"))?;
        let id = self.next_session;
        self.next_session += 1;
        tracing::debug!(session = id, context_id = %context_id, "browser session opened");
        self.sessions.insert(id, BrowserSession { context_id, tab });
        Ok(id)
    }

    /// 销毁上下文会一并关闭其中的 tab；销毁失败时至少关闭 tab
    fn close_session(&mut self, session: SessionId) {
        let Some(BrowserSession { context_id, tab }) = self.sessions.remove(&session) else {
            return;
        };
        let disposed = tab.call_method(Target::DisposeBrowserContext {
            browser_context_id: context_id.clone(),
        });
        if let Err(e) = disposed {
            tracing::debug!(session, context_id = %context_id, error = %e, "context dispose failed");
            if let Err(e) = tab.close(false) {
                tracing::debug!(session, error = %e, "tab close failed");
            }
        }
    }

    fn execute(&mut self, session: SessionId, command: &Value) -> Result<String, EngineFault> {
        let tab = self
            .sessions
            .get(&session)
            .map(|s| Arc::clone(&s.tab))
            .ok_or_else(|| EngineFault::Broken(format!("unknown browser session {session}")))?;
        let action = str_arg(command, "action")?;
        match action {
            "navigate" => {
                let url = str_arg(command, "url")?;
                tracing::info!(session, url = %url, "browser navigate");
                tab.navigate_to(url)
                    .map_err(|e| self.classify("navigate", e))?;
                tab.wait_until_navigated()
                    .map_err(|e| self.classify("page load", e))?;
                self.page_text(&tab)
            }
            "content" => self.page_text(&tab),
            "click" => {
                let selector = str_arg(command, "selector")?;
                let element = tab
                    .wait_for_element(selector)
                    .map_err(|e| EngineFault::Failed(format!("element '{selector}' not found: {e}")))?;
                element
                    .click()
                    .map_err(|e| self.classify("click", e))?;
                Ok(format!("clicked {selector}"))
            }
            "type" => {
                let selector = str_arg(command, "selector")?;
                let text = command.get("text").and_then(|v| v.as_str()).unwrap_or_default();
                let element = tab
                    .wait_for_element(selector)
                    .map_err(|e| EngineFault::Failed(format!("element '{selector}' not found: {e}")))?;
                element
                    .click()
                    .map_err(|e| self.classify("focus", e))?;
                tab.type_str(text)
                    .map_err(|e| self.classify("type", e))?;
                Ok(format!("typed {} chars into {selector}", text.chars().count()))
            }
            "scroll" => {
                let pixels = command.get("pixels").and_then(|v| v.as_i64()).unwrap_or(800);
                tab.evaluate(&format!("window.scrollBy(0, {pixels})"), false)
                    .map_err(|e| self.classify("scroll", e))?;
                Ok(format!("scrolled {pixels}px"))
            }
            other => Err(EngineFault::Failed(format!("unknown browser action: {other}"))),
        }
    }

    fn ping(&mut self) -> bool {
        self.browser.get_version().is_ok()
    }

    fn shutdown(&mut self) {
        let sessions: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session in sessions {
            self.close_session(session);
        }
        tracing::info!("browser engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    #[ignore = "needs a local Chrome / Chromium"]
    fn test_each_session_gets_its_own_context() {
        let mut engine = BrowserEngineFactory::new(2000).start().unwrap();
        let a = engine.open_session().unwrap();
        let b = engine.open_session().unwrap();
        assert_ne!(engine.sessions[&a].context_id, engine.sessions[&b].context_id);

        let page = "data:text/html,<title>t</title><p>hello</p>";
        let out = engine.execute(b, &json!({"action": "navigate", "url": page})).unwrap();
        assert!(out.contains("hello"));

        engine.close_session(a);
        assert!(matches!(
            engine.execute(a, &json!({"action": "content"})),
            Err(EngineFault::Broken(_))
        ));
        assert!(engine.execute(b, &json!({"action": "content"})).is_ok());
        engine.shutdown();
    }
}
