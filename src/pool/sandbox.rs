//! 进程沙箱引擎
//!
//! 每个子会话在沙箱根目录下拥有独立工作目录；命令通过 `sh -c` 执行，
//! 超过期限即 kill，stdout / stderr 经文件捕获。

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{Engine, EngineFactory, EngineFault, ResourceKind, SessionId};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct SandboxEngineFactory {
    root: Option<PathBuf>,
    command_timeout: Duration,
    max_output_chars: usize,
}

impl SandboxEngineFactory {
    /// root 为空时在系统临时目录下创建，关闭时删除
    pub fn new(root: Option<PathBuf>, command_timeout: Duration, max_output_chars: usize) -> Self {
        Self {
            root,
            command_timeout,
            max_output_chars,
        }
    }
}

impl EngineFactory for SandboxEngineFactory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Sandbox
    }

    fn launch(&self) -> Result<Box<dyn Engine>, String> {
        let (root, owns_root) = match &self.root {
            Some(root) => (root.clone(), false),
            None => (
                std::env::temp_dir().join(format!("toolhive-sandbox-{}", uuid::Uuid::new_v4())),
                true,
            ),
        };
        fs::create_dir_all(&root)
            .map_err(|e| format!("cannot create sandbox root {}: {e}", root.display()))?;

        let shell_check = Command::new("sh")
            .args(["-c", "true"])
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| format!("sandbox shell unavailable: {e}"))?;
        if !shell_check.success() {
            return Err(format!("sandbox shell check exited with {shell_check}"));
        }

        tracing::info!(root = %root.display(), "sandbox engine started");
        Ok(Box::new(SandboxEngine {
            root,
            owns_root,
            sessions: HashMap::new(),
            next_session: 1,
            command_timeout: self.command_timeout,
            max_output_chars: self.max_output_chars,
        }))
    }
}

struct SandboxEngine {
    root: PathBuf,
    owns_root: bool,
    sessions: HashMap<SessionId, PathBuf>,
    next_session: SessionId,
    command_timeout: Duration,
    max_output_chars: usize,
}

impl SandboxEngine {
    fn run_command(&self, dir: &Path, command: &str, limit: Duration) -> Result<String, EngineFault> {
        let stdout_path = dir.join(".stdout");
        let stderr_path = dir.join(".stderr");
        let stdout = File::create(&stdout_path)
            .map_err(|e| EngineFault::Broken(format!("cannot capture stdout: {e}")))?;
        let stderr = File::create(&stderr_path)
            .map_err(|e| EngineFault::Broken(format!("cannot capture stderr: {e}")))?;

        let mut child = Command::new("sh")
            .args(["-c", command])
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| EngineFault::Failed(format!("spawn failed: {e}")))?;

        let deadline = Instant::now() + limit;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineFault::Failed(format!(
                        "command timed out after {}s",
                        limit.as_secs_f32()
                    )));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(EngineFault::Failed(format!("wait failed: {e}"))),
            }
        };

        let out = super::read_captured(&stdout_path);
        let err = super::read_captured(&stderr_path);
        let _ = fs::remove_file(&stdout_path);
        let _ = fs::remove_file(&stderr_path);

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(EngineFault::Failed(format!(
                "exit {code}\nstderr: {}",
                super::truncate_output(err.trim(), self.max_output_chars)
            )));
        }
        let combined = if err.trim().is_empty() {
            out
        } else {
            format!("{}\nstderr: {}", out.trim_end(), err.trim())
        };
        Ok(super::truncate_output(&combined, self.max_output_chars))
    }
}

impl Engine for SandboxEngine {
    fn open_session(&mut self) -> Result<SessionId, String> {
        let id = self.next_session;
        self.next_session += 1;
        let dir = self.root.join(format!("session-{id}"));
        fs::create_dir_all(&dir).map_err(|e| format!("cannot create session dir: {e}"))?;
        self.sessions.insert(id, dir);
        Ok(id)
    }

    fn close_session(&mut self, session: SessionId) {
        if let Some(dir) = self.sessions.remove(&session) {
            if let Err(e) = fs::remove_dir_all(&dir) {
                tracing::debug!(dir = %dir.display(), error = %e, "session dir cleanup failed");
            }
        }
    }

    fn execute(&mut self, session: SessionId, command: &Value) -> Result<String, EngineFault> {
        let dir = self
            .sessions
            .get(&session)
            .cloned()
            .ok_or_else(|| EngineFault::Broken(format!("unknown sandbox session {session}")))?;
        if !dir.is_dir() {
            return Err(EngineFault::Broken(format!(
                "sandbox session dir vanished: {}",
                dir.display()
            )));
        }
        let line = command
            .get("command")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineFault::Failed("missing command".to_string()))?;
        let limit = command
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .map(|d| d.min(self.command_timeout))
            .unwrap_or(self.command_timeout);

        tracing::debug!(session, command = %line, "sandbox execute");
        self.run_command(&dir, line, limit)
    }

    fn ping(&mut self) -> bool {
        self.root.is_dir()
    }

    fn shutdown(&mut self) {
        let sessions: Vec<SessionId> = self.sessions.keys().copied().collect();
        for session in sessions {
            self.close_session(session);
        }
        if self.owns_root {
            let _ = fs::remove_dir_all(&self.root);
        }
    }
}
