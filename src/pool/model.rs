//! OCR 模型引擎
//!
//! 启动时检查 OCR 命令可用且所需语言模型均已安装，缺任何一个都算启动失败，
//! 由池记录失败次数并在 reload_failed 时重试。模型随引擎常驻，子会话只是编号。
//! 命令：`{"image_path": "..."}`，输出经文件捕获，非 UTF-8 字节按替换字符保留。

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde_json::Value;

use super::{Engine, EngineFactory, EngineFault, ResourceKind, SessionId};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct ModelEngineFactory {
    command: String,
    languages: Vec<String>,
    inference_timeout: Duration,
    max_output_chars: usize,
}

impl ModelEngineFactory {
    pub fn new(
        command: impl Into<String>,
        languages: Vec<String>,
        inference_timeout: Duration,
        max_output_chars: usize,
    ) -> Self {
        Self {
            command: command.into(),
            languages,
            inference_timeout,
            max_output_chars,
        }
    }

    /// `<command> --list-langs` 列出的已安装语言
    fn installed_languages(&self) -> Result<HashSet<String>, String> {
        let output = Command::new(&self.command)
            .arg("--list-langs")
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("OCR command '{}' unavailable: {e}", self.command))?;
        if !output.status.success() {
            return Err(format!(
                "OCR command '{}' exited with {} while listing models",
                self.command, output.status
            ));
        }
        // 部分版本把列表写到 stderr
        let mut listing = String::from_utf8_lossy(&output.stdout).into_owned();
        listing.push('\n');
        listing.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.contains(' '))
            .map(str::to_string)
            .collect())
    }
}

impl EngineFactory for ModelEngineFactory {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Model
    }

    fn launch(&self) -> Result<Box<dyn Engine>, String> {
        if self.languages.is_empty() {
            return Err("no OCR languages configured".to_string());
        }
        let installed = self.installed_languages()?;
        let missing: Vec<&str> = self
            .languages
            .iter()
            .map(String::as_str)
            .filter(|lang| !installed.contains(*lang))
            .collect();
        if !missing.is_empty() {
            return Err(format!("OCR models not installed: {}", missing.join(", ")));
        }

        let scratch = std::env::temp_dir().join(format!("toolhive-ocr-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&scratch)
            .map_err(|e| format!("cannot create OCR scratch dir {}: {e}", scratch.display()))?;

        tracing::info!(
            command = %self.command,
            languages = %self.languages.join("+"),
            "model engine started"
        );
        Ok(Box::new(ModelEngine {
            command: self.command.clone(),
            language_arg: self.languages.join("+"),
            scratch,
            sessions: HashSet::new(),
            next_session: 1,
            inference_timeout: self.inference_timeout,
            max_output_chars: self.max_output_chars,
            healthy: true,
        }))
    }
}

struct ModelEngine {
    command: String,
    language_arg: String,
    scratch: PathBuf,
    sessions: HashSet<SessionId>,
    next_session: SessionId,
    inference_timeout: Duration,
    max_output_chars: usize,
    /// 命令消失后置为 false，ping 据此让池退役引擎
    healthy: bool,
}

impl ModelEngine {
    fn recognize(&mut self, session: SessionId, image: &Path) -> Result<String, EngineFault> {
        let out_path = self.scratch.join(format!("session-{session}.out"));
        let err_path = self.scratch.join(format!("session-{session}.err"));
        let stdout = File::create(&out_path)
            .map_err(|e| EngineFault::Broken(format!("cannot capture OCR output: {e}")))?;
        let stderr = File::create(&err_path)
            .map_err(|e| EngineFault::Broken(format!("cannot capture OCR errors: {e}")))?;

        let spawned = Command::new(&self.command)
            .arg(image)
            .arg("stdout")
            .args(["-l", self.language_arg.as_str()])
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.healthy = false;
                return Err(EngineFault::Broken(format!("OCR command '{}' vanished", self.command)));
            }
            Err(e) => return Err(EngineFault::Failed(format!("OCR spawn failed: {e}"))),
        };

        let deadline = Instant::now() + self.inference_timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EngineFault::Failed(format!(
                        "OCR timed out after {}s",
                        self.inference_timeout.as_secs_f32()
                    )));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(EngineFault::Failed(format!("OCR wait failed: {e}"))),
            }
        };

        let text = super::read_captured(&out_path);
        let errors = super::read_captured(&err_path);
        let _ = fs::remove_file(&out_path);
        let _ = fs::remove_file(&err_path);

        if !status.success() {
            return Err(EngineFault::Failed(format!(
                "OCR failed ({status}): {}",
                super::truncate_output(errors.trim(), self.max_output_chars)
            )));
        }
        Ok(super::truncate_output(text.trim(), self.max_output_chars))
    }
}

impl Engine for ModelEngine {
    fn open_session(&mut self) -> Result<SessionId, String> {
        let id = self.next_session;
        self.next_session += 1;
        self.sessions.insert(id);
        Ok(id)
    }

    fn close_session(&mut self, session: SessionId) {
        self.sessions.remove(&session);
    }

    fn execute(&mut self, session: SessionId, command: &Value) -> Result<String, EngineFault> {
        if !self.sessions.contains(&session) {
            return Err(EngineFault::Broken(format!("unknown model session {session}")));
        }
        let image = command
            .get("image_path")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineFault::Failed("missing image_path".to_string()))?;
        let image = PathBuf::from(image);
        if !image.is_file() {
            return Err(EngineFault::Failed(format!(
                "Image file not found: {}",
                image.display()
            )));
        }
        tracing::debug!(session, image = %image.display(), "model execute");
        self.recognize(session, &image)
    }

    fn ping(&mut self) -> bool {
        self.healthy && self.scratch.is_dir()
    }

    fn shutdown(&mut self) {
        self.sessions.clear();
        if let Err(e) = fs::remove_dir_all(&self.scratch) {
            tracing::debug!(dir = %self.scratch.display(), error = %e, "OCR scratch cleanup failed");
        }
        tracing::info!("model engine stopped");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;

    /// 写一个行为类似 tesseract 的脚本：列出给定语言，识别时回显图片内容
    fn fake_ocr(dir: &Path, langs: &[&str]) -> PathBuf {
        let script = dir.join("fake-ocr");
        let body = format!(
            "#!/bin/sh\nif [ \"$1\" = \"--list-langs\" ]; then\n  echo 'List of available languages (2):'\n{}\n  exit 0\nfi\nif grep -q BROKEN \"$1\"; then echo 'bad image' >&2; exit 1; fi\ncat \"$1\"\n",
            langs
                .iter()
                .map(|l| format!("  echo {l}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        fs::write(&script, body).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn factory(command: &Path, langs: &[&str]) -> ModelEngineFactory {
        ModelEngineFactory::new(
            command.to_string_lossy(),
            langs.iter().map(|l| l.to_string()).collect(),
            Duration::from_secs(5),
            1000,
        )
    }

    #[test]
    fn test_missing_language_model_fails_startup() {
        let tmp = tempfile::tempdir().unwrap();
        let script = fake_ocr(tmp.path(), &["eng"]);
        let err = factory(&script, &["eng", "chi_sim"]).launch().err().unwrap();
        assert_eq!(err, "OCR models not installed: chi_sim");
    }

    #[test]
    fn test_missing_command_fails_startup() {
        let err = factory(Path::new("/nonexistent/ocr-binary"), &["eng"])
            .launch()
            .err()
            .unwrap();
        assert!(err.contains("unavailable"), "{err}");
    }

    #[test]
    fn test_recognizes_text_and_reports_bad_images() {
        let tmp = tempfile::tempdir().unwrap();
        let script = fake_ocr(tmp.path(), &["eng", "chi_sim"]);
        let mut engine = factory(&script, &["eng", "chi_sim"]).launch().unwrap();
        let s = engine.open_session().unwrap();

        let image = tmp.path().join("receipt.png");
        fs::write(&image, "TOTAL 42.00\n").unwrap();
        let out = engine
            .execute(s, &json!({"image_path": image.to_string_lossy()}))
            .unwrap();
        assert_eq!(out, "TOTAL 42.00");

        let missing = engine
            .execute(s, &json!({"image_path": tmp.path().join("nope.png").to_string_lossy()}))
            .unwrap_err();
        assert!(matches!(missing, EngineFault::Failed(ref m) if m.contains("not found")));

        let broken = tmp.path().join("broken.png");
        fs::write(&broken, "BROKEN").unwrap();
        let err = engine
            .execute(s, &json!({"image_path": broken.to_string_lossy()}))
            .unwrap_err();
        assert!(matches!(err, EngineFault::Failed(ref m) if m.contains("bad image")));
        assert!(engine.ping());
        engine.shutdown();
    }

    #[test]
    fn test_vanished_command_marks_engine_broken() {
        let tmp = tempfile::tempdir().unwrap();
        let script = fake_ocr(tmp.path(), &["eng"]);
        let mut engine = factory(&script, &["eng"]).launch().unwrap();
        let s = engine.open_session().unwrap();
        let image = tmp.path().join("a.png");
        fs::write(&image, "x").unwrap();

        fs::remove_file(&script).unwrap();
        let err = engine
            .execute(s, &json!({"image_path": image.to_string_lossy()}))
            .unwrap_err();
        assert!(matches!(err, EngineFault::Broken(_)));
        assert!(!engine.ping());
    }
}
