//! OCR 工具经模型引擎执行：缺语言包时启动失败，装好后由 reload_failed 拉起
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use toolhive::core::ErrorKind;
use toolhive::memory::ActionRequest;
use toolhive::pool::model::ModelEngineFactory;
use toolhive::pool::{ResourceKind, ResourcePool};
use toolhive::tools::{ImageOcrTool, ToolExecutor, ToolRegistry};

/// tesseract 风格的脚本；语言列表从旁边的 langs 文件读取，便于测试中途“安装”
fn install_fake_ocr(dir: &Path, langs: &[&str]) -> PathBuf {
    fs::write(dir.join("langs"), langs.join("\n") + "\n").unwrap();
    let script = dir.join("ocr");
    let body = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--list-langs\" ]; then\n  echo 'List of available languages:'\n  cat '{}'\n  exit 0\nfi\ncat \"$1\"\n",
        dir.join("langs").display()
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn ocr_request(path: &Path) -> ActionRequest {
    ActionRequest {
        id: "call_ocr".to_string(),
        name: "image_ocr".to_string(),
        arguments: json!({ "image_path": path.to_string_lossy() }),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ocr_reloads_after_missing_model_is_installed() {
    let tmp = tempfile::tempdir().unwrap();
    let script = install_fake_ocr(tmp.path(), &["eng"]);
    let factory = ModelEngineFactory::new(
        script.to_string_lossy(),
        vec!["eng".to_string(), "chi_sim".to_string()],
        Duration::from_secs(5),
        1000,
    );
    let pool = Arc::new(ResourcePool::new().with_engine(Arc::new(factory), 1));
    let mut registry = ToolRegistry::new();
    registry.register(ImageOcrTool::new(Duration::from_secs(1)));
    let executor = ToolExecutor::new(Arc::new(registry), Arc::clone(&pool), Duration::from_secs(5));

    let image = tmp.path().join("invoice.png");
    fs::write(&image, "Invoice 2024-001\n").unwrap();

    let first = executor.invoke(&ocr_request(&image), "conv", None).await;
    assert_eq!(first.failure_kind(), Some(ErrorKind::PoolStartupFailed));
    assert!(first.content().contains("model resource could not be started"), "{}", first.content());
    assert_eq!(pool.status()[0].startup_failures, 1);

    // 尚未安装时重试仍失败，且不计入成功列表
    assert!(pool.reload_failed().await.is_empty());

    fs::write(tmp.path().join("langs"), "eng\nchi_sim\n").unwrap();
    assert_eq!(pool.reload_failed().await, vec![ResourceKind::Model]);
    assert!(pool.status()[0].started);
    // 已运行的引擎不会被再次启动
    assert!(pool.reload_failed().await.is_empty());

    let result = executor.invoke(&ocr_request(&image), "conv", None).await;
    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.content(), "=== OCR Results ===\nInvoice 2024-001");

    let not_image = executor
        .invoke(
            &ActionRequest {
                id: "call_bad".to_string(),
                name: "image_ocr".to_string(),
                arguments: json!({ "image_path": "/etc/passwd" }),
            },
            "conv",
            None,
        )
        .await;
    assert_eq!(not_image.failure_kind(), Some(ErrorKind::InvalidArguments));

    pool.shutdown(Duration::from_secs(1)).await;
}
