//! 图片文字识别工具：借用常驻的 OCR 模型引擎
//!
//! 只接受常见图片扩展名的本地文件；识别本身由模型引擎完成。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::pool::{AcquireMode, ResourceKind};
use crate::tools::{parse_args, schema_of, Tool, ToolContext, ToolFault};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif", "webp"];

#[derive(Debug, Deserialize, JsonSchema)]
struct OcrArgs {
    /// 本地图片路径
    image_path: String,
}

pub struct ImageOcrTool {
    acquire_wait: Duration,
}

impl ImageOcrTool {
    pub fn new(acquire_wait: Duration) -> Self {
        Self { acquire_wait }
    }
}

fn check_image_path(raw: &str) -> Result<&str, ToolFault> {
    let path = raw.trim();
    if path.is_empty() {
        return Err(ToolFault::invalid_args("image_path must not be empty"));
    }
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        Ok(path)
    } else {
        Err(ToolFault::invalid_args(format!(
            "Unsupported image type '{extension}', expected one of: {}",
            IMAGE_EXTENSIONS.join(", ")
        )))
    }
}

#[async_trait]
impl Tool for ImageOcrTool {
    fn name(&self) -> &str {
        "image_ocr"
    }

    fn description(&self) -> &str {
        "Extract text from a local image file (English and Chinese). Args: {\"image_path\": \"/path/to/image.png\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<OcrArgs>()
    }

    fn resource(&self) -> Option<ResourceKind> {
        Some(ResourceKind::Model)
    }

    fn acquire_mode(&self) -> AcquireMode {
        if self.acquire_wait.is_zero() {
            AcquireMode::FailFast
        } else {
            AcquireMode::Wait(self.acquire_wait)
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolContext<'_>) -> Result<String, ToolFault> {
        let args: OcrArgs = parse_args(args)?;
        let path = check_image_path(&args.image_path)?;
        tracing::info!(conversation_id = %ctx.conversation_id, image = %path, "image_ocr");

        let text = ctx.resource()?.run(json!({ "image_path": path })).await?;
        if text.trim().is_empty() {
            Ok("No text found in image".to_string())
        } else {
            Ok(format!("=== OCR Results ===\n{text}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FaultKind;

    #[test]
    fn test_only_image_files_are_accepted() {
        assert_eq!(check_image_path(" scan.PNG ").unwrap(), "scan.PNG");
        assert!(check_image_path("/tmp/photo.jpeg").is_ok());
        for bad in ["/etc/passwd", "notes.txt", "archive.tar.gz", "  "] {
            assert_eq!(check_image_path(bad).unwrap_err().kind, FaultKind::InvalidArgs, "{bad}");
        }
    }

    #[test]
    fn test_declares_model_resource_and_wait_mode() {
        let tool = ImageOcrTool::new(Duration::from_secs(5));
        assert_eq!(tool.resource(), Some(ResourceKind::Model));
        assert_eq!(tool.acquire_mode(), AcquireMode::Wait(Duration::from_secs(5)));
        assert_eq!(ImageOcrTool::new(Duration::ZERO).acquire_mode(), AcquireMode::FailFast);
    }
}
