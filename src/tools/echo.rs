//! Echo 工具（测试与离线演示用）

use async_trait::async_trait;
use serde_json::Value;

use crate::sandbox::render_value;
use crate::tools::{Tool, ToolInput};

/// Echo 工具：把参数拼成一段文本原样返回
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing)."
    }

    fn inputs(&self) -> Vec<ToolInput> {
        vec![ToolInput::new("text", "string", "text to echo")]
    }

    async fn call(&self, args: Vec<Value>) -> Result<Value, String> {
        if args.is_empty() {
            return Err("echo expects at least one argument".to_string());
        }
        let text: Vec<String> = args.iter().map(render_value).collect();
        Ok(Value::String(text.join(" ")))
    }
}
