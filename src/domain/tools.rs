//! Built-in tools shipped with the server binary
//!
//! Provides `echo` and `server_time` so a freshly started server has something
//! to list and call. Real deployments plug their own `ToolRegistry` in.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rust_mcp_sdk::{
    macros,
    schema::{CallToolResult, ContentBlock, TextContent, Tool},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{domain::registry::ToolRegistry, errors::AppError};

#[macros::mcp_tool(name = "echo", description = "Echo the given message back to the caller")]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct EchoTool {
    pub message: String,
}

#[macros::mcp_tool(
    name = "server_time",
    description = "Current server wall-clock time in RFC3339 UTC"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ServerTimeTool {}

pub fn build_tools_list() -> Vec<Tool> {
    vec![EchoTool::tool(), ServerTimeTool::tool()]
}

pub fn text_result(text: impl Into<String>, is_error: bool) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(text.into(), None, None))],
        is_error: is_error.then_some(true),
        meta: None,
        structured_content: None,
    }
}

#[derive(Debug, Default)]
pub struct BuiltinTools;

impl BuiltinTools {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolRegistry for BuiltinTools {
    async fn list(&self) -> Result<Vec<Tool>, AppError> {
        Ok(build_tools_list())
    }

    async fn call(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        _cancellation: CancellationToken,
    ) -> Result<CallToolResult, AppError> {
        debug!(tool = %name, "builtin tool invoked");

        match name {
            "echo" => match serde_json::from_value::<EchoTool>(Value::Object(arguments)) {
                Ok(tool) => Ok(text_result(tool.message, false)),
                Err(err) => Ok(text_result(format!("invalid arguments: {err}"), true)),
            },
            "server_time" => {
                let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                let mut result = text_result(now.clone(), false);
                result.structured_content =
                    Some(Map::from_iter([("utc".to_string(), json!(now))]));
                Ok(result)
            }
            _ => Ok(text_result(format!("unknown tool: {name}"), true)),
        }
    }
}
