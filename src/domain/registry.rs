use async_trait::async_trait;
use rust_mcp_sdk::schema::{CallToolResult, Tool};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::errors::AppError;

/// Owner of the callable capabilities exposed over `tools/list` and `tools/call`.
///
/// Domain failures (unknown tool, bad arguments, a failing backend call) are
/// reported inside the result with `is_error` set. An `Err` is reserved for
/// failures of the registry itself and becomes a JSON-RPC internal error.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<Tool>, AppError>;

    async fn call(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        cancellation: CancellationToken,
    ) -> Result<CallToolResult, AppError>;
}
