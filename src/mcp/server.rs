//! The central Model Context Protocol engine
//!
//! Converts decoded JSON-RPC requests and notifications into calls against a
//! fixed method table and the `ToolRegistry` collaborator. Every request
//! yields exactly one response; notifications never do.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use rust_mcp_sdk::schema::CallToolRequestParams;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::registry::ToolRegistry;
use crate::errors::RpcError;
use crate::mcp::rpc::{
    id_key, params_object, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};

pub const SUPPORTED_PROTOCOL_VERSION: &str = "2025-03-26";

pub const SUPPORTED_LOG_LEVELS: [&str; 8] = [
    "debug",
    "info",
    "notice",
    "warning",
    "error",
    "critical",
    "alert",
    "emergency",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Initialized,
    ToolsList,
    ToolsCall,
    Ping,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "initialize" => Some(Self::Initialize),
            "initialized" => Some(Self::Initialized),
            "tools/list" => Some(Self::ToolsList),
            "tools/call" => Some(Self::ToolsCall),
            "ping" => Some(Self::Ping),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Initialized,
    Cancelled,
    Progress,
}

impl NotificationKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "initialized" | "notifications/initialized" => Some(Self::Initialized),
            "cancelled" | "notifications/cancelled" => Some(Self::Cancelled),
            "progress" | "notifications/progress" => Some(Self::Progress),
            _ => None,
        }
    }
}

/// Methods whose invocation may be followed by further pushed messages.
pub fn is_streaming_method(method: &str) -> bool {
    method == "tools/call" || method.starts_with("prompts/") || method.starts_with("resources/")
}

/// In-flight calls are keyed by the caller's scope (session or connection id)
/// and the request id, so clients reusing small ids never collide.
type InFlightKey = (String, String);

struct InFlight {
    serial: u64,
    cancel: CancellationToken,
    progress_token: Option<String>,
}

/// Removes its own in-flight entry when the call finishes or its future is dropped.
struct InFlightRegistration<'a> {
    table: &'a DashMap<InFlightKey, InFlight>,
    key: InFlightKey,
    serial: u64,
}

impl Drop for InFlightRegistration<'_> {
    fn drop(&mut self) {
        let serial = self.serial;
        self.table.remove_if(&self.key, |_, entry| entry.serial == serial);
    }
}

pub struct Dispatcher {
    tools: Arc<dyn ToolRegistry>,
    in_flight: DashMap<InFlightKey, InFlight>,
    next_serial: AtomicU64,
}

impl Dispatcher {
    pub fn new(tools: Arc<dyn ToolRegistry>) -> Self {
        Self {
            tools,
            in_flight: DashMap::new(),
            next_serial: AtomicU64::new(0),
        }
    }

    /// Classifies a raw payload and routes it. Returns the response to write,
    /// or `None` for notifications and client replies. `scope` identifies the
    /// caller for cancellation and progress correlation.
    pub async fn handle_value(
        &self,
        payload: Value,
        scope: &str,
        cancellation: &CancellationToken,
    ) -> Option<JsonRpcResponse> {
        match JsonRpcMessage::from_value(payload) {
            Ok(JsonRpcMessage::Request(request)) => {
                Some(self.dispatch(request, scope, cancellation).await)
            }
            Ok(JsonRpcMessage::Notification(notification)) => {
                self.notify(notification, scope);
                None
            }
            Ok(JsonRpcMessage::ClientResponse(reply)) => {
                debug!(id = %(reply.get("id").cloned().unwrap_or(serde_json::Value::Null)), "ignoring client response");
                None
            }
            Err((id, error)) => Some(JsonRpcResponse::failure(id, error)),
        }
    }

    pub async fn dispatch(
        &self,
        request: JsonRpcRequest,
        scope: &str,
        cancellation: &CancellationToken,
    ) -> JsonRpcResponse {
        let audit_params = redact_audit_params(request.params.as_ref());

        let result = match Method::from_name(&request.method) {
            Some(Method::Initialize) => self.initialize(request.params.as_ref()),
            Some(Method::Initialized) => Ok(json!({})),
            Some(Method::Ping) => Ok(ping_payload()),
            Some(Method::ToolsList) => self.list_tools().await,
            Some(Method::ToolsCall) => {
                self.call_tool(scope, &request.id, request.params.as_ref(), cancellation)
                    .await
            }
            None => Err(RpcError::MethodNotFound(request.method.clone())),
        };

        info!(
            method = %request.method,
            id = %request.id,
            scope = %scope,
            params = %audit_params,
            outcome = if result.is_ok() { "success" } else { "failure" },
            "mcp action audited"
        );

        match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(error) => JsonRpcResponse::failure(request.id, error),
        }
    }

    pub fn notify(&self, notification: JsonRpcNotification, scope: &str) {
        let params = notification.params.as_ref();

        match NotificationKind::from_name(&notification.method) {
            Some(NotificationKind::Initialized) => info!("client initialized"),
            Some(NotificationKind::Cancelled) => {
                let Some(request_id) = params.and_then(|p| p.get("requestId")) else {
                    debug!("cancelled notification without requestId");
                    return;
                };
                let reason = params
                    .and_then(|p| p.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified");

                let key = (scope.to_string(), id_key(request_id));
                match self.in_flight.get(&key) {
                    Some(entry) => {
                        entry.cancel.cancel();
                        info!(scope = %scope, request_id = %request_id, reason = %reason, "request cancelled by client");
                    }
                    None => debug!(scope = %scope, request_id = %request_id, "no in-flight request to cancel"),
                }
            }
            Some(NotificationKind::Progress) => {
                let Some(token) = params.and_then(|p| p.get("progressToken")) else {
                    debug!("progress notification without progressToken");
                    return;
                };
                let token = id_key(token);
                let progress = params.and_then(|p| p.get("progress")).cloned();
                let total = params.and_then(|p| p.get("total")).cloned();

                let tracked = self.in_flight.iter().find_map(|entry| {
                    let (entry_scope, request_id) = entry.key();
                    (entry_scope == scope && entry.progress_token.as_deref() == Some(token.as_str()))
                        .then(|| request_id.clone())
                });
                match tracked {
                    Some(request_id) => info!(
                        request_id = %request_id,
                        progress_token = %token,
                        progress = ?progress,
                        total = ?total,
                        "progress update"
                    ),
                    None => debug!(scope = %scope, progress_token = %token, "progress for untracked token"),
                }
            }
            None => debug!(method = %notification.method, "ignoring unknown notification"),
        }
    }

    /// Number of tool calls currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn register_in_flight(
        &self,
        scope: &str,
        id: &Value,
        cancel: CancellationToken,
        progress_token: Option<String>,
    ) -> InFlightRegistration<'_> {
        let key = (scope.to_string(), id_key(id));
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let replaced = self.in_flight.insert(
            key.clone(),
            InFlight {
                serial,
                cancel,
                progress_token,
            },
        );
        if replaced.is_some() {
            warn!(scope = %scope, id = %id, "request id reused while a call with that id is in flight");
        }

        InFlightRegistration {
            table: &self.in_flight,
            key,
            serial,
        }
    }

    fn initialize(&self, params: Option<&Value>) -> Result<Value, RpcError> {
        let offered_version = negotiate_protocol_version(params)?;
        if offered_version != SUPPORTED_PROTOCOL_VERSION {
            warn!(
                offered = %offered_version,
                supported = SUPPORTED_PROTOCOL_VERSION,
                "client offered a different protocol version"
            );
        }

        Ok(json!({
            "protocolVersion": SUPPORTED_PROTOCOL_VERSION,
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {
                "tools": { "listChanged": true },
                "logging": { "levels": SUPPORTED_LOG_LEVELS },
            },
        }))
    }

    async fn list_tools(&self) -> Result<Value, RpcError> {
        let tools = self.tools.list().await?;
        Ok(json!({ "tools": tools }))
    }

    async fn call_tool(
        &self,
        scope: &str,
        id: &Value,
        params: Option<&Value>,
        cancellation: &CancellationToken,
    ) -> Result<Value, RpcError> {
        let raw_params = params_object(params)?;
        let progress_token = raw_params
            .get("_meta")
            .and_then(|meta| meta.get("progressToken"))
            .map(id_key);
        let tool_call: CallToolRequestParams = serde_json::from_value(Value::Object(raw_params))
            .map_err(|err| RpcError::InvalidParams(format!("invalid tools/call params: {err}")))?;
        if tool_call.name.trim().is_empty() {
            return Err(RpcError::InvalidParams("tool name is required".to_string()));
        }

        let call_cancel = cancellation.child_token();
        let _registration = self.register_in_flight(scope, id, call_cancel.clone(), progress_token);

        let outcome = tokio::select! {
            biased;
            _ = call_cancel.cancelled() => Err(RpcError::Internal("request cancelled".to_string())),
            result = self.tools.call(
                &tool_call.name,
                tool_call.arguments.unwrap_or_default(),
                call_cancel.clone(),
            ) => result.map_err(RpcError::from),
        };

        let result = outcome?;
        if result.is_error == Some(true) {
            debug!(tool = %tool_call.name, "tool reported a domain error");
        }
        serde_json::to_value(result)
            .map_err(|err| RpcError::Internal(format!("tool result serialization: {err}")))
    }
}

pub fn ping_payload() -> Value {
    json!({
        "pong": true,
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

/// The client's protocol version is required but advisory: mismatches are
/// logged by the caller, never rejected.
pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<String, RpcError> {
    params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            RpcError::InvalidParams("initialize params.protocolVersion is required".to_string())
        })
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "credentials" | "credential" | "api_key" | "apikey"
    ) || (normalized.contains("token") && normalized != "progresstoken")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::DateTime;
    use rust_mcp_sdk::schema::{CallToolResult, Tool};
    use serde_json::{json, Map};

    use super::*;
    use crate::domain::tools::{build_tools_list, text_result};
    use crate::errors::AppError;

    struct MockTools;

    #[async_trait]
    impl ToolRegistry for MockTools {
        async fn list(&self) -> Result<Vec<Tool>, AppError> {
            Ok(build_tools_list())
        }

        async fn call(
            &self,
            name: &str,
            arguments: Map<String, Value>,
            cancellation: CancellationToken,
        ) -> Result<CallToolResult, AppError> {
            match name {
                "echo" => Ok(text_result(
                    arguments
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                    false,
                )),
                "explode" => Err(AppError::internal("registry backend unavailable")),
                "reject" => Err(AppError::bad_request("invalid_arguments", "bad input")),
                "wait" => {
                    cancellation.cancelled().await;
                    Ok(text_result("cancelled", true))
                }
                _ => Ok(text_result(format!("unknown tool: {name}"), true)),
            }
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(MockTools))
    }

    async fn call(dispatcher: &Dispatcher, payload: Value) -> Option<Value> {
        dispatcher
            .handle_value(payload, "client-a", &CancellationToken::new())
            .await
            .map(|response| serde_json::to_value(response).expect("serialize response"))
    }

    #[test]
    fn redacts_sensitive_fields_in_audit_params() {
        let params = json!({
            "name": "echo",
            "arguments": {
                "message": "hi",
                "token": "should-not-appear",
                "api_key": "should-not-appear",
                "nested": {
                    "secret": "should-not-appear"
                }
            },
            "_meta": { "progressToken": "p-1" }
        });

        let redacted = redact_audit_params(Some(&params));

        assert_eq!(redacted["name"], json!("echo"));
        assert_eq!(redacted["arguments"]["message"], json!("hi"));
        assert_eq!(redacted["arguments"]["token"], json!("[REDACTED]"));
        assert_eq!(redacted["arguments"]["api_key"], json!("[REDACTED]"));
        assert_eq!(
            redacted["arguments"]["nested"]["secret"],
            json!("[REDACTED]")
        );
        assert_eq!(redacted["_meta"]["progressToken"], json!("p-1"));
    }

    #[test]
    fn negotiate_protocol_version_requires_a_version() {
        let error = negotiate_protocol_version(Some(&json!({}))).expect_err("missing version");
        assert_eq!(error.code(), -32602);
    }

    #[test]
    fn streaming_methods_cover_tools_prompts_and_resources() {
        assert!(is_streaming_method("tools/call"));
        assert!(is_streaming_method("prompts/get"));
        assert!(is_streaming_method("resources/read"));
        assert!(!is_streaming_method("tools/list"));
        assert!(!is_streaming_method("ping"));
    }

    #[tokio::test]
    async fn initialize_reports_fixed_version_and_capabilities() {
        let response = call(
            &dispatcher(),
            json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"c","version":"1"}}}),
        )
        .await
        .expect("response");

        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], SUPPORTED_PROTOCOL_VERSION);
        assert_eq!(response["result"]["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(
            response["result"]["capabilities"]["logging"]["levels"][0],
            "debug"
        );
        assert_eq!(response["result"]["serverInfo"]["name"], env!("CARGO_PKG_NAME"));
    }

    #[tokio::test]
    async fn initialize_without_version_is_invalid_params() {
        let response = call(
            &dispatcher(),
            json!({"jsonrpc":"2.0","id":"init","method":"initialize","params":{}}),
        )
        .await
        .expect("response");

        assert_eq!(response["id"], "init");
        assert_eq!(response["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn ping_returns_pong_with_current_timestamp() {
        let before = Utc::now() - chrono::Duration::milliseconds(1);
        let response = call(&dispatcher(), json!({"jsonrpc":"2.0","id":1,"method":"ping"}))
            .await
            .expect("response");

        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["pong"], true);
        let timestamp = response["result"]["timestamp"]
            .as_str()
            .expect("timestamp string");
        let parsed = DateTime::parse_from_rfc3339(timestamp).expect("rfc3339 timestamp");
        assert!(parsed >= before);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let response = call(
            &dispatcher(),
            json!({"jsonrpc":"2.0","id":9,"method":"resources/list"}),
        )
        .await
        .expect("response");

        assert_eq!(response["id"], 9);
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["error"]["data"]["details"]["method"], "resources/list");
    }

    #[tokio::test]
    async fn tools_list_returns_registry_descriptors() {
        let response = call(&dispatcher(), json!({"jsonrpc":"2.0","id":2,"method":"tools/list"}))
            .await
            .expect("response");

        assert_eq!(response["result"]["tools"][0]["name"], "echo");
        assert!(response["result"]["tools"][0]["inputSchema"].is_object());
        assert_eq!(response["result"]["tools"][1]["name"], "server_time");
    }

    #[tokio::test]
    async fn tools_call_wraps_registry_result() {
        let response = call(
            &dispatcher(),
            json!({"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"echo","arguments":{"message":"hi"}}}),
        )
        .await
        .expect("response");

        assert!(response.get("error").is_none());
        assert_eq!(response["result"]["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_result_with_is_error() {
        let dispatcher = dispatcher();
        let response = call(
            &dispatcher,
            json!({"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"nope","arguments":{}}}),
        )
        .await
        .expect("response");

        assert!(response.get("error").is_none());
        assert_eq!(response["result"]["isError"], true);

        let follow_up = call(&dispatcher, json!({"jsonrpc":"2.0","id":5,"method":"ping"}))
            .await
            .expect("response");
        assert_eq!(follow_up["result"]["pong"], true);
    }

    #[tokio::test]
    async fn tools_call_without_name_is_invalid_params() {
        let response = call(
            &dispatcher(),
            json!({"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"arguments":{}}}),
        )
        .await
        .expect("response");

        assert_eq!(response["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn tools_call_with_non_object_params_is_invalid_params() {
        let response = call(
            &dispatcher(),
            json!({"jsonrpc":"2.0","id":6,"method":"tools/call","params":[1,2,3]}),
        )
        .await
        .expect("response");

        assert_eq!(response["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn registry_failures_map_to_internal_error() {
        let response = call(
            &dispatcher(),
            json!({"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"explode","arguments":{}}}),
        )
        .await
        .expect("response");

        assert_eq!(response["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn registry_rejections_map_to_invalid_params() {
        let response = call(
            &dispatcher(),
            json!({"jsonrpc":"2.0","id":8,"method":"tools/call","params":{"name":"reject","arguments":{}}}),
        )
        .await
        .expect("response");

        assert_eq!(response["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn notifications_never_produce_a_response() {
        let dispatcher = dispatcher();

        for method in ["initialized", "notifications/initialized", "cancelled", "progress", "whatever"] {
            let response = call(&dispatcher, json!({"jsonrpc":"2.0","method":method})).await;
            assert!(response.is_none(), "{method} produced a response");
        }
    }

    #[tokio::test]
    async fn cancelled_notification_cancels_the_matching_call() {
        let dispatcher = Arc::new(dispatcher());

        let pending = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .dispatch(
                        JsonRpcRequest::new(
                            "slow-1",
                            "tools/call",
                            Some(json!({"name":"wait","arguments":{}})),
                        ),
                        "client-a",
                        &CancellationToken::new(),
                    )
                    .await
            })
        };

        for _ in 0..100 {
            if dispatcher.in_flight_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dispatcher.in_flight_count(), 1);

        dispatcher.notify(
            JsonRpcNotification::new(
                "notifications/cancelled",
                Some(json!({"requestId":"slow-1","reason":"user abort"})),
            ),
            "client-a",
        );

        let response = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("call finished")
            .expect("task joined");
        assert_eq!(response.id, json!("slow-1"));
        assert!(response.is_error());
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn transport_cancellation_reaches_tool_calls() {
        let dispatcher = dispatcher();
        let transport = CancellationToken::new();
        transport.cancel();

        let response = dispatcher
            .dispatch(
                JsonRpcRequest::new(1, "tools/call", Some(json!({"name":"wait"}))),
                "client-a",
                &transport,
            )
            .await;

        assert_eq!(response.id, json!(1));
        assert!(response.is_error());
    }

    fn spawn_wait_call(
        dispatcher: &Arc<Dispatcher>,
        id: Value,
        scope: &'static str,
    ) -> tokio::task::JoinHandle<JsonRpcResponse> {
        let dispatcher = Arc::clone(dispatcher);
        tokio::spawn(async move {
            dispatcher
                .dispatch(
                    JsonRpcRequest::new(id, "tools/call", Some(json!({"name":"wait"}))),
                    scope,
                    &CancellationToken::new(),
                )
                .await
        })
    }

    async fn wait_for_in_flight(dispatcher: &Dispatcher, expected: usize) {
        for _ in 0..100 {
            if dispatcher.in_flight_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dispatcher.in_flight_count(), expected);
    }

    fn cancel(dispatcher: &Dispatcher, request_id: Value, scope: &str) {
        dispatcher.notify(
            JsonRpcNotification::new("notifications/cancelled", Some(json!({"requestId": request_id}))),
            scope,
        );
    }

    #[tokio::test]
    async fn cancellation_is_scoped_to_the_calling_client() {
        let dispatcher = Arc::new(dispatcher());
        let client_b = spawn_wait_call(&dispatcher, json!(1), "client-b");
        wait_for_in_flight(&dispatcher, 1).await;

        cancel(&dispatcher, json!(1), "client-a");

        let outcome = tokio::time::timeout(Duration::from_millis(100), client_b).await;
        assert!(outcome.is_err(), "another client's cancel ended the call");
        assert_eq!(dispatcher.in_flight_count(), 1);

        cancel(&dispatcher, json!(1), "client-b");
        wait_for_in_flight(&dispatcher, 0).await;
    }

    #[tokio::test]
    async fn same_id_in_two_scopes_is_tracked_separately() {
        let dispatcher = Arc::new(dispatcher());
        let first = spawn_wait_call(&dispatcher, json!(7), "client-a");
        let second = spawn_wait_call(&dispatcher, json!(7), "client-b");
        wait_for_in_flight(&dispatcher, 2).await;

        cancel(&dispatcher, json!(7), "client-a");
        let response = tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .expect("first call finished")
            .expect("task joined");
        assert!(response.is_error());
        assert_eq!(dispatcher.in_flight_count(), 1);

        cancel(&dispatcher, json!(7), "client-b");
        let response = tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .expect("second call finished")
            .expect("task joined");
        assert!(response.is_error());
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn finished_duplicate_does_not_unregister_the_live_call() {
        let dispatcher = Arc::new(dispatcher());
        let older = spawn_wait_call(&dispatcher, json!(3), "client-a");
        wait_for_in_flight(&dispatcher, 1).await;
        let newer = spawn_wait_call(&dispatcher, json!(3), "client-a");
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The newer registration replaced the older one under the shared key.
        older.abort();
        let _ = older.await;
        assert_eq!(dispatcher.in_flight_count(), 1);

        cancel(&dispatcher, json!(3), "client-a");
        let response = tokio::time::timeout(Duration::from_secs(2), newer)
            .await
            .expect("newer call still cancellable")
            .expect("task joined");
        assert!(response.is_error());
        assert_eq!(dispatcher.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn dropping_a_pending_call_clears_its_entry() {
        let dispatcher = dispatcher();

        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            dispatcher.dispatch(
                JsonRpcRequest::new(1, "tools/call", Some(json!({"name":"wait"}))),
                "client-a",
                &CancellationToken::new(),
            ),
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(dispatcher.in_flight_count(), 0);
    }
}
