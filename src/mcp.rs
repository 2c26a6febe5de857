//! MCP Protocol Handler
//!
//! JSON-RPC 2.0 over stdio, one message per line. Tool calls go through
//! [`Server::handle`]; failures carry the error's own code.
//! Reference: https://modelcontextprotocol.io/specification

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::server::{Server, ToolRequest};
use crate::transport::Priority;

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Deserialize)]
pub struct McpRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, Serialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(McpError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    /// Notification (no id, no response expected)
    pub fn notification() -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: None,
            id: None,
        }
    }

    fn is_silent(&self) -> bool {
        self.id.is_none() && self.result.is_none() && self.error.is_none()
    }
}

/// JSON-RPC standard error codes; serving errors use `ServeError::code`
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
}

/// MCP front end over a [`Server`]
#[derive(Clone)]
pub struct McpServer {
    server: Arc<Server>,
}

impl McpServer {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// Serve stdin/stdout until EOF or `shutdown`
    pub async fn run(&self) -> anyhow::Result<()> {
        let reader = BufReader::new(tokio::io::stdin());
        let writer = tokio::io::stdout();
        self.serve(reader, writer).await
    }

    /// Serve line-delimited JSON-RPC on any reader/writer pair.
    ///
    /// `tools/call` runs on its own task so concurrent calls can share a
    /// batch; replies are written as they complete. `shutdown` stops reading
    /// and is answered once every in-flight call has replied.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<McpResponse>();
        let mut reply_tx = Some(reply_tx);
        let mut shutdown_reply = None;
        let mut lines = reader.lines();
        info!("MCP server ready, waiting for requests...");

        loop {
            tokio::select! {
                Some(response) = reply_rx.recv() => {
                    write_response(&mut writer, &response).await?;
                }
                line = lines.next_line(), if reply_tx.is_some() => match line? {
                    None => {
                        info!("Client disconnected (EOF)");
                        reply_tx = None;
                    }
                    Some(line) => {
                        if let Some(replies) = reply_tx.as_ref() {
                            shutdown_reply = self.dispatch(line.trim(), replies).await;
                        }
                        if shutdown_reply.is_some() {
                            reply_tx = None;
                        }
                    }
                },
                else => break,
            }
        }

        if let Some(response) = shutdown_reply {
            write_response(&mut writer, &response).await?;
        }
        self.server.shutdown().await;
        Ok(())
    }

    /// Route one input line; returns the held reply when it asks for shutdown
    async fn dispatch(
        &self,
        line: &str,
        replies: &mpsc::UnboundedSender<McpResponse>,
    ) -> Option<McpResponse> {
        if line.is_empty() {
            return None;
        }
        debug!("← {}", line);

        let request = match serde_json::from_str::<McpRequest>(line) {
            Ok(request) => request,
            Err(e) => {
                error!("Parse error: {}", e);
                let _ = replies.send(McpResponse::error(
                    None,
                    error_codes::PARSE_ERROR,
                    format!("Parse error: {}", e),
                ));
                return None;
            }
        };

        if request.jsonrpc != "2.0" {
            let _ = replies.send(McpResponse::error(
                request.id,
                error_codes::INVALID_REQUEST,
                "jsonrpc must be \"2.0\"",
            ));
            return None;
        }

        match request.method.as_str() {
            "shutdown" => Some(self.handle_request(request).await),
            "tools/call" => {
                let this = self.clone();
                let replies = replies.clone();
                tokio::spawn(async move {
                    let response = this.handle_request(request).await;
                    if replies.send(response).is_err() {
                        warn!("Reply dropped, writer already closed");
                    }
                });
                None
            }
            _ => {
                let _ = replies.send(self.handle_request(request).await);
                None
            }
        }
    }

    /// Handle a single MCP request
    pub async fn handle_request(&self, request: McpRequest) -> McpResponse {
        match request.method.as_str() {
            // Lifecycle
            "initialize" => self.handle_initialize(request.id),
            "initialized" | "notifications/initialized" => McpResponse::notification(),
            "shutdown" => {
                info!("Shutdown requested");
                McpResponse::success(request.id, json!({}))
            }
            "ping" => McpResponse::success(request.id, json!({})),

            // Tools
            "tools/list" => {
                McpResponse::success(request.id, json!({ "tools": self.server.list_tools() }))
            }
            "tools/call" => self.handle_tools_call(request.id, request.params).await,

            // Health
            "server/health" => McpResponse::success(request.id, self.server.status()),

            method => {
                warn!("Unknown method: {}", method);
                McpResponse::error(
                    request.id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                )
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>) -> McpResponse {
        McpResponse::success(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {
                    "tools": {
                        "listChanged": false
                    }
                },
                "serverInfo": {
                    "name": "toolserve-mcp",
                    "version": env!("CARGO_PKG_VERSION")
                }
            }),
        )
    }

    async fn handle_tools_call(&self, id: Option<Value>, params: Value) -> McpResponse {
        let name = match params.get("name").and_then(|v| v.as_str()) {
            Some(n) => n.to_string(),
            None => {
                return McpResponse::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    "Missing 'name' parameter",
                )
            }
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let mut request = ToolRequest::new(name.as_str(), arguments);
        if params.pointer("/_meta/priority").and_then(|v| v.as_str()) == Some("high") {
            request = request.with_priority(Priority::High);
        }
        if let Some(category) = params.pointer("/_meta/category").and_then(|v| v.as_str()) {
            request = request.with_category(category);
        }

        let response = self.server.handle(request).await;
        match response.result {
            Ok(result) => {
                let text = match &result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                McpResponse::success(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": text }],
                        "structuredContent": result,
                        "_meta": { "latencyMs": response.latency_ms },
                    }),
                )
            }
            Err(e) => {
                let mut reply =
                    McpResponse::error(id, e.code(), format!("Tool '{}' failed: {}", name, e));
                if let Some(error) = reply.error.as_mut() {
                    error.data =
                        Some(json!({ "kind": e.kind(), "latencyMs": response.latency_ms }));
                }
                reply
            }
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &McpResponse) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if response.is_silent() {
        return Ok(());
    }
    let response_json = serde_json::to_string(response)?;
    debug!("→ {}", response_json);
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, ServeConfig};
    use crate::error::{Result, ServeError};
    use crate::index::ToolSpec;
    use crate::transport::{Envelope, ImmediatePolicy, Wire};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Upper-cases `text`; records the frame count of every envelope
    #[derive(Default)]
    struct UpperWire {
        frame_counts: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Wire for UpperWire {
        async fn transmit(&self, envelope: &Envelope) -> Result<Vec<Value>> {
            self.frame_counts.lock().push(envelope.frame_count);
            let body: Value = serde_json::from_slice(&envelope.body)
                .map_err(|e| ServeError::Transport(e.to_string()))?;
            let messages = match body {
                Value::Array(items) => items,
                single => vec![single],
            };
            Ok(messages
                .iter()
                .map(|m| {
                    let text = m["params"]["arguments"]["text"]
                        .as_str()
                        .unwrap_or("")
                        .to_uppercase();
                    json!({"jsonrpc": "2.0", "id": m["id"], "result": text})
                })
                .collect())
        }
    }

    fn config() -> ServeConfig {
        ServeConfig {
            backends: vec![BackendConfig {
                endpoint: "http://a".into(),
                capacity: 10,
                categories: vec![],
            }],
            tools: vec![ToolSpec::new("upper", "text")],
            ..Default::default()
        }
    }

    fn mcp() -> McpServer {
        let server = Server::builder(config())
            .wire(Arc::new(UpperWire::default()))
            .send_policy(Arc::new(ImmediatePolicy))
            .build()
            .unwrap();
        McpServer::new(Arc::new(server))
    }

    fn request(method: &str, params: Value) -> McpRequest {
        McpRequest {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: Some(json!(1)),
        }
    }

    #[tokio::test]
    async fn test_tools_call() {
        let mcp = mcp();
        let response = mcp
            .handle_request(request(
                "tools/call",
                json!({"name": "upper", "arguments": {"text": "hi"}}),
            ))
            .await;
        let result = response.result.unwrap();
        assert_eq!(result["content"][0]["text"], "HI");
    }

    #[tokio::test]
    async fn test_unknown_tool_uses_serve_error_code() {
        let mcp = mcp();
        let response = mcp
            .handle_request(request("tools/call", json!({"name": "missing"})))
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, -32000);
        assert_eq!(error.data.unwrap()["kind"], "tool_not_found");
    }

    #[tokio::test]
    async fn test_missing_name_is_invalid_params() {
        let response = mcp().handle_request(request("tools/call", json!({}))).await;
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_serve_loop_over_buffers() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            "not json\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"server/health"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":4,"method":"shutdown"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":5,"method":"ping"}"#,
            "\n",
        );
        let mut output = Vec::new();
        mcp().serve(input.as_bytes(), &mut output).await.unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        // The notification gets no reply and nothing after shutdown is read
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0]["result"]["serverInfo"]["name"], "toolserve-mcp");
        assert_eq!(lines[1]["error"]["code"], error_codes::PARSE_ERROR);
        assert_eq!(lines[2]["result"]["tools"][0]["name"], "upper");
        assert_eq!(lines[3]["result"]["health"]["status"], "healthy");
        assert_eq!(lines[4]["id"], 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipelined_calls_share_one_batch() {
        let wire = Arc::new(UpperWire::default());
        let server = Server::builder(config())
            .wire(Arc::clone(&wire) as Arc<dyn Wire>)
            .build()
            .unwrap();
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"upper","arguments":{"text":"a"}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"upper","arguments":{"text":"b"}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"upper","arguments":{"text":"c"}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":4,"method":"shutdown"}"#,
            "\n",
        );

        let started = tokio::time::Instant::now();
        let mut output = Vec::new();
        McpServer::new(Arc::new(server))
            .serve(input.as_bytes(), &mut output)
            .await
            .unwrap();

        assert_eq!(*wire.frame_counts.lock(), vec![3]);
        assert!(started.elapsed() < Duration::from_millis(20));

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        // Shutdown is answered only after every in-flight call
        assert_eq!(lines[3]["id"], 4);
        let mut texts: Vec<&str> = lines[..3]
            .iter()
            .map(|l| l["result"]["content"][0]["text"].as_str().unwrap())
            .collect();
        texts.sort();
        assert_eq!(texts, vec!["A", "B", "C"]);
    }
}
