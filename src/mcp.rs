//! Minimal Model Context Protocol client over a child process' stdio.
//!
//! Messages are newline-delimited JSON-RPC 2.0. The session lives for one
//! monitoring cycle: spawned, initialized, used by the agent, then closed.

use crate::{
    agent::Tool,
    config::MessagingConfig,
    llm::ToolOutput,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{process::Stdio, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex,
    time::timeout,
};
use tracing::instrument;

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Error, Debug)]
pub enum McpError {
    #[error("Failed to spawn tool server `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("Tool server io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid message from tool server: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Tool server returned error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("Tool server closed the connection")]
    Closed,
    #[error("Tool server did not answer within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    tools: Vec<RemoteTool>,
    #[serde(rename = "nextCursor", default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Flattens the content blocks into text for the model.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|block| match block.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => format!(
                    "[{} content]",
                    block.get("type").and_then(Value::as_str).unwrap_or("unknown")
                ),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

pub struct McpClient<R, W> {
    reader: BufReader<R>,
    writer: W,
    next_id: u64,
}

impl<R, W> McpClient<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 1,
        }
    }

    pub async fn initialize(&mut self) -> Result<Value, McpError> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await?;
        self.notify("notifications/initialized", json!({})).await?;
        Ok(result)
    }

    pub async fn list_tools(&mut self) -> Result<Vec<RemoteTool>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let page: ListToolsResult =
                serde_json::from_value(self.request("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
    }

    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .request(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .await?;
        self.read_response(id).await
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<(), McpError> {
        self.send(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))
        .await
    }

    async fn send(&mut self, message: &Value) -> Result<(), McpError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_response(&mut self, id: u64) -> Result<Value, McpError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(McpError::Closed);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let message: Value = match serde_json::from_str(trimmed) {
                Ok(message) => message,
                Err(_) => {
                    tracing::debug!("Ignoring non JSON-RPC output: {}", trimmed);
                    continue;
                }
            };

            if let Some(method) = message.get("method").and_then(Value::as_str) {
                match message.get("id") {
                    Some(request_id) => self.answer_server_request(method, request_id).await?,
                    None => tracing::debug!("Tool server notification: {}", method),
                }
                continue;
            }

            if message.get("id").and_then(Value::as_u64) != Some(id) {
                tracing::debug!("Ignoring response for another request: {}", trimmed);
                continue;
            }

            if let Some(error) = message.get("error") {
                let error: RpcError = serde_json::from_value(error.clone())?;
                return Err(McpError::Remote {
                    code: error.code,
                    message: error.message,
                });
            }

            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn answer_server_request(&mut self, method: &str, id: &Value) -> Result<(), McpError> {
        let reply = if method == "ping" {
            json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        } else {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {}", method) }
            })
        };
        self.send(&reply).await
    }
}

/// A running tool server. The child is killed if the session is dropped
/// without [`McpSession::close`].
pub struct McpSession {
    name: String,
    client: Mutex<Option<McpClient<ChildStdout, ChildStdin>>>,
    child: Mutex<Option<Child>>,
    shutdown_timeout: Duration,
}

impl McpSession {
    #[instrument(skip(config), fields(server = %config.server_name))]
    pub async fn connect(config: &MessagingConfig) -> Result<Self, McpError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| McpError::Spawn {
                command: config.command.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(McpError::Closed)?;
        let stdout = child.stdout.take().ok_or(McpError::Closed)?;
        let mut client = McpClient::new(stdout, stdin);

        let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
        let info = timeout(startup_timeout, client.initialize())
            .await
            .map_err(|_| McpError::Timeout(startup_timeout))??;
        tracing::info!(
            "Connected to tool server {}: {}",
            config.server_name,
            info.get("serverInfo").cloned().unwrap_or(serde_json::Value::Null)
        );

        Ok(Self {
            name: config.server_name.clone(),
            client: Mutex::new(Some(client)),
            child: Mutex::new(Some(child)),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        })
    }

    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, McpError> {
        let mut client = self.client.lock().await;
        client.as_mut().ok_or(McpError::Closed)?.list_tools().await
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        let mut client = self.client.lock().await;
        client
            .as_mut()
            .ok_or(McpError::Closed)?
            .call_tool(name, arguments)
            .await
    }

    /// Closes stdin, waits for the server to exit and kills it if it does not.
    pub async fn close(&self) {
        drop(self.client.lock().await.take());

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => tracing::info!("Tool server {} exited with {}", self.name, status),
            Ok(Err(e)) => tracing::warn!("Failed to wait for tool server {}: {}", self.name, e),
            Err(_) => {
                tracing::warn!("Tool server {} did not exit, killing it", self.name);
                if let Err(e) = child.kill().await {
                    tracing::error!("Failed to kill tool server {}: {}", self.name, e);
                }
            }
        }
    }
}

/// A remote tool exposed to the agent under its own name.
pub struct McpTool {
    session: Arc<McpSession>,
    tool: RemoteTool,
}

impl McpTool {
    pub fn new(session: Arc<McpSession>, tool: RemoteTool) -> Self {
        Self { session, tool }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.tool.name
    }

    fn description(&self) -> &str {
        self.tool.description.as_deref().unwrap_or_default()
    }

    fn parameters(&self) -> Value {
        self.tool.input_schema.clone()
    }

    // Server schemas usually carry optional parameters.
    fn strict(&self) -> bool {
        false
    }

    async fn call(&self, arguments: Value) -> ToolOutput {
        match self.session.call_tool(&self.tool.name, arguments).await {
            Ok(result) if result.is_error => {
                tracing::warn!("Tool `{}` reported an error", self.tool.name);
                ToolOutput::error(result.text())
            }
            Ok(result) => ToolOutput::Text(result.text()),
            Err(e) => {
                tracing::error!("Tool `{}` failed: {}", self.tool.name, e);
                ToolOutput::error(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    type TestClient = McpClient<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    /// Spawns a fake server that answers each request line with the next
    /// scripted reply lines and returns every line it received.
    fn fake_server(script: Vec<Vec<String>>) -> (TestClient, tokio::task::JoinHandle<Vec<Value>>) {
        let (client_side, server_side) = duplex(64 * 1024);
        let (client_read, client_write) = split(client_side);
        let (server_read, mut server_write) = split(server_side);

        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let mut received = Vec::new();
            let mut script = script.into_iter();
            while let Ok(Some(line)) = lines.next_line().await {
                let message: Value = serde_json::from_str(&line).unwrap();
                let is_request = message.get("id").is_some() && message.get("method").is_some();
                received.push(message);
                if !is_request {
                    continue;
                }
                let Some(replies) = script.next() else {
                    break;
                };
                for reply in replies {
                    server_write.write_all(reply.as_bytes()).await.unwrap();
                    server_write.write_all(b"\n").await.unwrap();
                }
            }
            received
        });

        (McpClient::new(client_read, client_write), handle)
    }

    #[tokio::test]
    async fn test_initialize_sends_initialized_notification() {
        let (mut client, server) = fake_server(vec![vec![
            r#"{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"messaging"}}}"#.into(),
        ]]);

        let info = client.initialize().await.unwrap();
        drop(client);
        let received = server.await.unwrap();

        assert_eq!(info["serverInfo"]["name"], "messaging");
        assert_eq!(received[0]["method"], "initialize");
        assert_eq!(received[0]["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(received[1]["method"], "notifications/initialized");
        assert!(received[1].get("id").is_none());
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor_and_skips_noise() {
        let (mut client, _server) = fake_server(vec![
            vec![
                "starting messaging bridge...".into(),
                r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#.into(),
                r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"send_message","description":"Send a message","inputSchema":{"type":"object"}}],"nextCursor":"page2"}}"#.into(),
            ],
            vec![
                r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"send_file"}]}}"#.into(),
            ],
        ]);

        let tools = client.list_tools().await.unwrap();

        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "send_message");
        assert_eq!(tools[0].description.as_deref(), Some("Send a message"));
        assert_eq!(tools[1].name, "send_file");
        assert_eq!(tools[1].input_schema["type"], "object");
    }

    #[tokio::test]
    async fn test_call_tool_returns_text_content() {
        let (mut client, server) = fake_server(vec![vec![
            r#"{"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"sent"}],"isError":false}}"#.into(),
        ]]);

        let result = client
            .call_tool("send_message", json!({ "recipient": "+1555", "message": "hi" }))
            .await
            .unwrap();
        drop(client);
        let received = server.await.unwrap();

        assert!(!result.is_error);
        assert_eq!(result.text(), "sent");
        assert_eq!(received[0]["method"], "tools/call");
        assert_eq!(received[0]["params"]["name"], "send_message");
        assert_eq!(received[0]["params"]["arguments"]["recipient"], "+1555");
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (mut client, server) = fake_server(vec![vec![
            r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#.into(),
            r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#.into(),
        ]]);

        let tools = client.list_tools().await.unwrap();
        drop(client);
        let received = server.await.unwrap();

        assert!(tools.is_empty());
        let pong = received
            .iter()
            .find(|message| message["id"] == "srv-1")
            .unwrap();
        assert_eq!(pong["result"], json!({}));
    }

    #[tokio::test]
    async fn test_remote_error_is_mapped() {
        let (mut client, _server) = fake_server(vec![vec![
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"unknown tool"}}"#.into(),
        ]]);

        let err = client.call_tool("nope", json!({})).await.unwrap_err();

        assert!(matches!(err, McpError::Remote { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_closed_stream_is_reported() {
        let (mut client, _server) = fake_server(vec![]);

        let err = client.list_tools().await.unwrap_err();

        assert!(matches!(err, McpError::Closed));
    }

    #[test]
    fn test_call_result_text_describes_non_text_blocks() {
        let result = CallToolResult {
            content: vec![
                json!({ "type": "text", "text": "delivered" }),
                json!({ "type": "image", "data": "AAAA" }),
            ],
            is_error: false,
        };

        assert_eq!(result.text(), "delivered\n[image content]");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_spawns_and_closes_child() {
        let script = r#"
read -r init
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"sh"}}}'
read -r initialized
read -r list
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"send_message"}]}}'
cat > /dev/null
"#;
        let config = MessagingConfig {
            server_name: "sh".into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            startup_timeout_secs: 5,
            shutdown_timeout_secs: 5,
        };

        let session = McpSession::connect(&config).await.unwrap();
        let tools = session.list_tools().await.unwrap();
        session.close().await;

        assert_eq!(tools[0].name, "send_message");
        assert!(matches!(session.list_tools().await, Err(McpError::Closed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_tool_definition_is_not_strict() {
        let script = r#"
read -r init
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"serverInfo":{"name":"sh"}}}'
cat > /dev/null
"#;
        let config = MessagingConfig {
            server_name: "sh".into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            startup_timeout_secs: 5,
            shutdown_timeout_secs: 5,
        };
        let session = Arc::new(McpSession::connect(&config).await.unwrap());
        let tool = McpTool::new(
            session.clone(),
            RemoteTool {
                name: "send_message".into(),
                description: Some("Send a message".into()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "recipient": { "type": "string" },
                        "media_path": { "type": "string" }
                    },
                    "required": ["recipient"]
                }),
            },
        );

        let wire = serde_json::to_value(tool.definition()).unwrap();
        session.close().await;

        assert_eq!(wire["type"], "function");
        assert_eq!(wire["name"], "send_message");
        assert_eq!(wire["strict"], false);
        assert_eq!(wire["parameters"]["required"], json!(["recipient"]));
    }

    #[tokio::test]
    async fn test_missing_command_fails_to_spawn() {
        let config = MessagingConfig {
            server_name: "missing".into(),
            command: "/nonexistent/tool-server".into(),
            args: vec![],
            startup_timeout_secs: 1,
            shutdown_timeout_secs: 1,
        };

        let err = McpSession::connect(&config).await.err().unwrap();

        assert!(matches!(err, McpError::Spawn { .. }));
    }
}
