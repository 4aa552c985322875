//! MCP Router
//! Answers JSON-RPC messages from MCP clients and serves them over stdio

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListToolsResult, RequestId, ServerCapabilities,
    ToolsCapability, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, MCP_PROTOCOL_VERSION,
    PARSE_ERROR, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::tools::Dispatcher;

const INSTRUCTIONS: &str = "Tools for a Character.AI account. Use search_characters or \
get_recent_chats to find character and chat ids, create_chat to start a conversation, \
then send_message to talk.";

/// MCP request router shared by every transport
pub struct McpRouter {
    dispatcher: Arc<Dispatcher>,
}

impl McpRouter {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub async fn session_live(&self) -> bool {
        self.dispatcher.session_live().await
    }

    /// Handle one raw message; `None` means nothing should be sent back
    pub async fn handle_message(&self, raw: &[u8]) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("Unparseable message: {}", e);
                return Some(JsonRpcResponse::failure(
                    None,
                    JsonRpcError::new(PARSE_ERROR, format!("Parse error: {}", e)),
                ));
            }
        };

        let id = value
            .get("id")
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) if request.jsonrpc != "2.0" => Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::new(INVALID_REQUEST, "Invalid request: jsonrpc must be \"2.0\""),
            )),
            Ok(request) => self.handle_request(request).await,
            Err(e) => Some(JsonRpcResponse::failure(
                id,
                JsonRpcError::new(INVALID_REQUEST, format!("Invalid request: {}", e)),
            )),
        }
    }

    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!("Handling {}", request.method);

        if request.is_notification() {
            match request.method.as_str() {
                "notifications/initialized" => info!("Client initialized"),
                "notifications/cancelled" => debug!("Client cancelled a request"),
                other => debug!("Ignoring notification {}", other),
            }
            return None;
        }

        let id = request.id.clone();
        let result = match request.method.as_str() {
            "initialize" => self.initialize(request.params),
            "ping" => Ok(json!({})),
            "tools/list" => self.list_tools(),
            "tools/call" => self.call_tool(request.params).await,
            other => Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            )),
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::failure(id, error),
        })
    }

    fn initialize(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = parse_params(params)?;

        if let Some(client) = &params.client_info {
            info!(
                "Client {} {} connected",
                client.name,
                client.version.as_deref().unwrap_or("")
            );
        }

        let protocol_version = params
            .protocol_version
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(&v.as_str()))
            .unwrap_or_else(|| MCP_PROTOCOL_VERSION.to_string());

        let result = InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    list_changed: false,
                },
            },
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            instructions: Some(INSTRUCTIONS.to_string()),
        };
        to_value(&result)
    }

    fn list_tools(&self) -> Result<Value, JsonRpcError> {
        to_value(&ListToolsResult {
            tools: self.dispatcher.definitions(),
        })
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: CallToolParams = parse_params(params)?;
        let outcome = self.dispatcher.call(&params.name, params.arguments).await;
        to_value(&CallToolResult::from(outcome))
    }
}

fn parse_params<T: for<'de> serde::Deserialize<'de>>(params: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("Invalid params: {}", e)))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, format!("Internal error: {}", e)))
}

/// Serve newline-delimited JSON-RPC until the reader hits EOF
///
/// Each message is handled on its own task so a slow tool call does not hold
/// up the rest; one writer task owns the output so lines never interleave.
pub async fn serve_stdio<R, W>(router: Arc<McpRouter>, mut reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;

        if n == 0 {
            debug!("Client closed stdin");
            break;
        }

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let router = Arc::clone(&router);
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = router.handle_message(&line).await {
                match serde_json::to_string(&response) {
                    Ok(text) => {
                        let _ = tx.send(text);
                    }
                    Err(e) => error!("Failed to encode response: {}", e),
                }
            }
        });
    }

    // Writer drains in-flight responses, then stops once every sender is gone
    drop(tx);
    writer_task.await??;
    Ok(())
}
