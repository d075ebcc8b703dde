use std::net::SocketAddr;
use std::sync::Arc;

use appscope_core::ToolError;
use appscope_core::args::InvocationContext;
use appscope_core::tools::{ToolName, tool_definitions};
use clap::{Args, Subcommand};
use serde_json::{Map, Value, json};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use uuid::Uuid;

pub mod auth;
pub mod graph;
pub mod handlers;
mod http;
pub mod kusto;
pub mod util;

pub use handlers::ToolHandlers;

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const MCP_SERVER_NAME: &str = "appscope-mcp";

#[derive(Subcommand)]
pub enum McpCommands {
    /// Run the MCP server over stdio
    Serve,
    /// Run the MCP server over HTTP (POST /mcp)
    ServeHttp(McpServeHttpArgs),
    /// Invoke a single tool and print its result
    Call(McpCallArgs),
}

#[derive(Args, Clone, Debug)]
pub struct McpServeHttpArgs {
    /// Address to listen on
    #[arg(long, env = "APPSCOPE_BIND", default_value = "127.0.0.1:7071")]
    pub bind: SocketAddr,
}

#[derive(Args, Clone, Debug)]
pub struct McpCallArgs {
    /// Tool name (whoAmI, kustoQuery, getRecentActiveFunctionApps)
    pub tool: String,
    /// Invocation context JSON, e.g. '{"arguments":{"includeEmail":true}}'
    #[arg(long, default_value = "{}")]
    pub context: String,
}

pub async fn run(command: McpCommands) -> i32 {
    let server = McpServer::new(ToolHandlers::from_process_env());
    match command {
        McpCommands::Serve => match server.serve_stdio().await {
            Ok(()) => 0,
            Err(err) => {
                tracing::error!(error = %err, "mcp server stopped");
                1
            }
        },
        McpCommands::ServeHttp(args) => match http::serve(Arc::new(server), args.bind).await {
            Ok(()) => 0,
            Err(err) => {
                tracing::error!(error = %err, bind = %args.bind, "mcp http server stopped");
                1
            }
        },
        McpCommands::Call(args) => {
            let Some(tool) = ToolName::parse(&args.tool) else {
                eprintln!("Unknown tool: {}", args.tool);
                return 2;
            };
            let context = match InvocationContext::from_json(&args.context) {
                Ok(context) => context,
                Err(err) => {
                    eprintln!("Invalid invocation context: {err}");
                    return 2;
                }
            };
            let outcome = server.handlers.invoke(tool, &context.into_arguments()).await;
            let code = if outcome.is_ok() { 0 } else { 1 };
            println!("{}", flatten(outcome));
            code
        }
    }
}

/// How a message arrived on stdio; replies use the same framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    ContentLength,
    NewlineDelimited,
}

pub struct McpServer {
    handlers: ToolHandlers,
    session_id: String,
}

impl McpServer {
    pub fn new(handlers: ToolHandlers) -> Self {
        Self {
            handlers,
            session_id: format!("mcp-{}", Uuid::now_v7()),
        }
    }

    pub async fn serve_stdio(&self) -> Result<(), String> {
        tracing::info!(
            server = MCP_SERVER_NAME,
            version = env!("CARGO_PKG_VERSION"),
            session_id = %self.session_id,
            "serving MCP over stdio"
        );
        let mut reader = BufReader::new(io::stdin());
        let mut stdout = io::stdout();
        self.serve_io(&mut reader, &mut stdout).await
    }

    async fn serve_io<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<(), String>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let incoming = read_message(reader)
                .await
                .map_err(|e| format!("Failed to read MCP message: {e}"))?;
            let Some((incoming, framing)) = incoming else {
                break;
            };

            let responses = match incoming {
                Ok(message) => self.handle_incoming_message(message).await,
                Err(error) => {
                    tracing::warn!(error = %error.message, "malformed MCP message");
                    vec![error_response(Value::Null, error)]
                }
            };
            for response in responses {
                write_message(writer, &response, framing)
                    .await
                    .map_err(|e| format!("Failed to write MCP response: {e}"))?;
            }
        }

        Ok(())
    }

    pub async fn handle_incoming_message(&self, incoming: Value) -> Vec<Value> {
        let mut responses = Vec::new();

        if let Some(batch) = incoming.as_array() {
            if batch.is_empty() {
                responses.push(error_response(
                    Value::Null,
                    RpcError::invalid_request("Batch request must not be empty"),
                ));
                return responses;
            }
            for item in batch {
                if let Some(response) = self.handle_single_message(item.clone()).await {
                    responses.push(response);
                }
            }
            return responses;
        }

        if let Some(response) = self.handle_single_message(incoming).await {
            responses.push(response);
        }
        responses
    }

    async fn handle_single_message(&self, incoming: Value) -> Option<Value> {
        let Some(obj) = incoming.as_object() else {
            return Some(error_response(
                Value::Null,
                RpcError::invalid_request("Request must be a JSON object"),
            ));
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            return Some(error_response(
                id,
                RpcError::invalid_request("jsonrpc must be '2.0'"),
            ));
        }

        let Some(method) = obj.get("method").and_then(Value::as_str) else {
            // A client response; this server never issues requests.
            return None;
        };

        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        match obj.get("id").cloned() {
            Some(id) => Some(match self.handle_request(method, params).await {
                Ok(payload) => success_response(id, payload),
                Err(err) => error_response(id, err),
            }),
            None => {
                tracing::debug!(method, "ignoring notification");
                None
            }
        }
    }

    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(self.initialize_payload()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(tools_list_payload()),
            "tools/call" => self.handle_tools_call(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "prompts/list" => Ok(json!({ "prompts": [] })),
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    fn initialize_payload(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "listChanged": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": MCP_SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            },
            "instructions": "Use whoAmI to identify the signed-in user, kustoQuery for ad-hoc KQL (URL-encode the query), and getRecentActiveFunctionApps for the canned recent-activity report. Every tool returns a single text result."
        })
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcError> {
        let params = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("tools/call params must be an object"))?;

        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("tools/call requires string field 'name'"))?;
        let tool = ToolName::parse(name)
            .ok_or_else(|| RpcError::invalid_params(format!("Unknown tool: {name}")))?;

        let args = match params.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            Some(Value::Null) | None => Map::new(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "tools/call 'arguments' must be an object",
                ));
            }
        };

        tracing::info!(tool = %tool, session_id = %self.session_id, "tool call");
        let outcome = self.handlers.invoke(tool, &args).await;
        Ok(build_tool_call_response(outcome))
    }
}

fn tools_list_payload() -> Value {
    let tools: Vec<Value> = tool_definitions()
        .into_iter()
        .map(|tool| {
            json!({
                "name": tool.name.as_str(),
                "description": tool.description,
                "inputSchema": tool.input_schema(),
                "toolProperties": tool.tool_properties(),
            })
        })
        .collect();
    json!({ "tools": tools })
}

fn flatten(outcome: Result<String, ToolError>) -> String {
    outcome.unwrap_or_else(|err| err.to_string())
}

fn build_tool_call_response(outcome: Result<String, ToolError>) -> Value {
    let is_error = outcome.is_err();
    json!({
        "content": [{ "type": "text", "text": flatten(outcome) }],
        "isError": is_error
    })
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: -32600,
            message: message.into(),
        }
    }

    fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("Method not found: {method}"),
        }
    }

    fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
        }
    }

    fn parse_error(message: impl Into<String>) -> Self {
        Self {
            code: -32700,
            message: message.into(),
        }
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

fn error_response(id: Value, error: RpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": error.code,
            "message": error.message
        }
    })
}

/// Read one message: either `Content-Length` framed or a single JSON line.
/// A payload that is not valid JSON is returned as a parse error; the stream stays usable.
async fn read_message<R>(
    reader: &mut R,
) -> Result<Option<(Result<Value, RpcError>, Framing)>, std::io::Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Unexpected EOF while reading MCP headers",
            ));
        }

        let trimmed = line.trim();
        if content_length.is_none() && (trimmed.starts_with('{') || trimmed.starts_with('[')) {
            let json = serde_json::from_str(trimmed).map_err(invalid_json);
            return Ok(Some((json, Framing::NewlineDelimited)));
        }
        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }

        if trimmed.to_ascii_lowercase().starts_with("content-length:") {
            let raw_len = trimmed
                .split_once(':')
                .map(|(_, right)| right.trim())
                .unwrap_or_default();
            let parsed = raw_len.parse::<usize>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "Invalid Content-Length header",
                )
            })?;
            content_length = Some(parsed);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Missing Content-Length header",
        )
    })?;
    let mut payload = vec![0_u8; content_length];
    reader.read_exact(&mut payload).await?;

    let json = serde_json::from_slice(&payload).map_err(invalid_json);
    Ok(Some((json, Framing::ContentLength)))
}

fn invalid_json(err: serde_json::Error) -> RpcError {
    RpcError::parse_error(format!("Invalid JSON payload: {err}"))
}

async fn write_message<W>(writer: &mut W, value: &Value, framing: Framing) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize JSON: {e}"),
        )
    })?;
    match framing {
        Framing::ContentLength => {
            let header = format!(
                "Content-Length: {}\r\nContent-Type: application/json\r\n\r\n",
                body.len()
            );
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&body).await?;
        }
        Framing::NewlineDelimited => {
            writer.write_all(&body).await?;
            writer.write_all(b"\n").await?;
        }
    }
    writer.flush().await?;
    Ok(())
}
