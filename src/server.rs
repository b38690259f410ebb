// Copyright takubokudori.
// This source code is licensed under the MIT or Apache-2.0 license.
//! The MCP surface: newline-delimited JSON-RPC 2.0 over stdio.
//!
//! stdout carries protocol frames only; all logging goes to stderr. Tool
//! failures are not protocol errors: they come back as a normal response
//! with `isError: true`, keeping the JSON-RPC `error` member for protocol
//! faults (parse errors, unknown methods).
use crate::ops::Coordinator;
use crate::registry::{ToolContext, ToolRegistry};
use crate::types::*;
use crate::vmerr;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "vboxmcp";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;

pub struct McpServer {
    registry: ToolRegistry,
    ctx: Arc<ToolContext>,
    /// Request id of a long-running `tools/call` mapped to the operation
    /// it spawned, so `notifications/cancelled` can reach it.
    request_ops: Mutex<HashMap<String, String>>,
}

impl McpServer {
    pub fn new(registry: ToolRegistry, ctx: Arc<ToolContext>) -> Self {
        Self {
            registry,
            ctx,
            request_ops: Mutex::new(HashMap::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> { &self.ctx.coordinator }

    /// Reads frames until EOF. One request at a time: short calls are
    /// answered inline, long-running calls come back immediately with an
    /// operation handle and never block the loop.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> VmResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut writer = writer;
        loop {
            let line = lines.next_line().await.map_err(|e| {
                vmerr!(@e Internal, "stdin read failed: {}", e)
            })?;
            let Some(line) = line else {
                log::info!("stdin closed; shutting down");
                return Ok(());
            };
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_frame(&line).await {
                let mut payload =
                    serde_json::to_string(&response).map_err(|e| {
                        VmError::internal(format!(
                            "response serialization failed: {}",
                            e
                        ))
                    })?;
                payload.push('\n');
                writer.write_all(payload.as_bytes()).await.map_err(|e| {
                    vmerr!(@e Internal, "stdout write failed: {}", e)
                })?;
                writer.flush().await.map_err(|e| {
                    vmerr!(@e Internal, "stdout flush failed: {}", e)
                })?;
            }
        }
    }

    /// One frame in, at most one frame out (notifications get none).
    pub async fn handle_frame(&self, line: &str) -> Option<Value> {
        let msg: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("unparseable frame: {}", e);
                return Some(protocol_error(
                    Value::Null,
                    PARSE_ERROR,
                    &format!("parse error: {}", e),
                ));
            }
        };
        let id = msg.get("id").cloned();
        let method = match msg.get("method").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => {
                return Some(protocol_error(
                    id.unwrap_or(Value::Null),
                    INVALID_REQUEST,
                    "missing method",
                ))
            }
        };
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        if method == "notifications/cancelled" {
            self.handle_cancelled(&params);
            return None;
        }
        let id = match id {
            Some(id) => id,
            None => {
                // A request without id is a notification; nothing else we
                // serve is notification-shaped.
                log::debug!("ignoring notification {:?}", method);
                return None;
            }
        };

        let started = Instant::now();
        log::info!("request {} -> {}", render_id(&id), method);
        let response = match method.as_str() {
            "initialize" => ok_response(&id, self.initialize()),
            "ping" => ok_response(&id, json!({})),
            "tools/list" => ok_response(
                &id,
                json!({ "tools": self.registry.list() }),
            ),
            "tools/call" => self.call_tool(&id, params).await,
            _ => protocol_error(
                id.clone(),
                METHOD_NOT_FOUND,
                &format!("unknown method {:?}", method),
            ),
        };
        log::info!(
            "request {} <- {} ({:?}, {})",
            render_id(&id),
            method,
            started.elapsed(),
            if response.get("error").is_some() {
                "protocol-error"
            } else {
                "ok"
            }
        );
        Some(response)
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": SERVER_NAME,
                "version": SERVER_VERSION,
            },
            "capabilities": {
                "tools": {}
            }
        })
    }

    async fn call_tool(&self, id: &Value, params: Value) -> Value {
        let name = match params.get("name").and_then(Value::as_str) {
            Some(n) => n.to_string(),
            None => {
                return protocol_error(
                    id.clone(),
                    INVALID_REQUEST,
                    "tools/call requires a \"name\" parameter",
                )
            }
        };
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));

        match self.registry.call(&self.ctx, &name, arguments).await {
            Ok(result) => {
                if let Some(op) = result.get("operation_id").and_then(Value::as_str)
                {
                    self.request_ops
                        .lock()
                        .unwrap()
                        .insert(render_id(id), op.to_string());
                }
                ok_response(id, tool_content(&result, false))
            }
            Err(e) => {
                log::debug!("tool {} failed: {}", name, e);
                ok_response(id, tool_content(&e.to_envelope(), true))
            }
        }
    }

    fn handle_cancelled(&self, params: &Value) {
        let request_id = params
            .get("requestId")
            .map(render_id)
            .unwrap_or_default();
        let op = self.request_ops.lock().unwrap().get(&request_id).cloned();
        match op {
            Some(op_id) => {
                log::info!(
                    "cancellation for request {} -> operation {}",
                    request_id,
                    op_id
                );
                if let Err(e) = self.ctx.coordinator.cancel(&op_id) {
                    log::warn!("cancel {} failed: {}", op_id, e);
                }
            }
            None => log::debug!(
                "cancellation for unknown request {:?}",
                request_id
            ),
        }
    }
}

/// The MCP tool-result envelope: serialized JSON in one text block.
fn tool_content(payload: &Value, is_error: bool) -> Value {
    json!({
        "content": [{
            "type": "text",
            "text": payload.to_string(),
        }],
        "isError": is_error,
    })
}

fn ok_response(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn protocol_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

fn render_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
