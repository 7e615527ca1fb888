#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tinymem-mcp** – Model Context Protocol server over stdio.
//!
//! Line-delimited JSON-RPC 2.0: one request per line in, one response per
//! line out. Implements `initialize`, `tools/list`, `tools/call`, `ping`,
//! `notifications/initialized`, and `shutdown`, exposing the memory tool
//! set. Malformed input produces a JSON-RPC error response and the loop
//! keeps serving; nothing a client sends can crash the server.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use tinymem_config::Config;
use tinymem_ledger::Ledger;
use tinymem_memory::{EvidenceVerifier, MemoryService, VerifierConfig};
use tinymem_recall::{CoVeConfig, CoVeFilter, RecallConfig, RecallEngine};
use tinymem_state::StateMachine;
use tinymem_store::Store;
use tinymem_types::Result;
use tinymem_upstream::ChatBackend;
use tinymem_vault::Vault;

pub mod ralph;
pub mod tools;

pub use tools::{McpState, Tool, ToolRegistry};

/// MCP protocol revision answered to `initialize`.
const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

/// The stdio server.
pub struct McpServer {
    state: McpState,
    registry: ToolRegistry,
}

impl McpServer {
    /// Assemble the server's services over an existing store.
    pub fn from_config(
        config: &Config,
        store: Store,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let vault = Vault::new(store.clone());
        let ledger = Ledger::new(store.clone());
        let memory = MemoryService::new(store.clone());
        let machine = StateMachine::new(store.clone(), ledger.clone(), ".");
        let verifier = EvidenceVerifier::new(VerifierConfig {
            timeout: Duration::from_secs(config.evidence.timeout_seconds),
            shell: config.evidence.shell.clone(),
            forbid_commands: config.evidence.forbid_commands.clone(),
            forbid_paths: config.evidence.forbid_paths.clone(),
            working_dir: None,
        });
        let cove = (config.cove.enabled && config.cove.recall_filter_enabled).then(|| {
            CoVeFilter::new(
                backend.clone(),
                store.clone(),
                CoVeConfig {
                    enabled: true,
                    confidence_threshold: config.cove.confidence_threshold,
                    max_candidates: config.cove.max_candidates,
                    timeout: Duration::from_secs(config.cove.timeout_seconds),
                },
            )
        });
        let recall = RecallEngine::new(
            store.clone(),
            RecallConfig {
                max_items: config.recall.max_items,
                max_tokens: config.recall.max_tokens,
                always_tier_fraction: config.recall.always_tier_fraction,
                timeout: Duration::from_secs(config.recall.timeout_seconds),
                metrics_enabled: config.metrics_enabled,
                dormant_after_hours: 168,
                tasks_path: Some(config.tasks_path()),
            },
            cove,
        );

        let state = McpState {
            store,
            vault,
            ledger,
            memory,
            verifier,
            recall,
            machine,
        };
        let registry = ToolRegistry::standard(backend);
        Self { state, registry }
    }

    /// The shared tool state (the CLI doctor reuses it).
    pub fn state(&self) -> &McpState {
        &self.state
    }

    /// Serve stdin/stdout until `shutdown` or EOF.
    pub async fn run_stdio(&self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.run(stdin, stdout).await
    }

    /// Serve any line-delimited transport until `shutdown` or EOF.
    pub async fn run<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        info!("mcp server ready");
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 {
                debug!("mcp transport closed");
                return Ok(());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let (response, exit) = self.handle_line(trimmed).await;
            if let Some(response) = response {
                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            if exit {
                info!("mcp server shutting down");
                return Ok(());
            }
        }
    }

    /// Handle one raw line. Returns the response (if one is owed) and
    /// whether the loop should exit.
    pub async fn handle_line(&self, line: &str) -> (Option<String>, bool) {
        let request: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                return (
                    Some(error_json(
                        serde_json::Value::Null,
                        PARSE_ERROR,
                        &format!("parse error: {e}"),
                    )),
                    false,
                )
            }
        };

        let id = request.get("id").cloned();
        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let params = request
            .get("params")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        debug!(method = %method, "mcp request");

        // Notifications (no id) never get a response.
        let is_notification = id.is_none();

        let (result, exit) = match method.as_str() {
            "initialize" => (
                Ok(serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {
                        "name": "tinymem",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
                false,
            ),
            "tools/list" => (
                Ok(serde_json::json!({"tools": self.registry.listing()})),
                false,
            ),
            "tools/call" => (self.call_tool(params).await, false),
            "ping" => (Ok(serde_json::json!({})), false),
            "notifications/initialized" => return (None, false),
            "shutdown" => (Ok(serde_json::Value::Null), true),
            other => (
                Err((METHOD_NOT_FOUND, format!("unknown method: {other}"))),
                false,
            ),
        };

        if is_notification {
            return (None, exit);
        }
        let id = id.unwrap_or(serde_json::Value::Null);
        let response = match result {
            Ok(result) => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            })
            .to_string(),
            Err((code, message)) => error_json(id, code, &message),
        };
        (Some(response), exit)
    }

    async fn call_tool(
        &self,
        params: serde_json::Value,
    ) -> std::result::Result<serde_json::Value, (i64, String)> {
        let name = params
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or((INVALID_PARAMS, "tools/call requires a name".to_string()))?;
        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        let Some(tool) = self.registry.get(name) else {
            return Err((INVALID_PARAMS, format!("unknown tool: {name}")));
        };

        // Tool failures are MCP tool results with isError, not protocol
        // errors: the client asked a valid question and got an answer.
        match tool.call(&self.state, arguments).await {
            Ok(result) => Ok(serde_json::json!({
                "content": [{"type": "text", "text": result.to_string()}],
                "isError": false,
            })),
            Err(e) => {
                warn!(tool = name, error = %e, "tool call failed");
                Ok(serde_json::json!({
                    "content": [{"type": "text", "text": e.to_string()}],
                    "isError": true,
                }))
            }
        }
    }
}

fn error_json(id: serde_json::Value, code: i64, message: &str) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tinymem_types::TinyMemError;

    struct OfflineBackend;

    #[async_trait]
    impl ChatBackend for OfflineBackend {
        async fn complete_text(&self, _system: &str, _user: &str) -> Result<String> {
            Err(TinyMemError::UpstreamUnreachable("offline".to_string()))
        }
    }

    async fn server() -> McpServer {
        let store = Store::in_memory().await.unwrap();
        McpServer::from_config(&Config::default(), store, Arc::new(OfflineBackend))
    }

    async fn roundtrip(server: &McpServer, request: serde_json::Value) -> serde_json::Value {
        let (response, _) = server.handle_line(&request.to_string()).await;
        serde_json::from_str(&response.expect("expected a response")).unwrap()
    }

    #[tokio::test]
    async fn initialize_and_list_the_tool_set() {
        let server = server().await;

        let init = roundtrip(
            &server,
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        )
        .await;
        assert_eq!(init["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["result"]["serverInfo"]["name"], "tinymem");

        let list = roundtrip(
            &server,
            serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        )
        .await;
        let tools: Vec<&str> = list["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            tools,
            vec![
                "memory_query",
                "memory_recent",
                "memory_write",
                "memory_stats",
                "memory_health",
                "memory_doctor",
                "memory_ralph",
            ]
        );
    }

    #[tokio::test]
    async fn write_then_query_roundtrip() {
        let server = server().await;

        let write = roundtrip(
            &server,
            serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "memory_write", "arguments": {
                    "kind": "note", "summary": "the proxy listens on 8787"
                }}
            }),
        )
        .await;
        assert_eq!(write["result"]["isError"], false);

        let query = roundtrip(
            &server,
            serde_json::json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": {"name": "memory_query", "arguments": {"query": "proxy 8787"}}
            }),
        )
        .await;
        assert_eq!(query["result"]["isError"], false);
        let text = query["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("the proxy listens on 8787"));
    }

    #[tokio::test]
    async fn fact_writes_without_evidence_are_refused() {
        let server = server().await;
        let response = roundtrip(
            &server,
            serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "memory_write", "arguments": {
                    "kind": "fact", "summary": "X is true"
                }}
            }),
        )
        .await;
        assert_eq!(response["result"]["isError"], true);
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        assert!(text.contains("require verified evidence"));
    }

    #[tokio::test]
    async fn malformed_input_gets_a_parse_error_and_the_loop_survives() {
        let server = server().await;

        let (response, exit) = server.handle_line("this is not json").await;
        let parsed: serde_json::Value = serde_json::from_str(&response.unwrap()).unwrap();
        assert_eq!(parsed["error"]["code"], PARSE_ERROR);
        assert!(!exit);

        // Still serving.
        let ping = roundtrip(
            &server,
            serde_json::json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}),
        )
        .await;
        assert!(ping["result"].is_object());
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let server = server().await;
        let (response, exit) = server
            .handle_line(
                &serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
                    .to_string(),
            )
            .await;
        assert!(response.is_none());
        assert!(!exit);
    }

    #[tokio::test]
    async fn unknown_methods_are_rejected() {
        let server = server().await;
        let response = roundtrip(
            &server,
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "nope"}),
        )
        .await;
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn shutdown_ends_the_loop() {
        let server = server().await;
        let input = format!(
            "{}\n{}\n",
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "shutdown"}),
        );
        let mut output: Vec<u8> = Vec::new();
        server
            .run(BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();

        let lines: Vec<&str> = std::str::from_utf8(&output)
            .unwrap()
            .lines()
            .collect();
        assert_eq!(lines.len(), 2);
        let last: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(last["id"], 2);
        assert!(last["result"].is_null());
    }

    #[tokio::test]
    async fn doctor_reports_healthy_on_a_fresh_store() {
        let server = server().await;
        let response = roundtrip(
            &server,
            serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "memory_doctor", "arguments": {}}
            }),
        )
        .await;
        let text = response["result"]["content"][0]["text"].as_str().unwrap();
        let doctor: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(doctor["healthy"], true);
    }
}
