//! The memory tools exposed over MCP.
//!
//! Each tool is a small adapter from JSON arguments onto a core service.
//! The fact gate is not re-implemented here: `memory_write` hands fact
//! payloads to the memory service's evidence path and inherits its
//! refusal semantics.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Row;
use tracing::debug;

use tinymem_ledger::Ledger;
use tinymem_memory::{EvidenceVerifier, MemoryService, NewMemory};
use tinymem_recall::RecallEngine;
use tinymem_state::StateMachine;
use tinymem_store::Store;
use tinymem_types::{EvidencePredicate, MemoryKind, Result, TinyMemError};
use tinymem_vault::{compute_hash, Vault};

/// Shared handles for the tool set.
#[derive(Clone)]
pub struct McpState {
    /// Store handle.
    pub store: Store,
    /// Artifact vault.
    pub vault: Vault,
    /// Append-only ledger.
    pub ledger: Ledger,
    /// Memory service.
    pub memory: MemoryService,
    /// Evidence verifier.
    pub verifier: EvidenceVerifier,
    /// Recall engine.
    pub recall: RecallEngine,
    /// Promotion state machine.
    pub machine: StateMachine,
}

/// One callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry name (snake_case).
    fn name(&self) -> &str;
    /// Human-readable description for `tools/list`.
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute with already-parsed arguments.
    async fn call(&self, state: &McpState, args: serde_json::Value) -> Result<serde_json::Value>;
}

/// Name-keyed registry. Built once at startup; tools are stateless over
/// the shared handles.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// The standard tinyMem tool set.
    pub fn standard(backend: Arc<dyn tinymem_upstream::ChatBackend>) -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
            order: Vec::new(),
        };
        registry.register(Arc::new(MemoryQuery));
        registry.register(Arc::new(MemoryRecent));
        registry.register(Arc::new(MemoryWrite));
        registry.register(Arc::new(MemoryStats));
        registry.register(Arc::new(MemoryHealth));
        registry.register(Arc::new(MemoryDoctor));
        registry.register(Arc::new(crate::ralph::MemoryRalph::new(backend)));
        registry
    }

    fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "registered mcp tool");
        self.order.push(name.clone());
        self.tools.insert(name, tool);
    }

    /// Look a tool up by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Tool descriptors for `tools/list`, in registration order.
    pub fn listing(&self) -> Vec<serde_json::Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.input_schema(),
                })
            })
            .collect()
    }
}

fn arg_str<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

fn project_id(args: &serde_json::Value) -> String {
    arg_str(args, "project_id").unwrap_or("default").to_string()
}

fn memory_to_json(memory: &tinymem_types::Memory) -> serde_json::Value {
    serde_json::json!({
        "id": memory.id.to_string(),
        "kind": memory.kind.as_str(),
        "summary": memory.summary,
        "detail": memory.detail,
        "key": memory.key,
        "recall_tier": memory.recall_tier.as_str(),
        "truth_state": memory.truth_state.as_str(),
        "classification": memory.classification,
        "updated_at": memory.updated_at.to_rfc3339(),
    })
}

//─────────────────────────────
//  memory_query
//─────────────────────────────

struct MemoryQuery;

#[async_trait]
impl Tool for MemoryQuery {
    fn name(&self) -> &str {
        "memory_query"
    }

    fn description(&self) -> &str {
        "Recall a bounded, tier-weighted slice of project memory for a query."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "project_id": {"type": "string"},
                "query": {"type": "string"},
            },
            "required": ["query"]
        })
    }

    async fn call(&self, state: &McpState, args: serde_json::Value) -> Result<serde_json::Value> {
        let query = arg_str(&args, "query").unwrap_or_default();
        let outcome = state
            .recall
            .recall(&project_id(&args), query, "mcp")
            .await?;
        Ok(serde_json::json!({
            "memories": outcome.memories.iter().map(memory_to_json).collect::<Vec<_>>(),
            "total_tokens": outcome.total_tokens,
        }))
    }
}

//─────────────────────────────
//  memory_recent
//─────────────────────────────

struct MemoryRecent;

#[async_trait]
impl Tool for MemoryRecent {
    fn name(&self) -> &str {
        "memory_recent"
    }

    fn description(&self) -> &str {
        "List the most recently updated live memories for a project."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "project_id": {"type": "string"},
                "limit": {"type": "integer"},
            }
        })
    }

    async fn call(&self, state: &McpState, args: serde_json::Value) -> Result<serde_json::Value> {
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
        let memories = state.memory.list(&project_id(&args)).await?;
        Ok(serde_json::json!({
            "memories": memories.iter().take(limit).map(memory_to_json).collect::<Vec<_>>(),
        }))
    }
}

//─────────────────────────────
//  memory_write
//─────────────────────────────

struct MemoryWrite;

#[async_trait]
impl Tool for MemoryWrite {
    fn name(&self) -> &str {
        "memory_write"
    }

    fn description(&self) -> &str {
        "Write a typed memory. Facts require evidence predicates, which are \
         verified transactionally before the row exists."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "project_id": {"type": "string"},
                "kind": {"type": "string", "enum": ["fact", "claim", "plan", "decision", "constraint", "observation", "note", "task"]},
                "summary": {"type": "string"},
                "detail": {"type": "string"},
                "key": {"type": "string"},
                "classification": {"type": "string"},
                "evidence": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Predicates in type::content form, e.g. file_exists::README.md"
                },
            },
            "required": ["kind", "summary"]
        })
    }

    async fn call(&self, state: &McpState, args: serde_json::Value) -> Result<serde_json::Value> {
        let kind: MemoryKind = arg_str(&args, "kind")
            .unwrap_or_default()
            .parse()
            .map_err(|_| TinyMemError::storage("kind is required"))?;
        let summary = arg_str(&args, "summary").unwrap_or_default();

        let mut new = NewMemory::new(project_id(&args), kind, summary);
        if let Some(detail) = arg_str(&args, "detail") {
            new = new.with_detail(detail);
        }
        if let Some(key) = arg_str(&args, "key") {
            new = new.with_key(key);
        }
        if let Some(classification) = arg_str(&args, "classification") {
            new = new.with_classification(classification);
        }

        let memory = if kind == MemoryKind::Fact {
            let predicates: Vec<EvidencePredicate> = args
                .get("evidence")
                .and_then(|v| v.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_str())
                        .map(EvidencePredicate::parse)
                        .collect::<Result<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            state
                .memory
                .create_fact_with_evidence(new, &predicates, &state.verifier)
                .await?
        } else {
            state.memory.create(new).await?
        };

        Ok(memory_to_json(&memory))
    }
}

//─────────────────────────────
//  memory_stats
//─────────────────────────────

struct MemoryStats;

#[async_trait]
impl Tool for MemoryStats {
    fn name(&self) -> &str {
        "memory_stats"
    }

    fn description(&self) -> &str {
        "Counts across the vault, ledger, entity map, and memory tables."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"project_id": {"type": "string"}}
        })
    }

    async fn call(&self, state: &McpState, args: serde_json::Value) -> Result<serde_json::Value> {
        let project = project_id(&args);

        let by_kind_rows = sqlx::query(
            "SELECT kind, COUNT(*) AS n FROM memories
             WHERE project_id = ? AND superseded_by IS NULL GROUP BY kind",
        )
        .bind(&project)
        .fetch_all(state.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
        let mut by_kind = serde_json::Map::new();
        for row in by_kind_rows {
            by_kind.insert(
                row.get::<String, _>("kind"),
                serde_json::json!(row.get::<i64, _>("n")),
            );
        }

        let entities = sqlx::query("SELECT COUNT(*) FROM entity_states")
            .fetch_one(state.store.reader())
            .await
            .map_err(TinyMemError::storage)?
            .get::<i64, _>(0);

        let cove = sqlx::query(
            "SELECT evaluated, discarded, avg_confidence, errors FROM cove_stats WHERE project_id = ?",
        )
        .bind(&project)
        .fetch_optional(state.store.reader())
        .await
        .map_err(TinyMemError::storage)?
        .map(|row| {
            serde_json::json!({
                "evaluated": row.get::<i64, _>("evaluated"),
                "discarded": row.get::<i64, _>("discarded"),
                "avg_confidence": row.get::<f64, _>("avg_confidence"),
                "errors": row.get::<i64, _>("errors"),
            })
        });

        Ok(serde_json::json!({
            "artifacts": state.vault.count().await?,
            "episodes": state.ledger.count_episodes().await?,
            "entities": entities,
            "memories_by_kind": by_kind,
            "cove": cove,
        }))
    }
}

//─────────────────────────────
//  memory_health
//─────────────────────────────

struct MemoryHealth;

#[async_trait]
impl Tool for MemoryHealth {
    fn name(&self) -> &str {
        "memory_health"
    }

    fn description(&self) -> &str {
        "Liveness probe: store reachability and journal/foreign-key modes."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn call(&self, state: &McpState, _args: serde_json::Value) -> Result<serde_json::Value> {
        let journal_mode: String = sqlx::query("PRAGMA journal_mode")
            .fetch_one(state.store.writer())
            .await
            .map_err(TinyMemError::storage)?
            .get(0);
        let foreign_keys: i64 = sqlx::query("PRAGMA foreign_keys")
            .fetch_one(state.store.writer())
            .await
            .map_err(TinyMemError::storage)?
            .get(0);
        Ok(serde_json::json!({
            "status": "ok",
            "journal_mode": journal_mode,
            "foreign_keys": foreign_keys == 1,
        }))
    }
}

//─────────────────────────────
//  memory_doctor
//─────────────────────────────

struct MemoryDoctor;

/// How many artifacts the doctor re-hashes per run.
const DOCTOR_SAMPLE: i64 = 100;

#[async_trait]
impl Tool for MemoryDoctor {
    fn name(&self) -> &str {
        "memory_doctor"
    }

    fn description(&self) -> &str {
        "Integrity checks: ledger replay vs the entity map, vault hash \
         spot-check, fact evidence invariant, FTS index sync."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn call(&self, state: &McpState, _args: serde_json::Value) -> Result<serde_json::Value> {
        let findings = run_doctor(state).await?;
        Ok(serde_json::json!({
            "healthy": findings.is_empty(),
            "findings": findings,
        }))
    }
}

/// The doctor's checks, shared with the CLI `doctor` subcommand.
pub async fn run_doctor(state: &McpState) -> Result<Vec<String>> {
    let mut findings = Vec::new();

    // 1. The entity map must equal the replayed transition log.
    findings.extend(state.machine.verify_replay().await?);

    // 2. Stored artifacts must still hash to their address.
    let rows = sqlx::query("SELECT hash, content FROM artifacts LIMIT ?")
        .bind(DOCTOR_SAMPLE)
        .fetch_all(state.store.reader())
        .await
        .map_err(TinyMemError::storage)?;
    for row in rows {
        let hash: String = row.get("hash");
        let content: Vec<u8> = row.get("content");
        if compute_hash(&content) != hash {
            findings.push(format!("artifact {hash}: content does not match its address"));
        }
    }

    // 3. Every live fact must carry verified evidence.
    let orphan_facts: i64 = sqlx::query(
        "SELECT COUNT(*) FROM memories m
         WHERE m.kind = 'fact' AND m.superseded_by IS NULL
           AND NOT EXISTS (SELECT 1 FROM evidence e WHERE e.memory_id = m.id AND e.verified = 1)",
    )
    .fetch_one(state.store.reader())
    .await
    .map_err(TinyMemError::storage)?
    .get(0);
    if orphan_facts > 0 {
        findings.push(format!("{orphan_facts} fact rows without verified evidence"));
    }

    // 4. The FTS index must cover exactly the memory rows.
    let drift: i64 = sqlx::query(
        "SELECT (SELECT COUNT(*) FROM memories) - (SELECT COUNT(*) FROM memories_fts)",
    )
    .fetch_one(state.store.reader())
    .await
    .map_err(TinyMemError::storage)?
    .get(0);
    if drift != 0 {
        findings.push(format!("fts index out of sync by {drift} rows"));
    }

    Ok(findings)
}
